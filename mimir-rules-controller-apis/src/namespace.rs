//! Translation of a [`MimirRuleSpec`] into the ruler's representation.

use std::{collections::BTreeMap, collections::HashSet, fmt, time::Duration};

use serde::{Serialize, Serializer};

use crate::{
    MimirRuleSpec, Rule,
    duration::{DurationError, format_duration, parse_duration},
};

/// A `MimirRuleSpec` could not be translated, e.g. because of an invalid duration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("group {group:?}: invalid {field}: {source}")]
pub struct TranslationError {
    pub group: String,
    pub field: String,
    #[source]
    pub source: DurationError,
}

/// A structurally invalid rule group or rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub group: String,
    /// Index of the offending rule within its group, `None` for group level errors.
    pub rule: Option<usize>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule {
            Some(idx) => write!(f, "group {:?}, rule {}: {}", self.group, idx, self.message),
            None => write!(f, "group {:?}: {}", self.group, self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// All rule groups of one `MimirRule`, addressed by `<cluster>:<namespace>:<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleNamespace {
    pub namespace: String,
    pub groups: Vec<RemoteRuleGroup>,
}

/// Rule group as understood by the ruler API (YAML).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RemoteRuleGroup {
    pub name: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_duration"
    )]
    pub interval: Option<Duration>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_duration"
    )]
    pub evaluation_delay: Option<Duration>,
    #[serde(skip_serializing_if = "is_zero")]
    pub limit: i64,
    pub rules: Vec<RemoteRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_tenants: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RemoteRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(
        rename = "for",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_duration"
    )]
    pub for_: Option<Duration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn serialize_duration<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_str(&format_duration(*d)),
        None => s.serialize_none(),
    }
}

fn optional_duration(
    group: &str,
    field: String,
    value: Option<&str>,
) -> Result<Option<Duration>, TranslationError> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => parse_duration(v)
            .map(Some)
            .map_err(|source| TranslationError {
                group: group.to_string(),
                field,
                source,
            }),
        None => Ok(None),
    }
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl RemoteRule {
    fn from_spec(group: &str, idx: usize, rule: &Rule) -> Result<Self, TranslationError> {
        Ok(Self {
            record: rule.record().map(str::to_string),
            alert: rule.alert().map(str::to_string),
            expr: rule.expr(),
            for_: optional_duration(group, format!("rules[{}].for", idx), rule.for_.as_deref())?,
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
        })
    }

    fn validate(&self, group: &str, idx: usize, errors: &mut Vec<ValidationError>) {
        let mut error = |message: String| {
            errors.push(ValidationError {
                group: group.to_string(),
                rule: Some(idx),
                message,
            })
        };
        match (&self.record, &self.alert) {
            (None, None) => error("one of 'record' or 'alert' must be set".to_string()),
            (Some(_), Some(_)) => error("only one of 'record' or 'alert' must be set".to_string()),
            (Some(record), None) => {
                if !is_metric_name(record) {
                    error(format!("invalid recording rule name: {}", record));
                }
                if self.for_.is_some() {
                    error("invalid field 'for' in recording rule".to_string());
                }
                if !self.annotations.is_empty() {
                    error("invalid field 'annotations' in recording rule".to_string());
                }
            }
            (None, Some(_)) => (),
        }
        if self.expr.trim().is_empty() {
            error("field 'expr' must be set in rule".to_string());
        }
        for name in self.labels.keys().filter(|k| !is_label_name(k)) {
            error(format!("invalid label name: {}", name));
        }
    }

    /// Human readable identifier used in error messages.
    pub fn identifier(&self) -> &str {
        self.alert
            .as_deref()
            .or(self.record.as_deref())
            .unwrap_or("<unnamed>")
    }
}

impl RuleNamespace {
    pub fn from_spec(namespace: String, spec: &MimirRuleSpec) -> Result<Self, TranslationError> {
        let groups = spec
            .groups
            .iter()
            .map(|g| -> Result<RemoteRuleGroup, TranslationError> {
                let rules = g
                    .rules
                    .iter()
                    .enumerate()
                    .map(|(idx, r)| RemoteRule::from_spec(&g.name, idx, r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RemoteRuleGroup {
                    name: g.name.clone(),
                    interval: optional_duration(&g.name, "interval".to_string(), g.interval.as_deref())?,
                    evaluation_delay: optional_duration(
                        &g.name,
                        "evaluation_delay".to_string(),
                        g.evaluation_delay.as_deref(),
                    )?,
                    limit: g.limit.unwrap_or(0),
                    rules,
                    source_tenants: g.source_tenants.clone(),
                })
            })
            .collect::<Result<Vec<_>, TranslationError>>()?;
        Ok(Self { namespace, groups })
    }

    /// Structural validation, returns all violations.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                errors.push(ValidationError {
                    group: group.name.clone(),
                    rule: None,
                    message: "group name must not be empty".to_string(),
                });
            } else if !seen.insert(group.name.as_str()) {
                errors.push(ValidationError {
                    group: group.name.clone(),
                    rule: None,
                    message: format!("group name {} is repeated", group.name),
                });
            }
            for (idx, rule) in group.rules.iter().enumerate() {
                rule.validate(&group.name, idx, &mut errors);
            }
        }
        errors
    }
}

impl RemoteRuleGroup {
    /// The YAML document accepted by the ruler API.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
