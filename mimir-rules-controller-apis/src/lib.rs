use std::collections::BTreeMap;

use k8s_openapi::{
    apimachinery::pkg::util::intstr::IntOrString,
    chrono::{SecondsFormat, Utc},
};
use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod duration;
mod namespace;

pub use duration::{DurationError, format_duration, parse_duration};
pub use namespace::{
    RemoteRule, RemoteRuleGroup, RuleNamespace, TranslationError, ValidationError,
};

pub const API_GROUP: &'static str = "rulescontroller.k8s.healthjoy.com";

/// The K8s finalizer name.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. So, think twice before you rename it, otherwise users might
/// be stuck with MimirRule objects which cannot be deleted.
pub const FINALIZER: &'static str = "mimirrule.finalizers.k8s.healthjoy.com";

/// Condition type set once all rule groups have been applied.
pub const READY: &'static str = "Ready";
/// Condition type set when translating, validating or applying the rule groups failed.
pub const FAILED: &'static str = "Failed";

pub const SUCCESS: &'static str = "Success";
pub const ERROR: &'static str = "Error";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// A set of Mimir (Prometheus compatible) recording and alerting rule groups,
/// which are kept in sync with the Mimir ruler.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rulescontroller.k8s.healthjoy.com",
    version = "v1alpha1",
    kind = "MimirRule",
    derive = "PartialEq",
    status = "MimirRuleStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether all rule groups have been applied to the Mimir ruler."
    }"#,
    printcolumn = r#"{
        "name":"Failed",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Failed\")].status",
        "description": "Whether the last synchronization attempt failed."
    }"#
)]
pub struct MimirRuleSpec {
    /// The rule groups, evaluated independently of each other by the ruler.
    pub groups: Vec<RuleGroup>,
}

/// A list of sequentially evaluated recording and alerting rules.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct RuleGroup {
    pub name: String,
    /// Evaluation interval, e.g. `1m`. Defaults to the ruler's global interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Delay applied to the evaluation timestamp, e.g. `30s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_delay: Option<String>,
    /// Maximum number of alerts or series a rule may produce, 0 means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    pub rules: Vec<Rule>,
    /// Tenants to query from (federated rule groups).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tenants: Vec<String>,
}

/// A recording rule (`record`) or an alerting rule (`alert`).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct Rule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: IntOrString,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    pub fn record(&self) -> Option<&str> {
        self.record.as_deref().filter(|v| !v.is_empty())
    }

    pub fn alert(&self) -> Option<&str> {
        self.alert.as_deref().filter(|v| !v.is_empty())
    }

    pub fn expr(&self) -> String {
        match &self.expr {
            IntOrString::Int(v) => v.to_string(),
            IntOrString::String(v) => v.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct MimirRuleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl MimirRuleStatus {
    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == tpe)
    }

    /// Insert or replace the condition of the same type. The transition time
    /// is only stamped if the status changed, and a condition observed at an
    /// older generation than the stored one is ignored.
    ///
    /// Returns `true` if the conditions changed.
    pub fn set_condition(&mut self, mut c: Condition) -> bool {
        match self.conditions.iter_mut().find(|v| v.type_ == c.type_) {
            Some(existing) => {
                if let (Some(current), Some(new)) =
                    (existing.observed_generation, c.observed_generation)
                {
                    if new < current {
                        return false;
                    }
                }
                c.last_transition_time = if existing.status != c.status {
                    Some(now())
                } else {
                    existing.last_transition_time.clone()
                };
                if *existing == c {
                    false
                } else {
                    *existing = c;
                    true
                }
            }
            None => {
                c.last_transition_time = Some(now());
                self.conditions.push(c);
                true
            }
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl MimirRule {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }

    /// The key addressing this object's rule groups in the ruler,
    /// `<cluster>:<namespace>:<name>`.
    pub fn namespace_key(&self, cluster: &str) -> String {
        format!(
            "{}:{}:{}",
            cluster,
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.name_any()
        )
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f.as_str() == FINALIZER)
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.condition(tpe))
    }

    pub fn set_condition(&mut self, c: Condition) -> bool {
        self.status
            .get_or_insert_with(MimirRuleStatus::default)
            .set_condition(c)
    }

    /// Translate the spec into the ruler's addressing scheme.
    pub fn rule_namespace(&self, cluster: &str) -> Result<RuleNamespace, TranslationError> {
        RuleNamespace::from_spec(self.namespace_key(cluster), &self.spec)
    }
}
