//! Client for the Mimir ruler configuration API.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use mimir_rules_controller_apis::RemoteRuleGroup;
use reqwest::{Method, RequestBuilder, StatusCode, Url, header::CONTENT_TYPE};
use serde::Deserialize;

const RULES_PREFIX: &'static str = "prometheus/config/v1/rules";
const LEGACY_RULES_PREFIX: &'static str = "api/v1/rules";
const TENANT_HEADER: &'static str = "X-Scope-OrgID";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub(crate) enum RuleClientError {
    #[error("invalid ruler address {0:?}")]
    InvalidAddress(String),
    #[error("ruler request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ruler responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid rule group YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Remote rule service, rule groups are addressed by namespace key and group name.
#[async_trait]
pub(crate) trait RuleClient: Send + Sync {
    /// Create or replace a rule group.
    async fn create_rule_group(
        &self,
        namespace: &str,
        group: &RemoteRuleGroup,
    ) -> Result<(), RuleClientError>;

    /// Names of the groups stored under `namespace`, empty if there are none.
    async fn list_rule_groups(&self, namespace: &str) -> Result<Vec<String>, RuleClientError>;

    /// Delete a rule group, deleting an absent group is not an error.
    async fn delete_rule_group(&self, namespace: &str, group: &str)
    -> Result<(), RuleClientError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct MimirClientConfig {
    pub address: String,
    pub tenant_id: Option<String>,
    pub user: Option<String>,
    pub key: Option<String>,
    pub auth_token: Option<String>,
    pub use_legacy_routes: bool,
}

pub(crate) struct MimirClient {
    address: Url,
    config: MimirClientConfig,
    client: reqwest::Client,
}

impl MimirClient {
    pub fn new(config: MimirClientConfig) -> Result<Self, RuleClientError> {
        let address = Url::parse(config.address.as_str())
            .ok()
            .filter(|u| !u.cannot_be_a_base() && matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| RuleClientError::InvalidAddress(config.address.clone()))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            address,
            config,
            client,
        })
    }

    fn rules_url(&self, segments: &[&str]) -> Result<Url, RuleClientError> {
        let prefix = if self.config.use_legacy_routes {
            LEGACY_RULES_PREFIX
        } else {
            RULES_PREFIX
        };
        let mut url = self.address.clone();
        url.path_segments_mut()
            .map_err(|_| RuleClientError::InvalidAddress(self.config.address.clone()))?
            .pop_if_empty()
            .extend(prefix.split('/'))
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(tenant) = &self.config.tenant_id {
            request = request.header(TENANT_HEADER, tenant);
        }
        match (&self.config.user, &self.config.key, &self.config.tenant_id) {
            (Some(user), key, _) => request = request.basic_auth(user, key.as_ref()),
            (None, Some(key), Some(tenant)) => request = request.basic_auth(tenant, Some(key)),
            _ => (),
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        request
    }
}

async fn status_error(response: reqwest::Response) -> RuleClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RuleClientError::Status { status, body }
}

async fn check(response: reqwest::Response, allow_not_found: bool) -> Result<(), RuleClientError> {
    let status = response.status();
    if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
        return Ok(());
    }
    Err(status_error(response).await)
}

/// Only the name of a listed group is of interest.
#[derive(Deserialize)]
struct ListedGroup {
    name: String,
}

#[async_trait]
impl RuleClient for MimirClient {
    async fn create_rule_group(
        &self,
        namespace: &str,
        group: &RemoteRuleGroup,
    ) -> Result<(), RuleClientError> {
        let url = self.rules_url(&[namespace])?;
        let body = group.to_yaml()?;
        debug!("POST {} rule group {}", url, group.name);
        let response = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, "application/yaml")
            .body(body)
            .send()
            .await?;
        check(response, false).await
    }

    async fn list_rule_groups(&self, namespace: &str) -> Result<Vec<String>, RuleClientError> {
        let url = self.rules_url(&[namespace])?;
        debug!("GET {}", url);
        let response = self.request(Method::GET, url).send().await?;
        // the ruler answers 404 for a namespace without groups
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.text().await?;
        let listed: Option<BTreeMap<String, Vec<ListedGroup>>> = serde_yaml::from_str(&body)?;
        Ok(listed
            .and_then(|mut namespaces| namespaces.remove(namespace))
            .unwrap_or_default()
            .into_iter()
            .map(|g| g.name)
            .collect())
    }

    async fn delete_rule_group(
        &self,
        namespace: &str,
        group: &str,
    ) -> Result<(), RuleClientError> {
        let url = self.rules_url(&[namespace, group])?;
        debug!("DELETE {}", url);
        let response = self.request(Method::DELETE, url).send().await?;
        check(response, true).await
    }
}
