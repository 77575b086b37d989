use std::{collections::HashSet, net::SocketAddr, str::FromStr, time::Duration};

use crate::{leader::LeaderConfig, mimir_client::MimirClientConfig};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum ConfigError {
    #[error("environment variable {0} must be set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Configuration {
    pub cluster_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub workers: usize,
    /// `None` means all namespaces.
    pub watch_namespaces: Option<HashSet<String>>,
    pub resync_period: Duration,
    pub cache_sync_timeout: Duration,
    pub metrics_addr: SocketAddr,
    pub mimir: MimirClientConfig,
}

fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
    if hs.is_empty() || hs.contains("*") || hs.contains("") {
        None
    } else {
        Some(hs)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.var(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.var(name) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn seconds(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parse(name, default)?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                name,
                value: secs.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from variables provided by `lookup`.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        let pod_name = env.required("POD_NAME")?;
        let pod_namespace = env.required("POD_NAMESPACE")?;
        let workers: usize = env.parse("WORKERS", 2)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKERS",
                value: workers.to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        let metrics_addr = format!(
            "{}:{}",
            env.var("METRICS_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            env.var("METRICS_LISTEN_PORT")
                .unwrap_or_else(|| "9000".to_string())
        );
        let metrics_addr = metrics_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "METRICS_LISTEN_ADDR",
                reason: e.to_string(),
                value: metrics_addr.clone(),
            })?;
        let configuration = Configuration {
            cluster_name: env
                .var("CLUSTER_NAME")
                .unwrap_or_else(|| "default".to_string()),
            lease_name: env
                .var("LEASE_LOCK_NAME")
                .unwrap_or_else(|| "mimir-rules-controller".to_string()),
            lease_namespace: env
                .var("LEASE_LOCK_NAMESPACE")
                .unwrap_or_else(|| pod_namespace.clone()),
            pod_name,
            pod_namespace,
            lease_duration: env.seconds("LEASE_DURATION_SECONDS", 15)?,
            renew_deadline: env.seconds("LEASE_RENEW_DEADLINE_SECONDS", 10)?,
            retry_period: env.seconds("LEASE_RETRY_PERIOD_SECONDS", 2)?,
            workers,
            watch_namespaces: env
                .var("WATCH_NAMESPACES")
                .and_then(|v| normalize(v.split(',').map(|v| v.trim().to_string()).collect())),
            resync_period: env.seconds("RESYNC_PERIOD_SECONDS", 30)?,
            cache_sync_timeout: env.seconds("CACHE_SYNC_TIMEOUT_SECONDS", 120)?,
            metrics_addr,
            mimir: MimirClientConfig {
                address: env.required("MIMIR_ADDRESS")?,
                tenant_id: env.var("MIMIR_TENANT_ID"),
                user: env.var("MIMIR_USER"),
                key: env.var("MIMIR_KEY"),
                auth_token: env.var("MIMIR_AUTH_TOKEN"),
                use_legacy_routes: env.parse("MIMIR_USE_LEGACY_ROUTES", false)?,
            },
        };
        if configuration.lease_duration <= configuration.renew_deadline {
            return Err(ConfigError::Invalid {
                name: "LEASE_RENEW_DEADLINE_SECONDS",
                value: configuration.renew_deadline.as_secs().to_string(),
                reason: "must be less than LEASE_DURATION_SECONDS".to_string(),
            });
        }
        let mimir = &configuration.mimir;
        if mimir.key.is_some() && mimir.user.is_none() && mimir.tenant_id.is_none() {
            return Err(ConfigError::Invalid {
                name: "MIMIR_KEY",
                value: "***".to_string(),
                reason: "basic auth requires MIMIR_USER or MIMIR_TENANT_ID".to_string(),
            });
        }
        Ok(configuration)
    }

    /// Identity used for the lease, `<podNamespace>-<podName>`.
    pub fn identity(&self) -> String {
        format!("{}-{}", self.pod_namespace, self.pod_name)
    }

    pub fn leader_config(&self) -> LeaderConfig {
        LeaderConfig {
            identity: self.identity(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}
