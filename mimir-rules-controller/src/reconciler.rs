use std::{sync::Arc, time::Instant};

use kube::ResourceExt;
use mimir_rules_controller_apis::{FINALIZER, MimirRule, READY, RuleNamespace};

use crate::{
    cache::{NamespacedName, RuleCache},
    errors::ControllerError,
    lint::ExpressionLinter,
    metrics::SyncMetrics,
    mimir_client::RuleClient,
    status::StatusReporter,
    store::RuleStore,
};

/// What a successful [`Reconciler::sync`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SyncAction {
    /// The object no longer exists.
    NotFound,
    /// The current generation has already been applied.
    UpToDate,
    /// Deleted object without our finalizer, nothing to clean up.
    DeletionIgnored,
    FinalizerAdded,
    /// Rule groups deleted from the ruler and finalizer removed.
    Cleaned { groups: usize },
    /// Rule groups created or replaced in the ruler, and stale groups deleted.
    Applied { groups: usize, pruned: usize },
}

/// Result of a sync, keeping apart the failure of the sync itself and the
/// failure to write back the status afterwards.
#[derive(Debug)]
pub(crate) struct SyncOutcome {
    pub result: Result<SyncAction, ControllerError>,
    pub persist_error: Option<ControllerError>,
}

impl SyncOutcome {
    fn ok(action: SyncAction) -> Self {
        Self {
            result: Ok(action),
            persist_error: None,
        }
    }

    pub fn into_result(self) -> Result<SyncAction, ControllerError> {
        match (self.result, self.persist_error) {
            (result, None) => result,
            (Ok(_), Some(persist)) => Err(persist),
            (Err(primary), Some(persist)) => Err(ControllerError::WithPersistFailure {
                primary: Box::new(primary),
                persist: Box::new(persist),
            }),
        }
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err() || self.persist_error.is_some()
    }
}

impl From<Result<SyncAction, ControllerError>> for SyncOutcome {
    fn from(result: Result<SyncAction, ControllerError>) -> Self {
        Self {
            result,
            persist_error: None,
        }
    }
}

/// Converges the ruler with one [`MimirRule`] per call.
pub(crate) struct Reconciler {
    cluster_name: String,
    cache: RuleCache,
    client: Arc<dyn RuleClient>,
    store: Arc<dyn RuleStore>,
    linter: Arc<dyn ExpressionLinter>,
    metrics: Arc<dyn SyncMetrics>,
}

/// `true` if the current generation was applied successfully.
fn is_up_to_date(rule: &MimirRule) -> bool {
    rule.condition(READY).is_some_and(|c| {
        c.is_true() && c.observed_generation.unwrap_or(0) >= rule.generation()
    })
}

impl Reconciler {
    pub fn new(
        cluster_name: String,
        cache: RuleCache,
        client: Arc<dyn RuleClient>,
        store: Arc<dyn RuleStore>,
        linter: Arc<dyn ExpressionLinter>,
        metrics: Arc<dyn SyncMetrics>,
    ) -> Self {
        Self {
            cluster_name,
            cache,
            client,
            store,
            linter,
            metrics,
        }
    }

    /// Sync the object with key `namespace/name`.
    pub async fn sync(&self, key: &str) -> SyncOutcome {
        let key: NamespacedName = match key.parse() {
            Ok(key) => key,
            Err(e) => {
                return SyncOutcome {
                    result: Err(e),
                    persist_error: None,
                };
            }
        };
        let Some(rule) = self.cache.get(&key) else {
            debug!("MimirRule {} no longer exists", key);
            return SyncOutcome::ok(SyncAction::NotFound);
        };
        // deleting objects are never up to date, the cleanup must run
        if !rule.is_deleted() && is_up_to_date(&rule) {
            debug!("MimirRule {} is up to date", rule.versioned_id());
            return SyncOutcome::ok(SyncAction::UpToDate);
        }
        let start = Instant::now();
        let outcome = self.sync_rule(rule.as_ref().clone()).await;
        self.metrics.record_sync(start.elapsed(), outcome.is_err());
        outcome
    }

    async fn sync_rule(&self, rule: MimirRule) -> SyncOutcome {
        if rule.is_deleted() {
            if !rule.has_finalizer() {
                return SyncOutcome::ok(SyncAction::DeletionIgnored);
            }
            return self.cleanup(&rule).await.into();
        }
        if !rule.has_finalizer() {
            let mut finalizers = rule.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            return self
                .store
                .update_finalizers(&rule, finalizers)
                .await
                .map(|_| {
                    debug!("added finalizer to MimirRule {}", rule.id());
                    SyncAction::FinalizerAdded
                })
                .into();
        }
        let mut status = StatusReporter::new(rule);
        let result = self.apply(&status).await;
        match &result {
            Ok(SyncAction::Applied { groups, .. }) => {
                status.ready(format!("{} rule group(s) applied", groups));
            }
            Ok(_) => (),
            Err(e) => status.failed(e.to_string()),
        }
        let persist_error = status.persist(self.store.as_ref()).await.err();
        SyncOutcome {
            result,
            persist_error,
        }
    }

    /// Delete all rule groups named in the spec, then release the object.
    async fn cleanup(&self, rule: &MimirRule) -> Result<SyncAction, ControllerError> {
        let namespace = rule.namespace_key(&self.cluster_name);
        for group in &rule.spec.groups {
            self.client
                .delete_rule_group(&namespace, &group.name)
                .await
                .map_err(|source| ControllerError::RemoteDelete {
                    group: group.name.clone(),
                    source,
                })?;
        }
        let finalizers = rule
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.store.update_finalizers(rule, finalizers).await?;
        info!(
            "deleted {} rule group(s) of MimirRule {} from {}",
            rule.spec.groups.len(),
            rule.id(),
            namespace
        );
        Ok(SyncAction::Cleaned {
            groups: rule.spec.groups.len(),
        })
    }

    /// Translate, validate and lint the spec, then apply all groups in order.
    async fn apply(&self, rule: &MimirRule) -> Result<SyncAction, ControllerError> {
        let namespace = rule.rule_namespace(&self.cluster_name)?;
        let errors = namespace.validate();
        if !errors.is_empty() {
            return Err(ControllerError::Validation(errors));
        }
        for group in &namespace.groups {
            for r in &group.rules {
                self.linter
                    .lint(&r.expr)
                    .map_err(|source| ControllerError::Lint {
                        group: group.name.clone(),
                        rule: r.identifier().to_string(),
                        source,
                    })?;
            }
        }
        for group in &namespace.groups {
            self.client
                .create_rule_group(&namespace.namespace, group)
                .await
                .map_err(|source| ControllerError::RemoteApply {
                    group: group.name.clone(),
                    source,
                })?;
        }
        let pruned = self.prune(&namespace).await?;
        info!(
            "applied {} rule group(s) of MimirRule {} to {}, pruned {}",
            namespace.groups.len(),
            rule.versioned_id(),
            namespace.namespace,
            pruned
        );
        Ok(SyncAction::Applied {
            groups: namespace.groups.len(),
            pruned,
        })
    }

    /// Delete the groups held by the ruler under `namespace` which are no
    /// longer part of it.
    async fn prune(&self, namespace: &RuleNamespace) -> Result<usize, ControllerError> {
        let remote = self
            .client
            .list_rule_groups(&namespace.namespace)
            .await
            .map_err(|source| ControllerError::RemoteList {
                namespace: namespace.namespace.clone(),
                source,
            })?;
        let mut pruned = 0;
        for name in remote
            .iter()
            .filter(|name| !namespace.groups.iter().any(|g| &g.name == *name))
        {
            self.client
                .delete_rule_group(&namespace.namespace, name)
                .await
                .map_err(|source| ControllerError::RemoteDelete {
                    group: name.clone(),
                    source,
                })?;
            debug!("pruned rule group {} from {}", name, namespace.namespace);
            pruned += 1;
        }
        Ok(pruned)
    }
}
