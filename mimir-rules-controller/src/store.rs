use async_trait::async_trait;
use json_patch::{PatchOperation, diff};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams, PostParams},
};
use mimir_rules_controller_apis::MimirRule;

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

/// Write path for [`MimirRule`] objects. Every write is eventually observed
/// again through the watch stream feeding the cache.
#[async_trait]
pub(crate) trait RuleStore: Send + Sync {
    /// Replace the finalizers of `rule`, leaving everything else untouched.
    async fn update_finalizers(
        &self,
        rule: &MimirRule,
        finalizers: Vec<String>,
    ) -> Result<MimirRule, ControllerError>;

    /// Replace the status subresource of `rule`. Fails with a conflict if the
    /// object changed since `rule` was read.
    async fn update_status(&self, rule: &MimirRule) -> Result<MimirRule, ControllerError>;
}

/// JSON Patch turning the finalizers of `original` into those of `modified`.
///
/// Server-side apply would only remove list entries owned by our field manager,
/// and a plain diff is index based. The patch therefore starts with a test of
/// the resourceVersion that was read, so it is rejected once the object changed
/// on the server and never touches finalizers added by others in the meantime.
fn finalizer_patch(
    original: &MimirRule,
    modified: &MimirRule,
) -> Result<json_patch::Patch, serde_json::Error> {
    let mut patch = diff(
        &serde_json::to_value(original)?,
        &serde_json::to_value(modified)?,
    );
    if let (false, Some(version)) = (patch.0.is_empty(), original.resource_version()) {
        let guard: PatchOperation = serde_json::from_value(serde_json::json!({
            "op": "test",
            "path": "/metadata/resourceVersion",
            "value": version,
        }))?;
        patch.0.insert(0, guard);
    }
    Ok(patch)
}

pub(crate) struct KubeRuleStore {
    client: Client,
}

impl KubeRuleStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, rule: &MimirRule) -> Api<MimirRule> {
        match rule.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl RuleStore for KubeRuleStore {
    async fn update_finalizers(
        &self,
        rule: &MimirRule,
        finalizers: Vec<String>,
    ) -> Result<MimirRule, ControllerError> {
        let mut modified = rule.clone();
        modified.metadata.finalizers = Some(finalizers);
        let patch = finalizer_patch(rule, &modified)?;
        if patch.0.is_empty() {
            return Ok(modified);
        }
        let removing = modified.finalizers().len() < rule.finalizers().len();
        match self
            .api(rule)
            .patch(
                rule.name_any().as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<MimirRule>::Json(patch),
            )
            .await
        {
            Ok(updated) => Ok(updated),
            // the object is gone as soon as its last finalizer is removed
            Err(e) if removing && e.is_not_found() => Ok(modified),
            Err(e) => Err(ControllerError::Persist(e)),
        }
    }

    async fn update_status(&self, rule: &MimirRule) -> Result<MimirRule, ControllerError> {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        self.api(rule)
            .replace_status(rule.name_any().as_str(), &pp, serde_json::to_vec(rule)?)
            .await
            .map_err(ControllerError::Persist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rule;
    use mimir_rules_controller_apis::FINALIZER;
    use serde_json::Value;

    fn with_finalizers(version: &str, finalizers: &[&str]) -> MimirRule {
        let mut obj = rule("ns", "r1", 1);
        obj.metadata.resource_version = Some(version.to_string());
        if !finalizers.is_empty() {
            obj.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        obj
    }

    /// Apply the patch computed from `read` to `server`, like the API server would.
    fn apply(read: &MimirRule, finalizers: &[&str], server: &MimirRule) -> Result<Value, Value> {
        let mut modified = read.clone();
        modified.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        let patch = finalizer_patch(read, &modified).unwrap();
        let mut doc = serde_json::to_value(server).unwrap();
        let before = doc.clone();
        match json_patch::patch(&mut doc, &patch.0) {
            Ok(()) => Ok(doc["metadata"]["finalizers"].clone()),
            Err(_) => Err(before["metadata"]["finalizers"].clone()),
        }
    }

    #[test]
    fn unchanged_finalizers_yield_empty_patch() {
        let obj = with_finalizers("1", &[FINALIZER]);
        assert!(finalizer_patch(&obj, &obj.clone()).unwrap().0.is_empty());
    }

    #[test]
    fn current_object_is_patched() {
        let read = with_finalizers("7", &["a", "b", FINALIZER]);
        assert_eq!(
            Ok(serde_json::json!(["a", "b"])),
            apply(&read, &["a", "b"], &read)
        );
        let read = with_finalizers("7", &[]);
        assert_eq!(
            Ok(serde_json::json!([FINALIZER])),
            apply(&read, &[FINALIZER], &read)
        );
    }

    #[test]
    fn stale_add_keeps_foreign_finalizers() {
        let read = with_finalizers("1", &[]);
        let server = with_finalizers("2", &["other.io/cleanup"]);
        assert_eq!(
            Err(serde_json::json!(["other.io/cleanup"])),
            apply(&read, &[FINALIZER], &server)
        );
    }

    #[test]
    fn stale_remove_keeps_foreign_finalizers() {
        let read = with_finalizers("1", &["a", FINALIZER]);
        let server = with_finalizers("2", &["a", "b", FINALIZER]);
        assert_eq!(
            Err(serde_json::json!(["a", "b", FINALIZER])),
            apply(&read, &["a"], &server)
        );
    }
}
