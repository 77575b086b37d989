use json_patch::diff;
use mimir_rules_controller_apis::{Condition, ERROR, FAILED, MimirRule, READY, SUCCESS};
use std::ops::DerefMut;

use crate::{errors::ControllerError, store::RuleStore};

/// Helper construct to track condition changes of a [`MimirRule`] and write
/// them back only if something actually changed.
pub(crate) struct StatusReporter {
    original: MimirRule,
    pub modified: MimirRule,
}

impl std::ops::Deref for StatusReporter {
    type Target = MimirRule;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for StatusReporter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl StatusReporter {
    pub(crate) fn new(original: MimirRule) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    /// Replace the condition of type `tpe`. Returns `true` if the status changed.
    pub(crate) fn set_condition(
        &mut self,
        tpe: &str,
        observed_generation: i64,
        ok: bool,
        reason: &str,
        message: String,
    ) -> bool {
        self.modified.set_condition(
            Condition::new(tpe, Some(ok), reason, message)
                .with_observed_generation(observed_generation),
        )
    }

    /// Record a successful sync of the current generation.
    pub(crate) fn ready(&mut self, message: String) {
        let generation = self.generation();
        if self.condition(FAILED).is_some() {
            self.set_condition(FAILED, generation, false, SUCCESS, message.clone());
        }
        self.set_condition(READY, generation, true, SUCCESS, message);
    }

    /// Record a failed sync of the current generation, `Ready` keeps pointing
    /// to the last generation that was applied.
    pub(crate) fn failed(&mut self, message: String) {
        let generation = self.generation();
        self.set_condition(FAILED, generation, true, ERROR, message);
    }

    fn get_status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.get_status_patch()?.is_some())
    }

    /// Write the status back if it changed. Returns `true` if a write happened.
    pub(crate) async fn persist(&mut self, store: &dyn RuleStore) -> Result<bool, ControllerError> {
        if !self.status_has_changed()? {
            return Ok(false);
        }
        let updated = store.update_status(&self.modified).await?;
        self.original = updated.clone();
        self.modified = updated;
        Ok(true)
    }
}
