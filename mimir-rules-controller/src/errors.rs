use mimir_rules_controller_apis::{TranslationError, ValidationError};

use crate::{lint::LintError, mimir_client::RuleClientError};

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// The work queue key is not of the form `namespace/name`.
    #[error("invalid resource key: {0:?}")]
    InvalidKey(String),
    /// The spec could not be converted into rule groups.
    #[error("error getting mimir rule namespace: {0}")]
    Translation(#[from] TranslationError),
    /// Structurally invalid rule groups.
    #[error("validation err: {}", join(.0))]
    Validation(Vec<ValidationError>),
    /// A rule expression was rejected by the linter.
    #[error("invalid expression in group {group:?}, rule {rule}: {source}")]
    Lint {
        group: String,
        rule: String,
        #[source]
        source: LintError,
    },
    /// The ruler rejected a rule group or was unreachable.
    #[error("error creating rule group {group:?}: {source}")]
    RemoteApply {
        group: String,
        #[source]
        source: RuleClientError,
    },
    /// The ruler could not list the groups of a namespace.
    #[error("error listing rule groups of {namespace:?}: {source}")]
    RemoteList {
        namespace: String,
        #[source]
        source: RuleClientError,
    },
    /// The ruler failed to delete a rule group.
    #[error("error deleting rule group {group:?}: {source}")]
    RemoteDelete {
        group: String,
        #[source]
        source: RuleClientError,
    },
    /// Writing the object back to the API server failed.
    #[error("error updating rule: {0}")]
    Persist(#[source] kube::Error),
    /// The sync itself failed and so did writing the status.
    #[error("{primary}; status update error: {persist}")]
    WithPersistFailure {
        primary: Box<ControllerError>,
        persist: Box<ControllerError>,
    },
    /// The Change-Watch Cache did not complete its initial listing in time.
    #[error("cache did not sync: {0}")]
    CacheSync(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    /// Temporary errors are retried with backoff, all others are dropped from the queue.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidKey(_) => false,
            _ => true,
        }
    }

    /// The error raised by writing back status or finalizers, if any.
    pub(crate) fn persist_error(&self) -> Option<&kube::Error> {
        match self {
            ControllerError::Persist(e) => Some(e),
            ControllerError::WithPersistFailure { persist, .. } => persist.persist_error(),
            _ => None,
        }
    }
}
