use thiserror::Error;

use crate::entity::EntityId;

/// Broad classes of failure, used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed metadata or registration problems. Never retried.
    Configuration,
    /// Unknown property path, type, operator or function. Raised before any network call.
    Resolution,
    /// Save rejected by local policy (cross-manager batch, concurrent save, validation).
    ConcurrencyPolicy,
    /// Failure reported by the data service collaborator.
    Transport,
    /// The server payload could not be reconciled with the cache.
    MergeInconsistency,
    /// Programmer errors: bad arguments, violated lifecycle invariants.
    Usage,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Entity type '{0}' has no key properties")]
    DuplicateKeylessType(String),

    #[error("Type '{0}' is already registered")]
    DuplicateType(String),

    #[error("Cannot add mapped property '{1}' to sealed type '{0}'")]
    AlreadySealed(String, String),

    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Cyclic type dependency: {}", .0.join(" -> "))]
    CyclicTypeDependency(Vec<String>),

    #[error("Property path '{1}' not found on type '{0}'")]
    UnknownProperty(String, String),

    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Resource name already set to '{0}'")]
    ResourceNameAlreadySet(String),

    #[error("Entity {0} is already attached to another manager")]
    AlreadyAttachedElsewhere(EntityId),

    #[error("Entity of type '{0}' has no key value set")]
    MissingKey(String),

    #[error("An entity with key '{0}' is already attached")]
    DuplicateKey(String),

    #[error("Entity {0} not found in this manager")]
    EntityNotFound(EntityId),

    #[error("Invalid entity state: {0}")]
    InvalidState(String),

    #[error("Save batch contains entities from another manager: {0:?}")]
    CrossManagerSave(Vec<EntityId>),

    #[error("Entities already being saved: {0:?}")]
    ConcurrentSaveRejected(Vec<EntityId>),

    #[error("Validation failed for {entities:?}: {}", messages.join("; "))]
    ValidationFailed {
        entities: Vec<EntityId>,
        messages: Vec<String>,
    },

    #[error("No data service configured")]
    NoDataService,

    #[error("Transport error during {operation} (manager {manager}): {message}")]
    Transport {
        operation: String,
        manager: u64,
        message: String,
    },

    #[error("Merge inconsistency: {0}")]
    MergeInconsistency(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl CacheError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidMetadata(_)
            | Self::DuplicateKeylessType(_)
            | Self::DuplicateType(_)
            | Self::AlreadySealed(..)
            | Self::CyclicTypeDependency(_)
            | Self::NoDataService => ErrorCategory::Configuration,
            Self::UnknownType(_)
            | Self::UnknownProperty(..)
            | Self::UnknownOperator(_)
            | Self::UnknownFunction(_)
            | Self::InvalidExpression(_)
            | Self::ResourceNameAlreadySet(_) => ErrorCategory::Resolution,
            Self::CrossManagerSave(_)
            | Self::ConcurrentSaveRejected(_)
            | Self::ValidationFailed { .. } => ErrorCategory::ConcurrencyPolicy,
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::MergeInconsistency(_) => ErrorCategory::MergeInconsistency,
            Self::AlreadyAttachedElsewhere(_)
            | Self::MissingKey(_)
            | Self::DuplicateKey(_)
            | Self::EntityNotFound(_)
            | Self::InvalidState(_)
            | Self::TypeMismatch(_)
            | Self::UnsupportedOperation(_)
            | Self::Serialization(_)
            | Self::LockError(_) => ErrorCategory::Usage,
        }
    }

    /// Entities named by a save-policy rejection.
    pub fn offending_entities(&self) -> &[EntityId] {
        match self {
            Self::CrossManagerSave(ids)
            | Self::ConcurrentSaveRejected(ids)
            | Self::ValidationFailed { entities: ids, .. } => ids,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CacheError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
