//! Error types for expression-resolver.

use thiserror::Error;

use crate::expr::EvalError;
use crate::model::ObjectKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to wait for cache to sync")]
    CacheSync,

    #[error("resource api error: {0}")]
    Api(#[from] ApiError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by a [`crate::api::ResourceApi`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("resource not found: {0}")]
    NotFound(ObjectKey),

    #[error("resource already exists: {0}")]
    AlreadyExists(ObjectKey),

    /// Optimistic concurrency check failed on `resource_version`.
    #[error("conflict updating {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    /// The requested watch position is older than the retained history.
    #[error("resource version {0} is too old")]
    Gone(u64),

    #[error("resource api unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Whether a later attempt at the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Conflict { .. } | ApiError::Gone(_) | ApiError::Unavailable(_)
        )
    }
}

/// Classified failure of a single reconciliation.
///
/// Every variant is recovered at the worker boundary; none of them is
/// fatal to the process.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid data document for {key}: {source}")]
    InvalidData {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot evaluate expression for {key}: {source}")]
    Evaluation {
        key: ObjectKey,
        #[source]
        source: EvalError,
    },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidData { .. } => "invalid_data",
            ReconcileError::Evaluation { .. } => "evaluation",
            ReconcileError::Api(ApiError::Conflict { .. }) => "conflict",
            ReconcileError::Api(_) => "api",
            ReconcileError::Panicked(_) => "panic",
        }
    }

    /// True when the backend failed and the same input may succeed later.
    /// Input errors only clear once the item itself changes.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Api(err) => err.is_retryable(),
            ReconcileError::Panicked(_) => true,
            ReconcileError::InvalidData { .. } | ReconcileError::Evaluation { .. } => false,
        }
    }
}
