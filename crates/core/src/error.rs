//! Error taxonomy shared by every Vigil component.

use serde::{Deserialize, Serialize};

/// Errors carry rendered messages so they can be cloned to every waiter of a
/// shared fetch and sent across a transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum VigilError {
    /// A GVK with an empty group, version or kind.
    #[error("invalid type: {0}")]
    InvalidType(String),
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    /// Unknown GVK on resolve.
    #[error("unknown type: {0}")]
    NotRegistered(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Fetch/RPC failure that may succeed on retry.
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("reconcile: {0}")]
    Reconcile(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl VigilError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VigilError::Upstream(_) | VigilError::Internal(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, VigilError::PermissionDenied(_))
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VigilError::InvalidType(_) => "invalid_type",
            VigilError::AlreadyRegistered(_) => "already_registered",
            VigilError::NotRegistered(_) => "not_registered",
            VigilError::Validation(_) => "validation",
            VigilError::PermissionDenied(_) => "permission_denied",
            VigilError::Upstream(_) => "upstream",
            VigilError::Reconcile(_) => "reconcile",
            VigilError::Conflict(_) => "conflict",
            VigilError::NotFound(_) => "not_found",
            VigilError::Canceled(_) => "canceled",
            VigilError::Internal(_) => "internal",
        }
    }
}

pub type VigilResult<T> = Result<T, VigilError>;
