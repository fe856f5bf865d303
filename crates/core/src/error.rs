//! Typed failures for every workflow operation.
//!
//! Four business kinds (`Validation`, `NotFound`, `Conflict`, `Forbidden`)
//! describe a caller mistake or an illegal transition. `Execution` and
//! `Corrupted` are internal failures, and `Storage` carries backend errors
//! through untouched.

use tether_storage::StorageError;
use thiserror::Error;

use crate::approval::ExecutionError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed or empty input, including an explicit rejection.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity_type} not found: {entity_id}")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },

    /// Illegal state transition for the entity's current state.
    #[error("conflict on {entity_type}/{entity_id}: {message}")]
    Conflict {
        entity_type: String,
        entity_id: String,
        message: String,
    },

    /// The actor lacks authority for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The outbound action port failed; nothing was written.
    #[error("outbound execution failed for {entity_type}/{entity_id}: {source}")]
    Execution {
        entity_type: String,
        entity_id: String,
        #[source]
        source: ExecutionError,
    },

    /// A persisted record could not be decoded, has the wrong shape, or
    /// failed its integrity check.
    #[error("corrupted {entity_type}/{entity_id}: {reason}")]
    Corrupted {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Coarse classification used by transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Internal,
}

impl ErrorKind {
    /// HTTP status an embedding web layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
        }
    }
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Execution { .. } | Self::Corrupted { .. } | Self::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message safe to show a client: internal failures are reduced to a
    /// generic sentence.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    pub(crate) fn not_found(entity_type: &str, entity_id: &str) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub(crate) fn conflict(entity_type: &str, entity_id: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupted(entity_type: &str, entity_id: &str, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            reason: reason.into(),
        }
    }
}
