//! Error types for the remediation engine.
//!
//! Every operation exposed upward returns either a typed value or a
//! `RemedyError` carrying one of the kinds below. There is no bare
//! success/failure boolean anywhere on the surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classification shared by the library and the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidRequest,
    Timeout,
    ExecutionFailure,
    Unavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExecutionFailure => write!(f, "execution_failure"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RemedyError {
    /// Issue, session or target unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate session or stale state transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad action type, bad suggestion index, malformed rule
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider or runner deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Runner reported failure
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Collaborator unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Persistence backend error
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RemedyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemedyError::NotFound(_) => ErrorKind::NotFound,
            RemedyError::Conflict(_) => ErrorKind::Conflict,
            RemedyError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RemedyError::Timeout(_) => ErrorKind::Timeout,
            RemedyError::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            RemedyError::Unavailable(_) | RemedyError::Storage(_) => ErrorKind::Unavailable,
            RemedyError::Json(_) => ErrorKind::InvalidRequest,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemedyError>;
