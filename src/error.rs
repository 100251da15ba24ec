use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Credentials rejected. Fatal for the affected batch.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Network or transport failure. Retried per policy.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// Definitive business-logic refusal from the storefront (out of stock, payment declined).
    #[error("rejected by remote: {0}")]
    RemoteRejection(String),
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("unknown identifier: {0}")]
    NotFound(String),
}

/// Serializable tag recorded on attempts next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Connectivity,
    RemoteRejection,
    Timeout,
    Validation,
    NotFound,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Authentication(_) => ErrorKind::Authentication,
            EngineError::Connectivity(_) => ErrorKind::Connectivity,
            EngineError::RemoteRejection(_) => ErrorKind::RemoteRejection,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Only transport failures are absorbed by the retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Connectivity(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Connectivity(e.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_transient() {
        assert!(EngineError::Connectivity("reset".into()).is_transient());
        assert!(!EngineError::Authentication("bad".into()).is_transient());
        assert!(!EngineError::RemoteRejection("out of stock".into()).is_transient());
        assert!(!EngineError::Timeout(Duration::from_millis(10)).is_transient());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let v = serde_json::to_value(EngineError::RemoteRejection("x".into()).kind()).unwrap();
        assert_eq!(v, serde_json::json!("remote_rejection"));
    }
}
