//! Error taxonomy for the download engine.
//!
//! One variant per error kind the coordinator and transport distinguish.
//! Kept as data, not strings, so the coordinator can pattern-match on
//! retry-vs-terminal instead of parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("server error: HTTP {0}")]
    ServerError(u16),

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("remote file changed since last download")]
    FileModified,

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl EngineError {
    /// Whether the worker loop should retry this error with backoff
    /// rather than surface it as terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionFailed(_) | EngineError::ServiceUnavailable
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            match status.as_u16() {
                416 => EngineError::RangeNotSatisfiable,
                503 => EngineError::ServiceUnavailable,
                code => EngineError::ServerError(code),
            }
        } else {
            EngineError::ConnectionFailed(e.to_string())
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::StorageFailure(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::PersistenceFailure(e.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(e: url::ParseError) -> Self {
        EngineError::InvalidUrl(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(EngineError::ConnectionFailed("x".into()).is_retryable());
        assert!(EngineError::ServiceUnavailable.is_retryable());
        assert!(!EngineError::RangeNotSatisfiable.is_retryable());
        assert!(!EngineError::ServerError(500).is_retryable());
        assert!(!EngineError::FileModified.is_retryable());
    }
}
