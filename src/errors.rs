//! Typed error taxonomy for the operation engine.
//!
//! Every fallible call in the engine returns [`EngineError`]. The variants
//! mirror the failure classes the engine reasons about when deciding whether
//! to retry, normalise, or surface an error:
//! - `AlreadyExists` is normalised to success during replication and
//!   idempotent upserts
//! - `Retry` and `ConnectionProblem` are transient and feed the phase retry
//!   budget
//! - `CompareFailed` signals a lost optimistic-concurrency race on a phase
//!   state transition

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    #[error("transient failure, retry: {0}")]
    Retry(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// Multi-step cleanup collects every failure instead of stopping at the
    /// first one.
    #[error("{} errors: [{}]", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<EngineError>),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_aggregate(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn connection_problem(msg: impl Into<String>) -> Self {
        Self::ConnectionProblem(msg.into())
    }

    pub fn retry(msg: impl Into<String>) -> Self {
        Self::Retry(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn compare_failed(msg: impl Into<String>) -> Self {
        Self::CompareFailed(msg.into())
    }

    /// Collapse a list of cleanup failures into a single error, or `Ok(())`
    /// when the list is empty.
    pub fn aggregate(errors: Vec<EngineError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate(errors))
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Self::CompareFailed(_))
    }

    /// Transient errors are eligible for the phase retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retry(_) | Self::ConnectionProblem(_))
    }
}

/// Treat `already_exists` as success. Replication and idempotent upserts use
/// this to converge on records another writer created first.
pub fn ok_if_exists<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_already_exists() => Ok(T::default()),
        other => other,
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::ConnectionProblem(err.to_string())
        } else {
            Self::Other(err.into())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadParameter(format!("malformed document: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(EngineError::retry("busy").is_transient());
        assert!(EngineError::connection_problem("refused").is_transient());
        assert!(!EngineError::bad_parameter("nope").is_transient());
        assert!(!EngineError::already_exists("dup").is_transient());
    }

    #[test]
    fn ok_if_exists_normalises_duplicates() {
        let dup: Result<()> = Err(EngineError::already_exists("site example.com"));
        assert!(ok_if_exists(dup).is_ok());

        let missing: Result<()> = Err(EngineError::not_found("site example.com"));
        assert!(ok_if_exists(missing).is_err());
    }

    #[test]
    fn aggregate_empty_is_ok() {
        assert!(EngineError::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn aggregate_carries_all_messages() {
        let err = EngineError::aggregate(vec![
            EngineError::not_found("tunnel"),
            EngineError::connection_problem("hub unreachable"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tunnel"));
        assert!(msg.contains("hub unreachable"));
        assert!(msg.starts_with("2 errors"));
    }

    #[test]
    fn variants_are_matchable() {
        let err = EngineError::compare_failed("phase /init: expected in_progress");
        assert!(err.is_compare_failed());
        assert!(!err.is_already_exists());
    }
}
