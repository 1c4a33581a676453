//! Error types for naming-core

use thiserror::Error;

use crate::config::ValidationErrors;
use crate::template::TemplateError;

/// Main error type for naming-core
///
/// Workflow outcomes a parent model can react to (missing arguments, child
/// sessions that never reported a result) are returned as tool results, not
/// as errors. The variants here abort an invocation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid delegation config: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Recursion limit exceeded: {0}")]
    RecursionExceeded(String),

    #[error("{0}")]
    DanglingFailure(String),

    #[error("Child session unavailable: {0}")]
    ChildSessionUnavailable(String),

    #[error("Assistant not available: {0}")]
    AssistantNotAvailable(String),

    #[error("No people available to run the delegation")]
    NoPeopleAvailable,

    #[error("Delegation cancelled")]
    Cancelled,

    #[error("All {} sub-tasks failed: {}", .0.len(), .0.join("; "))]
    AggregateFailure(Vec<String>),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Sub-task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Operator mistakes: bad documents, bad templates, inconsistent setup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Configuration(_) | Self::Template(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for naming-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_failure_lists_every_message() {
        let err = Error::AggregateFailure(vec!["first".into(), "second".into()]);
        assert_eq!(err.to_string(), "All 2 sub-tasks failed: first; second");
    }

    #[test]
    fn test_configuration_classification() {
        assert!(Error::Configuration("bad".into()).is_configuration());
        assert!(Error::Template(TemplateError::EmptyTag { position: 0 }).is_configuration());
        assert!(!Error::Cancelled.is_configuration());
        assert!(Error::Cancelled.is_cancelled());
    }
}
