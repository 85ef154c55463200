//! Crate-level error type and the §-style failure taxonomy used to translate
//! per-instance failures into metrics, events, and cooldown updates.

use thiserror::Error;

/// Top-level operator error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Metrics provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Capability detection failed: {0}")]
    Capability(String),

    #[error("Resize protocol error: {0}")]
    Executor(#[from] crate::executor::ExecutorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories. Each per-instance error is classified into exactly one
/// category before being turned into metric increments, event emission, and
/// cooldown updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed policy or config; not retried, previous good config stays
    Validation,
    /// Orchestrator feature missing; loop degrades
    Capability,
    /// Metrics backend unavailable or partial; dimension-level veto
    Metrics,
    /// Transient orchestrator error or conflict; bounded retry
    Api,
    /// Resize rejected by the orchestrator; fatal for the decision
    Protocol,
    /// Calculator infeasibility or invariant violation; decision dropped
    Internal,
}

impl ErrorCategory {
    /// Label value used on failure counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Capability => "capability",
            ErrorCategory::Metrics => "metrics",
            ErrorCategory::Api => "api",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl Error {
    /// Classify this error into the failure taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Validation,
            Error::Kube(_) => ErrorCategory::Api,
            Error::Provider(_) => ErrorCategory::Metrics,
            Error::Capability(_) => ErrorCategory::Capability,
            Error::Executor(e) => e.category(),
            Error::Io(_) => ErrorCategory::Internal,
        }
    }
}
