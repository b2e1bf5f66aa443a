// ABOUTME: Typed errors surfaced by the registry, factory, pools and orchestrator.
// ABOUTME: Every variant that concerns a backend carries its identifier.

use std::fmt;
use std::time::Duration;

/// Errors returned by the agentry runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("backend '{0}' is already registered")]
    DuplicateIdentifier(String),

    #[error("backend '{0}' is not registered")]
    NotFound(String),

    #[error("invalid configuration for backend '{backend}': {}", render_issues(issues))]
    InvalidConfiguration {
        backend: String,
        issues: Vec<FieldIssue>,
    },

    #[error("failed to construct backend '{backend}': {message}")]
    ConstructionFailed { backend: String, message: String },

    #[error("pool for backend '{backend}' exhausted after waiting {waited:?}")]
    PoolExhausted { backend: String, waited: Duration },

    #[error("no eligible backend for {requirement}")]
    NoEligibleBackend { requirement: String },

    #[error("backend '{backend}' failed: {source:#}")]
    ExecutionFailed {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{}", match backend {
        Some(b) => format!("request to backend '{}' was cancelled", b),
        None => "request was cancelled".to_string(),
    })]
    Cancelled { backend: Option<String> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RuntimeError {
    pub fn execution(backend: impl Into<String>, source: anyhow::Error) -> Self {
        RuntimeError::ExecutionFailed {
            backend: backend.into(),
            source,
        }
    }

    pub fn construction(backend: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::ConstructionFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(backend: impl Into<String>) -> Self {
        RuntimeError::Cancelled {
            backend: Some(backend.into()),
        }
    }

    /// Backend the error originated from, when there is one
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            RuntimeError::DuplicateIdentifier(id) | RuntimeError::NotFound(id) => Some(id),
            RuntimeError::InvalidConfiguration { backend, .. }
            | RuntimeError::ConstructionFailed { backend, .. }
            | RuntimeError::PoolExhausted { backend, .. }
            | RuntimeError::ExecutionFailed { backend, .. } => Some(backend),
            RuntimeError::Cancelled { backend } => backend.as_deref(),
            RuntimeError::NoEligibleBackend { .. } | RuntimeError::InvalidRequest(_) => None,
        }
    }

    /// Only execution failures are worth retrying on another backend.
    /// Everything else is misconfiguration, capacity or caller intent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::ExecutionFailed { .. })
    }

    /// Short stable name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::DuplicateIdentifier(_) => "duplicate_identifier",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::InvalidConfiguration { .. } => "invalid_configuration",
            RuntimeError::ConstructionFailed { .. } => "construction_failed",
            RuntimeError::PoolExhausted { .. } => "pool_exhausted",
            RuntimeError::NoEligibleBackend { .. } => "no_eligible_backend",
            RuntimeError::ExecutionFailed { .. } => "execution_failed",
            RuntimeError::Cancelled { .. } => "cancelled",
            RuntimeError::InvalidRequest(_) => "invalid_request",
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// One problem found while validating a backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub problem: FieldProblem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    WrongType { expected: String, found: String },
    Invalid(String),
}

impl FieldIssue {
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: FieldProblem::Missing,
        }
    }

    pub fn wrong_type(field: impl Into<String>, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: FieldProblem::WrongType {
                expected: expected.into(),
                found: found.into(),
            },
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: FieldProblem::Invalid(reason.into()),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            FieldProblem::Missing => write!(f, "'{}' is required", self.field),
            FieldProblem::WrongType { expected, found } => {
                write!(f, "'{}' must be {}, got {}", self.field, expected, found)
            }
            FieldProblem::Invalid(reason) => write!(f, "'{}' {}", self.field, reason),
        }
    }
}

fn render_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
