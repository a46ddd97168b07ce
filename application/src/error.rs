//! Service-level errors and the retry classification they carry.

use crate::pool::resource_pool::PoolError;
use crate::ports::agent_gateway::GatewayError;
use crate::ports::catalog::CatalogError;
use sage_domain::DomainError;
use thiserror::Error;

/// Errors surfaced by [`AskService`](crate::use_cases::ask_question::AskService).
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown technology '{name}'{}", suggestion_suffix(.suggestions))]
    TechnologyNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    #[error(transparent)]
    InvalidInput(#[from] DomainError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("session limit reached: {0}")]
    SessionLimit(String),

    #[error("failed to create session: {0}")]
    SessionCreation(String),

    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Permanent(String),
}

impl ServiceError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Unknown technologies and errors explicitly tagged permanent are never
    /// retried. Everything else fails open as retryable, including resource
    /// exhaustion, which clears when capacity frees up.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::TechnologyNotFound { .. } => false,
            ServiceError::InvalidInput(_) => false,
            ServiceError::Permanent(_) => false,
            ServiceError::ShuttingDown => false,
            _ => true,
        }
    }
}

/// Substrings that mark an error message as a transient infrastructure
/// failure worth retrying.
pub fn has_transient_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["port", "timeout", "network", "connection"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn suggestion_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

impl From<CatalogError> for ServiceError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { name, suggestions } => {
                ServiceError::TechnologyNotFound { name, suggestions }
            }
            CatalogError::RepoMissing { .. } => ServiceError::Permanent(err.to_string()),
            CatalogError::Unavailable(msg) => ServiceError::Permanent(msg),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::QueueFull(_) => ServiceError::ResourceExhausted(err.to_string()),
            PoolError::AcquireTimeout(_) => ServiceError::Timeout(err.to_string()),
            PoolError::ShutDown => ServiceError::ShuttingDown,
            PoolError::Gateway(e) => ServiceError::Gateway(e),
        }
    }
}
