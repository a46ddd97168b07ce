//! Domain error types

use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid technology name: {0}")]
    InvalidTechnology(String),

    #[error("Invalid question: {0}")]
    InvalidQuestion(String),
}
