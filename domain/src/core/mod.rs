//! Core domain concepts shared across all subdomains.
//!
//! - [`technology::Technology`]: a validated technology name
//! - [`question::Question`]: a validated question about a technology
//! - [`error::DomainError`]: domain-level errors

pub mod error;
pub mod question;
pub mod technology;
