//! Domain layer for techsage
//!
//! This crate contains the core types shared by every other layer.
//! It has no dependencies on infrastructure or presentation concerns.
//!
//! # Core Concepts
//!
//! ## Technology
//!
//! A technology is a named, locally cloned source repository (e.g. `react`,
//! `tokio`). Each technology is served by one or more backend agent
//! instances, which are expensive to create and therefore pooled.
//!
//! ## Agent events
//!
//! A backend agent reports progress as a stream of [`AgentEvent`] records:
//! assistant text deltas, tool activity, and terminal `session.idle` /
//! `session.error` markers. The application layer buffers, rate-limits, and
//! fans these out to handlers.

pub mod core;
pub mod event;
pub mod stream;

// Re-export commonly used types
pub use core::{error::DomainError, question::Question, technology::Technology};
pub use event::{AgentEvent, event_types};
pub use stream::StreamStatus;
