//! Infrastructure layer for techsage.
//!
//! This crate contains adapters that implement the ports defined in the
//! application layer: the agent process gateway, the file-backed technology
//! catalog, configuration file loading, and the JSONL query log.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use agent::{AgentInstance, DEFAULT_AGENT_COMMAND, ProcessAgentGateway};
pub use catalog::FileTechnologyCatalog;
pub use config::{ConfigLoader, ConfigValidationError, FileConfig};
pub use logging::JsonlQueryLogger;
