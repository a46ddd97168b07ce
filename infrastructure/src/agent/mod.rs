//! Local agent process adapter.
//!
//! Implements the application's [`AgentGateway`](sage_application::ports::AgentGateway)
//! and [`AgentTransport`](sage_application::ports::AgentTransport) ports
//! against a spawned agent executable speaking framed JSON-RPC over TCP.

pub mod gateway;
pub mod instance;
pub mod protocol;
mod wire;

pub use gateway::{DEFAULT_AGENT_COMMAND, ProcessAgentGateway};
pub use instance::AgentInstance;
