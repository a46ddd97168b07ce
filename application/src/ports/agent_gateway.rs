//! Agent gateway port: interface to the coding-agent backend.
//!
//! The gateway spawns agent instances bound to local ports; each instance
//! hosts any number of sessions and pushes [`AgentEvent`]s to subscribers.
//! The infrastructure layer implements these traits against the real agent
//! process; tests substitute scripted mocks.

use async_trait::async_trait;
use sage_domain::{AgentEvent, Technology};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by the gateway and its transports.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("port {0} is unavailable")]
    PortUnavailable(u16),

    #[error("failed to spawn agent instance: {0}")]
    SpawnFailed(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport is closed")]
    TransportClosed,
}

impl GatewayError {
    /// Whether the failure is tied to this particular spawn attempt rather
    /// than the request itself. Port conflicts are the main case: the caller
    /// retries on a different port.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::PortUnavailable(_)
                | GatewayError::Connection(_)
                | GatewayError::Timeout(_)
                | GatewayError::TransportClosed
        )
    }
}

/// Everything an instance needs to know at spawn time.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Technology this instance serves.
    pub technology: Technology,
    /// Local checkout of the technology's repository.
    pub repo_path: PathBuf,
    /// Model override passed to the backend, if any.
    pub model: Option<String>,
    /// System prompt applied to new sessions.
    pub system_prompt: Option<String>,
}

/// A live subscription to an instance's event feed.
///
/// Events arrive on an unbounded channel so slow consumers never stall the
/// transport's reader; flow control happens downstream in the event
/// processor.
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<AgentEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the transport closes the feed.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.receiver.recv().await
    }
}

/// A connection to one running agent instance.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Opens a fresh conversation session and returns its id.
    async fn create_session(&self) -> Result<String, GatewayError>;

    /// Subscribes to the instance's event feed. Every subscriber sees every
    /// event; filtering by session happens in the handlers.
    fn subscribe_events(&self) -> EventSubscription;

    /// Sends a prompt into an existing session. Resolves once the backend
    /// acknowledges the prompt; the answer arrives as events.
    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<(), GatewayError>;

    /// Tears the instance down. Must tolerate repeated calls.
    async fn close(&self) -> Result<(), GatewayError>;
}

impl std::fmt::Debug for dyn AgentTransport + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentTransport")
    }
}

/// Factory for agent instances.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Spawns an instance listening on `port`. Fails with
    /// [`GatewayError::PortUnavailable`] when the port is taken, in which
    /// case the caller picks another port and tries again.
    async fn create_instance(
        &self,
        port: u16,
        config: &InstanceConfig,
    ) -> Result<Arc<dyn AgentTransport>, GatewayError>;
}
