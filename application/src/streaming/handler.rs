//! Event handler trait and registration.

use async_trait::async_trait;
use sage_domain::AgentEvent;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A consumer of dispatched events.
///
/// `can_handle` must be cheap and side-effect free: the processor calls it
/// against buffered events on every dispatch tick to pick what to deliver
/// next. `handle` runs on its own task; a failure is logged and counted
/// but never stops the stream or other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn can_handle(&self, event: &AgentEvent) -> bool;

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError>;
}

/// A named handler with a dispatch priority. Lower numbers run first;
/// negative priorities are fine and run before the default 0.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub name: String,
    pub priority: i32,
    pub handler: Arc<dyn EventHandler>,
}

impl HandlerRegistration {
    pub fn new(name: impl Into<String>, priority: i32, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            name: name.into(),
            priority,
            handler,
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}
