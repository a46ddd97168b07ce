//! Port definitions (interfaces for external adapters)
//!
//! Ports define the contracts that infrastructure adapters must implement.

pub mod agent_gateway;
pub mod catalog;
pub mod query_log;

pub use agent_gateway::{
    AgentGateway, AgentTransport, EventSubscription, GatewayError, InstanceConfig,
};
pub use catalog::{CatalogError, TechnologyCatalog, TechnologyEntry};
pub use query_log::{NoQueryLogger, QueryLogger, QueryRecord};
