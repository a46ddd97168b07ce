//! Application layer for techsage
//!
//! This crate contains the orchestration core: the ask-question use case,
//! instance pooling, session coordination, event stream processing, and the
//! ports the infrastructure layer plugs into. It depends only on the domain
//! layer.

pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod retry;
pub mod streaming;
pub mod use_cases;

// Re-export commonly used types
pub use cache::{CacheMetrics, ResponseCache};
pub use config::ServiceConfig;
pub use error::ServiceError;
pub use ports::{
    agent_gateway::{
        AgentGateway, AgentTransport, EventSubscription, GatewayError, InstanceConfig,
    },
    catalog::{CatalogError, TechnologyCatalog, TechnologyEntry},
    query_log::{NoQueryLogger, QueryLogger, QueryRecord},
};
pub use use_cases::ask_question::{AnswerStream, AskService, ServiceMetrics};
