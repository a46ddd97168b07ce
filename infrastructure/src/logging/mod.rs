//! Logging infrastructure: the durable query log.
//!
//! Provides [`JsonlQueryLogger`], a JSONL file writer implementing the
//! [`QueryLogger`](sage_application::ports::QueryLogger) port.

mod jsonl_logger;

pub use jsonl_logger::JsonlQueryLogger;
