//! Event stream processing.
//!
//! [`processor`] buffers and dispatches agent events to prioritized
//! handlers under a rate limit, [`manager`] owns one processor per live
//! stream, and [`backpressure`] throttles interactive consumers that fall
//! behind the event rate.

pub mod backpressure;
pub mod handler;
pub mod manager;
pub mod processor;

pub use backpressure::{BackpressureController, BackpressureMetrics};
pub use handler::{EventHandler, HandlerError, HandlerRegistration};
pub use manager::{EventStreamManager, StreamConfig, StreamError, StreamManagerMetrics};
pub use processor::{EventProcessor, ProcessorError, ProcessorMetrics};
