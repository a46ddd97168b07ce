//! Query log port.
//!
//! One record per answered question, written after the answer stream
//! finishes. Logging is fire-and-forget: implementations swallow their own
//! IO errors so a broken log never fails a question.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a single question, for the query log.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    /// When the question was asked.
    pub timestamp: DateTime<Utc>,
    pub technology: String,
    pub question: String,
    /// Length of the assembled answer text, in characters.
    pub answer_chars: usize,
    /// Number of events the answer stream carried.
    pub events: u64,
    pub duration_ms: u64,
    /// Whether the answer was served from the response cache.
    pub cached: bool,
    /// Whether an existing session was rebound instead of creating one.
    pub session_reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryRecord {
    pub fn new(technology: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            technology: technology.into(),
            question: question.into(),
            answer_chars: 0,
            events: 0,
            duration_ms: 0,
            cached: false,
            session_reused: false,
            error: None,
        }
    }
}

/// Sink for query records.
pub trait QueryLogger: Send + Sync {
    fn log(&self, record: QueryRecord);
}

/// Default logger that discards records.
pub struct NoQueryLogger;

impl QueryLogger for NoQueryLogger {
    fn log(&self, _record: QueryRecord) {}
}
