//! Stream lifecycle status.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one logical event stream (one in-flight question).
///
/// A stream starts `Active` and moves to exactly one terminal state; it
/// never returns to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Events are still flowing.
    Active,
    /// The source ended normally.
    Completed,
    /// The session reported an error.
    Error,
    /// No activity within the stream's timeout window.
    Timeout,
}

impl StreamStatus {
    /// Returns true once the stream has left `Active`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Active)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamStatus::Active => "active",
            StreamStatus::Completed => "completed",
            StreamStatus::Error => "error",
            StreamStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}
