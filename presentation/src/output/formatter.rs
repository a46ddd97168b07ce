//! Output formatter trait and the finished-answer report it renders

use serde::Serialize;

/// Everything known about one answered question once its stream closed
#[derive(Debug, Clone, Serialize)]
pub struct AnswerReport {
    /// Canonical technology name the question ran against
    pub technology: String,
    /// The question as asked
    pub question: String,
    /// Concatenated answer text
    pub answer: String,
    /// Session the answer came from (`cached` for replayed answers)
    pub session_id: String,
    /// Events observed on the stream
    pub events: u64,
    /// Status lines skipped by the console throttle
    pub status_dropped: u64,
    /// Wall time from dispatch to stream close, in milliseconds
    pub duration_ms: u64,
    /// Answer was replayed from the response cache
    pub cached: bool,
    /// Answer ran on a reused warm session
    pub session_reused: bool,
    /// Error reported by the session, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnswerReport {
    pub fn new(technology: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            technology: technology.into(),
            question: question.into(),
            answer: String::new(),
            session_id: String::new(),
            events: 0,
            status_dropped: 0,
            duration_ms: 0,
            cached: false,
            session_reused: false,
            error: None,
        }
    }
}

/// Trait for formatting finished answers
pub trait OutputFormatter {
    /// Format the answer text alone (suitable for piping)
    fn format_answer(&self, report: &AnswerReport) -> String;

    /// Format as JSON
    fn format_json(&self, report: &AnswerReport) -> String;

    /// Format the one-line closing summary
    fn format_summary(&self, report: &AnswerReport) -> String;
}
