//! Console rendering for answer streams and service state
//!
//! [`StreamRenderer`] draws one live answer: a spinner until the first
//! event, answer deltas echoed as they arrive, and reasoning/tool activity
//! as dim status lines. Status lines are paced through a
//! [`BackpressureController`] and skipped while it throttles; answer text
//! is never dropped. [`ConsoleFormatter`] renders finished answers,
//! technology listings, and metrics snapshots.

use crate::output::formatter::{AnswerReport, OutputFormatter};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use sage_application::config::BackpressureConfig;
use sage_application::streaming::BackpressureController;
use sage_application::{AnswerStream, ServiceMetrics, TechnologyEntry};
use sage_domain::{AgentEvent, event_types};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

/// Longest status line before truncation.
const STATUS_LINE_MAX: usize = 100;
const SPINNER_TICK: Duration = Duration::from_millis(80);

/// What the live renderer learned from one answer stream
#[derive(Debug, Default)]
pub struct RenderedAnswer {
    pub session_id: String,
    pub answer: String,
    pub events: u64,
    pub status_dropped: u64,
    pub error: Option<String>,
}

impl RenderedAnswer {
    /// Fold this rendering into a finished-answer report. The cache and
    /// reuse markers come from the caller, which sees the service metrics
    /// around the ask.
    pub fn into_report(
        self,
        technology: &str,
        question: &str,
        duration_ms: u64,
        cached: bool,
        session_reused: bool,
    ) -> AnswerReport {
        AnswerReport {
            technology: technology.to_string(),
            question: question.to_string(),
            answer: self.answer,
            session_id: self.session_id,
            events: self.events,
            status_dropped: self.status_dropped,
            duration_ms,
            cached,
            session_reused,
            error: self.error,
        }
    }
}

/// Streams one answer to the terminal
///
/// All chrome (spinner, status lines, errors) goes to stderr; only the
/// answer text itself is written to stdout, so piped output stays clean.
pub struct StreamRenderer {
    throttle: BackpressureController,
    spinner: bool,
    status: bool,
    echo: bool,
}

impl StreamRenderer {
    /// Create a renderer with spinner, status lines, and delta echo enabled.
    /// Must run inside a tokio runtime; the throttle starts a monitor task.
    pub fn new(backpressure: BackpressureConfig) -> Self {
        Self {
            throttle: BackpressureController::new(backpressure),
            spinner: true,
            status: true,
            echo: true,
        }
    }

    /// Set whether the waiting spinner is shown
    pub fn with_spinner(mut self, show: bool) -> Self {
        self.spinner = show;
        self
    }

    /// Set whether reasoning/tool status lines are shown
    pub fn with_status(mut self, show: bool) -> Self {
        self.status = show;
        self
    }

    /// Set whether answer deltas are echoed as they arrive
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Drains the stream, rendering as configured, and reports what it saw.
    pub async fn render(&self, mut stream: AnswerStream) -> RenderedAnswer {
        let mut out = RenderedAnswer {
            session_id: stream.session_id().to_string(),
            ..RenderedAnswer::default()
        };
        let mut full_message: Option<String> = None;
        let mut spinner = self.spinner.then(Self::waiting_spinner);

        while let Some(event) = stream.next_event().await {
            out.events += 1;
            if let Some(pb) = spinner.take() {
                pb.finish_and_clear();
            }
            if event.is_error() {
                let message = event
                    .error_message()
                    .unwrap_or("agent reported an error")
                    .to_string();
                if self.echo || self.status {
                    eprintln!("{}", ConsoleFormatter::error_line(&message));
                }
                out.error = Some(message);
                continue;
            }
            match event.event_type.as_str() {
                event_types::ASSISTANT_DELTA => {
                    if let Some(chunk) = event.content() {
                        out.answer.push_str(chunk);
                        if self.echo {
                            print!("{chunk}");
                            let _ = std::io::stdout().flush();
                        }
                    }
                }
                event_types::ASSISTANT_MESSAGE => {
                    if let Some(content) = event.content() {
                        full_message = Some(content.to_string());
                    }
                }
                event_types::ASSISTANT_REASONING
                | event_types::TOOL_START
                | event_types::TOOL_COMPLETE
                | event_types::SESSION_USAGE => {
                    self.render_status(&event, &mut out).await;
                }
                _ => {}
            }
        }
        if let Some(pb) = spinner.take() {
            pb.finish_and_clear();
        }

        // Without any delta, a complete assistant message stands in.
        let streamed = !out.answer.is_empty();
        if !streamed && let Some(full) = full_message {
            out.answer = full;
        }
        if self.echo && !out.answer.is_empty() {
            if !streamed {
                println!("{}", out.answer.trim_end());
            } else if !out.answer.ends_with('\n') {
                println!();
            }
        }
        out
    }

    // ==================== internals ====================

    /// One status line, admitted through the throttle. Dropped lines are
    /// counted; admitted ones honor the throttle's current delay so a
    /// chatty agent degrades to sparser updates instead of a scrollstorm.
    async fn render_status(&self, event: &AgentEvent, out: &mut RenderedAnswer) {
        if !self.status {
            return;
        }
        if !self.throttle.process_event(event) {
            out.status_dropped += 1;
            return;
        }
        let delay = self.throttle.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(line) = status_line(event) {
            eprintln!("{}", line.dimmed());
        }
    }

    fn waiting_spinner() -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("waiting for the agent...");
        pb.enable_steady_tick(SPINNER_TICK);
        pb
    }
}

/// Formats finished answers and service state for console display
pub struct ConsoleFormatter;

impl ConsoleFormatter {
    /// Format the answer text alone (suitable for piping)
    pub fn format_answer(report: &AnswerReport) -> String {
        let mut output = report.answer.clone();
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output
    }

    /// Format as JSON
    pub fn format_json(report: &AnswerReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }

    /// Format the one-line closing summary
    pub fn format_summary(report: &AnswerReport) -> String {
        let mut markers = vec![format!("{} events", report.events)];
        if report.cached {
            markers.push("cached".to_string());
        }
        if report.session_reused {
            markers.push("reused session".to_string());
        }
        if report.status_dropped > 0 {
            markers.push(format!("{} status lines skipped", report.status_dropped));
        }
        format!(
            "done in {} ({})",
            format_duration(report.duration_ms),
            markers.join(", ")
        )
        .dimmed()
        .to_string()
    }

    /// Format the technology listing
    pub fn format_technologies(entries: &[TechnologyEntry]) -> String {
        if entries.is_empty() {
            return format!(
                "{}\n{}\n",
                "No technologies configured.".yellow(),
                "Add a [technologies] section to techsage.toml to register one.".dimmed()
            );
        }
        let mut output = String::new();
        output.push_str(&format!("{}\n\n", "Configured technologies:".cyan().bold()));
        let width = entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
        for entry in entries {
            // Pad before coloring so escape codes do not skew alignment.
            let name = format!("{:width$}", entry.name);
            output.push_str(&format!("  {}  {}", name.bold(), entry.repo_path.display()));
            if let Some(description) = &entry.description {
                output.push_str(&format!("  {}", description.dimmed()));
            }
            output.push('\n');
        }
        output
    }

    /// Format a metrics snapshot
    pub fn format_metrics(metrics: &ServiceMetrics) -> String {
        let mut output = String::new();

        output.push_str(&Self::section_header("Instance pool"));
        output.push_str(&format!(
            "  instances: {} ({} active, {} idle)\n",
            metrics.pool.total_instances,
            metrics.pool.active_instances,
            metrics.pool.idle_instances
        ));
        output.push_str(&format!(
            "  created: {}, reused: {}, evicted: {}\n",
            metrics.pool.created_total, metrics.pool.reused_total, metrics.pool.evicted_total
        ));
        output.push_str(&format!(
            "  queue: {} waiting, {} timeouts, {} rejections\n",
            metrics.pool.queued_requests, metrics.pool.queue_timeouts, metrics.pool.queue_rejections
        ));
        if !metrics.pool.instances_by_technology.is_empty() {
            output.push_str(&format!(
                "  by technology: {}\n",
                count_list(&metrics.pool.instances_by_technology)
            ));
        }

        output.push_str(&Self::section_header("Sessions"));
        output.push_str(&format!("  active: {}\n", metrics.sessions.active_sessions));
        output.push_str(&format!(
            "  created: {}, timed out: {}, cleaned: {}\n",
            metrics.sessions.created_total,
            metrics.sessions.timed_out_total,
            metrics.sessions.cleaned_total
        ));
        if !metrics.sessions.sessions_by_technology.is_empty() {
            output.push_str(&format!(
                "  by technology: {}\n",
                count_list(&metrics.sessions.sessions_by_technology)
            ));
        }

        output.push_str(&Self::section_header("Session pool"));
        output.push_str(&format!(
            "  pooled: {}, offered: {}, reused: {}, expired: {}\n",
            metrics.session_pool.pooled_sessions,
            metrics.session_pool.offered_total,
            metrics.session_pool.reused_total,
            metrics.session_pool.expired_total
        ));

        output.push_str(&Self::section_header("Answer cache"));
        output.push_str(&format!(
            "  entries: {}, hits: {}, misses: {}, evictions: {}\n",
            metrics.cache.entries, metrics.cache.hits, metrics.cache.misses, metrics.cache.evictions
        ));
        output.push_str(&format!("  hit rate: {:.1}%\n", metrics.cache.hit_rate * 100.0));

        output.push_str(&Self::section_header("Streams"));
        output.push_str(&format!(
            "  active: {}, created: {}, completed: {}\n",
            metrics.streams.active_streams,
            metrics.streams.total_created,
            metrics.streams.completed_total
        ));
        output.push_str(&format!(
            "  errored: {}, timed out: {}, removed: {}, events: {}\n",
            metrics.streams.errored_total,
            metrics.streams.timed_out_total,
            metrics.streams.removed_total,
            metrics.streams.events_total
        ));

        output
    }

    /// Format an error for display
    pub fn error_line(message: &str) -> String {
        format!("{} {}", "error:".red().bold(), message.red())
    }

    fn section_header(title: &str) -> String {
        format!("\n{}\n{}\n", title.cyan().bold(), "-".repeat(40))
    }
}

impl OutputFormatter for ConsoleFormatter {
    fn format_answer(&self, report: &AnswerReport) -> String {
        Self::format_answer(report)
    }

    fn format_json(&self, report: &AnswerReport) -> String {
        Self::format_json(report)
    }

    fn format_summary(&self, report: &AnswerReport) -> String {
        Self::format_summary(report)
    }
}

fn status_line(event: &AgentEvent) -> Option<String> {
    match event.event_type.as_str() {
        event_types::ASSISTANT_REASONING => event
            .content()
            .map(|text| format!("  thinking: {}", truncate(text))),
        event_types::TOOL_START => Some(format!("  running {}", tool_name(event))),
        event_types::TOOL_COMPLETE => Some(format!("  finished {}", tool_name(event))),
        event_types::SESSION_USAGE => event
            .property("totalTokens")
            .and_then(Value::as_u64)
            .map(|tokens| format!("  usage: {tokens} tokens")),
        _ => None,
    }
}

fn tool_name(event: &AgentEvent) -> String {
    event
        .property("tool")
        .or_else(|| event.property("toolName"))
        .and_then(Value::as_str)
        .unwrap_or("tool")
        .to_string()
}

fn truncate(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= STATUS_LINE_MAX {
        line.to_string()
    } else {
        let cut: String = line.chars().take(STATUS_LINE_MAX).collect();
        format!("{cut}...")
    }
}

fn count_list(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(name, n)| format!("{name}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> AnswerReport {
        let mut report = AnswerReport::new("react", "What are hooks?");
        report.answer = "Hooks are functions.".to_string();
        report.session_id = "sess-1".to_string();
        report.events = 5;
        report.duration_ms = 1234;
        report
    }

    #[test]
    fn test_answer_output_ends_with_newline() {
        assert_eq!(
            ConsoleFormatter::format_answer(&report()),
            "Hooks are functions.\n"
        );
        let empty = AnswerReport::new("react", "q");
        assert_eq!(ConsoleFormatter::format_answer(&empty), "");
    }

    #[test]
    fn test_json_output_carries_metadata_and_skips_missing_error() {
        let rendered = ConsoleFormatter::format_json(&report());
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["technology"], "react");
        assert_eq!(value["answer"], "Hooks are functions.");
        assert_eq!(value["events"], 5);
        assert_eq!(value["cached"], false);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_summary_markers() {
        let mut r = report();
        r.cached = true;
        r.session_reused = true;
        r.status_dropped = 3;
        let line = ConsoleFormatter::format_summary(&r);
        assert!(line.contains("1.2s"));
        assert!(line.contains("5 events"));
        assert!(line.contains("cached"));
        assert!(line.contains("reused session"));
        assert!(line.contains("3 status lines skipped"));

        let plain = ConsoleFormatter::format_summary(&report());
        assert!(!plain.contains("cached"));
        assert!(!plain.contains("reused"));
    }

    #[test]
    fn test_status_lines_per_event_type() {
        let reasoning = AgentEvent::new(event_types::ASSISTANT_REASONING)
            .with_property("content", json!("scanning the scheduler\nsecond line"));
        assert_eq!(
            status_line(&reasoning).unwrap(),
            "  thinking: scanning the scheduler"
        );

        let tool = AgentEvent::new(event_types::TOOL_START)
            .with_property("tool", json!("grep"));
        assert_eq!(status_line(&tool).unwrap(), "  running grep");

        let done = AgentEvent::new(event_types::TOOL_COMPLETE);
        assert_eq!(status_line(&done).unwrap(), "  finished tool");

        let usage = AgentEvent::new(event_types::SESSION_USAGE)
            .with_property("totalTokens", json!(1200));
        assert_eq!(status_line(&usage).unwrap(), "  usage: 1200 tokens");

        let delta = AgentEvent::delta("s", "text");
        assert!(status_line(&delta).is_none());
    }

    #[test]
    fn test_truncate_caps_at_first_line() {
        let long = "x".repeat(STATUS_LINE_MAX + 10);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), STATUS_LINE_MAX + 3);
        assert_eq!(truncate("short  "), "short");
    }

    #[test]
    fn test_rendering_folds_into_a_report() {
        let rendered = RenderedAnswer {
            session_id: "sess-2".to_string(),
            answer: "text".to_string(),
            events: 7,
            status_dropped: 1,
            error: None,
        };
        let report = rendered.into_report("tokio", "what is spawn?", 42, true, false);
        assert_eq!(report.technology, "tokio");
        assert_eq!(report.session_id, "sess-2");
        assert_eq!(report.events, 7);
        assert_eq!(report.duration_ms, 42);
        assert!(report.cached);
        assert!(!report.session_reused);
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(850), "850ms");
        assert_eq!(format_duration(1234), "1.2s");
        assert_eq!(format_duration(65_000), "1m 05s");
    }

    #[test]
    fn test_technology_listing() {
        let entries = vec![
            TechnologyEntry {
                name: "react".to_string(),
                repo_path: "/srv/repos/react".into(),
                description: Some("UI library".to_string()),
            },
            TechnologyEntry {
                name: "tokio".to_string(),
                repo_path: "/srv/repos/tokio".into(),
                description: None,
            },
        ];
        let listing = ConsoleFormatter::format_technologies(&entries);
        assert!(listing.contains("react"));
        assert!(listing.contains("/srv/repos/tokio"));
        assert!(listing.contains("UI library"));

        let empty = ConsoleFormatter::format_technologies(&[]);
        assert!(empty.contains("No technologies configured"));
    }

    #[tokio::test]
    async fn test_throttled_status_lines_are_counted_as_dropped() {
        let renderer = StreamRenderer::new(
            BackpressureConfig::default().with_check_responsiveness(false),
        );
        renderer.throttle.trigger_throttling();
        let mut out = RenderedAnswer::default();
        let reasoning = AgentEvent::new(event_types::ASSISTANT_REASONING)
            .with_property("content", json!("step"));
        renderer.render_status(&reasoning, &mut out).await;
        renderer.render_status(&reasoning, &mut out).await;
        assert_eq!(out.status_dropped, 2);
    }

    #[tokio::test]
    async fn test_disabled_status_bypasses_the_throttle() {
        let renderer = StreamRenderer::new(
            BackpressureConfig::default().with_check_responsiveness(false),
        )
        .with_status(false);
        renderer.throttle.trigger_throttling();
        let mut out = RenderedAnswer::default();
        let tool = AgentEvent::new(event_types::TOOL_START);
        renderer.render_status(&tool, &mut out).await;
        assert_eq!(out.status_dropped, 0);
    }
}
