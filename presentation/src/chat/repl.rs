//! REPL (Read-Eval-Print Loop) for interactive chat

use crate::output::console::{ConsoleFormatter, StreamRenderer};
use reedline::{DefaultPrompt, DefaultPromptSegment, FileBackedHistory, Reedline, Signal};
use sage_application::AskService;
use sage_application::config::BackpressureConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const HISTORY_CAPACITY: usize = 200;

/// Interactive chat REPL bound to one technology
///
/// Questions asked in one chat run share the service's warm session pool,
/// so a follow-up lands on the session the previous answer ran on while
/// the reuse window is open.
pub struct ChatRepl {
    service: Arc<AskService>,
    technology: String,
    backpressure: BackpressureConfig,
    quiet: bool,
}

impl ChatRepl {
    /// Create a new ChatRepl
    pub fn new(service: Arc<AskService>, technology: impl Into<String>) -> Self {
        Self {
            service,
            technology: technology.into(),
            backpressure: BackpressureConfig::default(),
            quiet: false,
        }
    }

    /// Set the throttle tuning for status line pacing
    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    /// Set whether status lines and summaries are suppressed
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Run the interactive REPL until `/quit` or end of input
    pub async fn run(&self) -> std::io::Result<()> {
        let mut editor = Reedline::create();
        if let Some(path) = history_path() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(history) = FileBackedHistory::with_file(HISTORY_CAPACITY, path) {
                editor = editor.with_history(Box::new(history));
            }
        }
        let prompt = DefaultPrompt::new(
            DefaultPromptSegment::Basic(self.technology.clone()),
            DefaultPromptSegment::Empty,
        );

        self.print_welcome();

        loop {
            match editor.read_line(&prompt) {
                Ok(Signal::Success(line)) => {
                    let line = line.trim();

                    if line.is_empty() {
                        continue;
                    }

                    if line.starts_with('/') {
                        if self.handle_command(line) {
                            break;
                        }
                        continue;
                    }

                    self.process_question(line).await;
                }
                Ok(Signal::CtrlC) => {
                    println!("^C");
                    continue;
                }
                Ok(Signal::CtrlD) => {
                    println!("Bye!");
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn print_welcome(&self) {
        println!();
        println!("╭─────────────────────────────────────────────╮");
        println!("│            techsage - Chat Mode             │");
        println!("╰─────────────────────────────────────────────╯");
        println!();
        println!("Technology: {}", self.technology);
        println!();
        println!("Commands:");
        println!("  /help     - Show this help");
        println!("  /metrics  - Show service metrics");
        println!("  /quit     - Exit chat");
        println!();
    }

    /// Handle slash commands. Returns true if should exit.
    fn handle_command(&self, cmd: &str) -> bool {
        match cmd {
            "/quit" | "/exit" | "/q" => {
                println!("Bye!");
                true
            }
            "/help" | "/h" | "/?" => {
                println!();
                println!("Commands:");
                println!("  /help, /h, /?    - Show this help");
                println!("  /metrics         - Show service metrics");
                println!("  /quit, /exit, /q - Exit chat");
                println!();
                false
            }
            "/metrics" => {
                println!("{}", ConsoleFormatter::format_metrics(&self.service.metrics()));
                false
            }
            _ => {
                println!("Unknown command: {}", cmd);
                println!("Type /help for available commands");
                false
            }
        }
    }

    async fn process_question(&self, question: &str) {
        println!();
        let before = self.service.metrics();
        let started = Instant::now();

        let stream = match self.service.ask_question(&self.technology, question).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{}", ConsoleFormatter::error_line(&e.to_string()));
                println!();
                return;
            }
        };

        let renderer = StreamRenderer::new(self.backpressure.clone())
            .with_spinner(!self.quiet)
            .with_status(!self.quiet);
        let rendered = renderer.render(stream).await;
        let after = self.service.metrics();

        if rendered.error.is_none() && !self.quiet {
            let report = rendered.into_report(
                &self.technology,
                question,
                started.elapsed().as_millis() as u64,
                after.cache.hits > before.cache.hits,
                after.session_pool.reused_total > before.session_pool.reused_total,
            );
            eprintln!("{}", ConsoleFormatter::format_summary(&report));
        }
        println!();
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("techsage").join("history.txt"))
}
