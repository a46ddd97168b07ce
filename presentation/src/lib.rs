//! Presentation layer for techsage
//!
//! This crate contains CLI definitions, the live stream renderer,
//! output formatters, and the interactive chat interface.

pub mod chat;
pub mod cli;
pub mod output;

// Re-export commonly used types
pub use chat::ChatRepl;
pub use cli::commands::{Cli, Commands, OutputFormat};
pub use output::console::{ConsoleFormatter, RenderedAnswer, StreamRenderer};
pub use output::formatter::{AnswerReport, OutputFormatter};
