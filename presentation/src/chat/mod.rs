//! Interactive chat module
//!
//! Provides a readline-based chat interface bound to one technology.

mod repl;

pub use repl::ChatRepl;
