//! Answer rendering and output formatting

pub mod console;
pub mod formatter;
