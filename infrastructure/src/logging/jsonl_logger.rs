//! JSONL file writer for the query log.
//!
//! Each [`QueryRecord`] becomes a single JSON line appended to the log
//! file. The log survives restarts: the file is opened in append mode, and
//! every line is flushed as it is written.

use sage_application::ports::{QueryLogger, QueryRecord};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Query logger that writes one JSON object per answered question.
///
/// Thread-safe via `Mutex<BufWriter<File>>`. IO errors are swallowed after
/// a log line; a broken query log must never fail a question.
pub struct JsonlQueryLogger {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonlQueryLogger {
    /// Opens the log for appending, creating the file (and parent
    /// directories) if needed. Returns `None` if the file cannot be
    /// opened.
    pub fn new(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!("could not create query log directory {}: {e}", parent.display());
            return None;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!("could not open query log {}: {e}", path.display());
                return None;
            }
        };

        Some(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// The path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueryLogger for JsonlQueryLogger {
    fn log(&self, record: QueryRecord) {
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{line}");
            // Flush per line so a crash loses at most the current record
            let _ = writer.flush();
        }
    }
}

impl Drop for JsonlQueryLogger {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .trim()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_records_become_one_json_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.jsonl");
        let logger = JsonlQueryLogger::new(&path).unwrap();

        let mut first = QueryRecord::new("react", "what are hooks?");
        first.answer_chars = 420;
        first.events = 12;
        first.duration_ms = 1500;
        logger.log(first);

        let mut second = QueryRecord::new("tokio", "how does select work?");
        second.cached = true;
        logger.log(second);

        drop(logger);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0]["technology"], "react");
        assert_eq!(lines[0]["answer_chars"], 420);
        assert_eq!(lines[0]["events"], 12);
        assert!(lines[0].get("error").is_none());
        assert!(lines[0]["timestamp"].is_string());

        assert_eq!(lines[1]["technology"], "tokio");
        assert_eq!(lines[1]["cached"], true);
    }

    #[test]
    fn test_errors_are_recorded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.jsonl");
        let logger = JsonlQueryLogger::new(&path).unwrap();

        let mut record = QueryRecord::new("react", "what are hooks?");
        record.error = Some("session failed: instance crashed".to_string());
        logger.log(record);
        drop(logger);

        let lines = read_lines(&path);
        assert_eq!(lines[0]["error"], "session failed: instance crashed");
    }

    #[test]
    fn test_log_appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.jsonl");

        let logger = JsonlQueryLogger::new(&path).unwrap();
        logger.log(QueryRecord::new("react", "first run"));
        drop(logger);

        let logger = JsonlQueryLogger::new(&path).unwrap();
        logger.log(QueryRecord::new("react", "second run"));
        drop(logger);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["question"], "first run");
        assert_eq!(lines[1]["question"], "second run");
    }

    #[test]
    fn test_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("queries.jsonl");

        let logger = JsonlQueryLogger::new(&path).unwrap();
        logger.log(QueryRecord::new("react", "what are hooks?"));
        drop(logger);

        assert_eq!(read_lines(&path).len(), 1);
    }
}
