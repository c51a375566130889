//! Tail reader for the external signal feed.
//!
//! The signal engine runs as a separate process and appends one JSON
//! object per line. The feed tracks a byte offset so each poll returns
//! only what arrived since the last one; a partially written trailing
//! line is left in place for the next poll.

use crate::error::AppResult;
use rotor_core::StrategySignal;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct SignalFeed {
    path: PathBuf,
    offset: u64,
}

impl SignalFeed {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Read signals appended since the last poll, oldest first.
    ///
    /// A missing file is an empty poll, not an error; the engine may
    /// simply not have produced anything yet. Malformed lines are
    /// skipped with a warning so one bad record cannot stall the feed.
    pub fn poll(&mut self) -> AppResult<Vec<StrategySignal>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            warn!(
                path = %self.path.display(),
                "Signal feed shrank, rereading from the start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut signals = Vec::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Writer is mid-append; pick this line up next poll.
                break;
            }
            self.offset += read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<StrategySignal>(trimmed) {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    warn!(error = %e, line = trimmed, "Skipping malformed signal line");
                }
            }
        }

        if !signals.is_empty() {
            debug!(count = signals.len(), "Signal feed poll");
        }
        Ok(signals)
    }
}

// ============================================================================
//                                    Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_core::Signal;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &std::path::Path, content: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_empty_poll() {
        let temp = TempDir::new().unwrap();
        let mut feed = SignalFeed::new(temp.path().join("signals.jsonl"));
        assert!(feed.poll().unwrap().is_empty());
    }

    #[test]
    fn test_poll_returns_only_new_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("signals.jsonl");
        let mut feed = SignalFeed::new(&path);

        append(
            &path,
            "{\"timestamp_ms\":1,\"signal\":\"BUY\",\"rationale\":\"crossover\"}\n\
             {\"timestamp_ms\":2,\"signal\":\"HOLD\"}\n",
        );
        let first = feed.poll().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].signal, Signal::Buy);
        assert_eq!(first[0].rationale, "crossover");
        assert_eq!(first[1].signal, Signal::Hold);
        assert_eq!(first[1].rationale, "");

        append(&path, "{\"timestamp_ms\":3,\"signal\":\"SELL\"}\n");
        let second = feed.poll().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].signal, Signal::Sell);

        assert!(feed.poll().unwrap().is_empty());
    }

    #[test]
    fn test_partial_trailing_line_waits_for_completion() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("signals.jsonl");
        let mut feed = SignalFeed::new(&path);

        append(&path, "{\"timestamp_ms\":1,\"sig");
        assert!(feed.poll().unwrap().is_empty());

        append(&path, "nal\":\"BUY\"}\n");
        let signals = feed.poll().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal, Signal::Buy);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("signals.jsonl");
        let mut feed = SignalFeed::new(&path);

        append(
            &path,
            "not json at all\n{\"timestamp_ms\":2,\"signal\":\"SELL\"}\n",
        );
        let signals = feed.poll().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal, Signal::Sell);
    }

    #[test]
    fn test_truncated_file_is_reread() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("signals.jsonl");
        let mut feed = SignalFeed::new(&path);

        append(
            &path,
            "{\"timestamp_ms\":1,\"signal\":\"BUY\",\"rationale\":\"price above both moving averages\"}\n",
        );
        assert_eq!(feed.poll().unwrap().len(), 1);

        // Rotation: the file is replaced with a shorter one.
        std::fs::write(&path, "{\"timestamp_ms\":9,\"signal\":\"SELL\"}\n").unwrap();
        let signals = feed.poll().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal, Signal::Sell);
    }
}
