//! JSON Lines file writer for append-only history logs.
//!
//! Uses JSON Lines format (.jsonl) for robustness:
//! - Each line is a complete JSON object
//! - Partial file corruption only affects individual lines
//! - Can be read even if write was interrupted

use crate::error::PersistenceResult;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// JSON Lines writer for a single append-only log file.
///
/// Uses append mode - safe for interrupted writes. Each line is
/// independent, so partial corruption only affects that line.
/// Records are buffered and flushed once the buffer reaches
/// `max_buffer_size` (or on `flush()`/`close()`/drop).
pub struct JsonLinesWriter<T: Serialize> {
    /// Full path of the log file.
    path: PathBuf,
    /// Buffer of pending records.
    buffer: Vec<T>,
    /// Maximum buffer size before flush.
    max_buffer_size: usize,
    /// Open file handle, created lazily on first flush.
    writer: Option<BufWriter<File>>,
    /// Records written to disk over the writer's lifetime.
    records_written: usize,
}

impl<T: Serialize> JsonLinesWriter<T> {
    /// Create a new JSON Lines writer for `path`.
    ///
    /// The parent directory is created if it does not exist. The file
    /// itself is opened lazily on first flush.
    pub fn new(path: impl Into<PathBuf>, max_buffer_size: usize) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(?e, dir = %parent.display(), "Failed to create log directory");
            }
        }

        Self {
            path,
            buffer: Vec::with_capacity(max_buffer_size.max(1)),
            max_buffer_size: max_buffer_size.max(1),
            writer: None,
            records_written: 0,
        }
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a record to the buffer, flushing if the buffer is full.
    pub fn append(&mut self, record: T) -> PersistenceResult<()> {
        self.buffer.push(record);

        if self.buffer.len() >= self.max_buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    fn open_writer(&mut self) -> PersistenceResult<()> {
        info!(path = %self.path.display(), "Opening JSON Lines log (append mode)");

        // Open in append mode - won't truncate existing data
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> PersistenceResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        if self.writer.is_none() {
            self.open_writer()?;
        }

        let record_count = self.buffer.len();

        if let Some(writer) = self.writer.as_mut() {
            for record in &self.buffer {
                let json = serde_json::to_string(record)?;
                writeln!(writer, "{}", json)?;
            }
            writer.flush()?;
        }

        self.records_written += record_count;
        self.buffer.clear();

        debug!(
            path = %self.path.display(),
            records = record_count,
            total = self.records_written,
            "Flushed records to JSON Lines log"
        );

        Ok(())
    }

    /// Close the writer, flushing any pending data.
    pub fn close(&mut self) -> PersistenceResult<()> {
        self.flush()?;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(?e, "Failed to flush writer on close");
            }
            info!(
                path = %self.path.display(),
                records = self.records_written,
                "Closed JSON Lines log"
            );
        }
        Ok(())
    }
}

impl<T: Serialize> Drop for JsonLinesWriter<T> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(?e, "Failed to flush buffer on drop");
        }
    }
}
