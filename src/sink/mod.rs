//! Persistent record sinks.

pub mod shared;

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Durability;
use crate::session::Record;

use self::shared::SharedHandle;

/// Errors from sink operations. A failed append leaves the caller's buffer
/// untouched so the next flush cycle can retry.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a session's flushes go.
///
/// Enum dispatch rather than a trait object keeps the per-flush call
/// monomorphic.
pub enum SinkTarget {
    /// One CSV file owned by this session alone.
    File(CsvFileSink),
    /// A named multi-stream output shared with other sessions.
    Shared(SharedHandle),
}

impl SinkTarget {
    /// Appends a batch of records to the target.
    pub fn append(&mut self, records: &[Record]) -> Result<(), SinkError> {
        match self {
            Self::File(sink) => sink.append(records),
            Self::Shared(handle) => handle.absorb(records),
        }
    }
}

/// Append-only CSV sink for one session's exclusive output file.
///
/// The file is opened on the first append and held open for the life of
/// the session, so a failed open (and the batch behind it) is retried on
/// the next flush cycle and streams that never produce data leave no file
/// behind.
pub struct CsvFileSink {
    path: PathBuf,
    durability: Durability,
    writer: Option<BufWriter<File>>,
}

impl CsvFileSink {
    pub fn new(path: PathBuf, durability: Durability) -> Self {
        Self {
            path,
            durability,
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().expect("writer initialized above"))
    }

    /// Writes one line per record and drains the buffered writer once per
    /// batch. `Durability::Sync` additionally forces the batch to stable
    /// storage.
    pub fn append(&mut self, records: &[Record]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let durability = self.durability;
        let writer = self.writer()?;

        for record in records {
            writer.write_all(format_row(record).as_bytes())?;
        }
        writer.flush()?;

        if durability == Durability::Sync {
            writer.get_ref().sync_data()?;
        }

        Ok(())
    }
}

/// Formats a record as one CSV line: corrected timestamp first, then the
/// channel values in arrival order. Includes the trailing newline.
pub fn format_row(record: &Record) -> String {
    let mut row = String::with_capacity(16 * (record.channels.len() + 1));
    let _ = write!(row, "{}", record.timestamp);
    for value in &record.channels {
        let _ = write!(row, ",{value}");
    }
    row.push('\n');
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: f64, channels: &[f64]) -> Record {
        Record {
            timestamp,
            channels: channels.to_vec(),
        }
    }

    #[test]
    fn test_format_row() {
        assert_eq!(format_row(&record(1.5, &[2.0, -3.25])), "1.5,2,-3.25\n");
        assert_eq!(format_row(&record(0.0, &[])), "0\n");
    }

    #[test]
    fn test_append_accumulates_across_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = CsvFileSink::new(dir.path().join("s.csv"), Durability::Flush);

        sink.append(&[record(1.0, &[1.0]), record(2.0, &[2.0])])
            .expect("first batch");
        sink.append(&[record(3.0, &[3.0])]).expect("second batch");

        let written = std::fs::read_to_string(sink.path()).expect("output exists");
        assert_eq!(written, "1,1\n2,2\n3,3\n");
    }

    #[test]
    fn test_append_empty_batch_creates_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = CsvFileSink::new(dir.path().join("s.csv"), Durability::Flush);

        sink.append(&[]).expect("empty batch succeeds");
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_append_sync_durability() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = CsvFileSink::new(dir.path().join("s.csv"), Durability::Sync);

        sink.append(&[record(1.0, &[0.5])]).expect("batch succeeds");
        let written = std::fs::read_to_string(sink.path()).expect("output exists");
        assert_eq!(written, "1,0.5\n");
    }

    #[test]
    fn test_append_surfaces_open_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = CsvFileSink::new(dir.path().join("nope").join("s.csv"), Durability::Flush);

        let err = sink.append(&[record(1.0, &[1.0])]);
        assert!(matches!(err, Err(SinkError::Io(_))));
    }
}
