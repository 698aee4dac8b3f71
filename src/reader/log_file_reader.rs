//! Per-file offset tracking, signature-based truncation detection, buffered
//! line decode, and flush-timeout scheduling (§4.3 "Per-file read
//! algorithm").

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::model::{DevInode, FileCheckpoint, LogRecord};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_SIGNATURE_SIZE: usize = 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 512 * 1024;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A multiline-aware splitter: a real deployment plugs in a regex-driven
/// implementation (see `ingest::parser`); this trait keeps `LogFileReader`
/// decoupled from any specific parsing library.
pub trait LineParser: Send + Sync {
    /// Splits `buffer` into complete logical records plus the byte offset
    /// where the next read should resume decoding (i.e. the start of any
    /// trailing incomplete line). `base_timestamp` is used when a record has
    /// no extractable timestamp of its own.
    fn parse(&self, buffer: &[u8], source_path: &PathBuf, topic: &str, base_timestamp: i64) -> (Vec<LogRecord>, usize);
}

pub struct LogFileReader {
    path: PathBuf,
    file: File,
    dev_inode: DevInode,
    offset: u64,
    /// Bytes already parsed out of `pending` (and out of the underlying file)
    /// but not yet folded into `offset` — applied by `commit_pending` once
    /// the caller confirms the records built from them were admitted
    /// downstream.
    uncommitted: u64,
    signature_hash: String,
    signature_length: u32,
    pending: Vec<u8>,
    last_non_empty_read: Option<Instant>,
    config_name: String,
    topic: String,
}

impl LogFileReader {
    /// Opens `path` fresh and computes its signature. If `checkpoint` is
    /// provided and its signature matches, resumes from the checkpointed
    /// offset; otherwise starts at the requested `start_offset` (0 for
    /// "begin" policies, file length for "tail from EOF").
    pub fn open(
        path: PathBuf,
        config_name: String,
        topic: String,
        checkpoint: Option<&FileCheckpoint>,
        start_offset: u64,
        alarms: &AlarmSink,
    ) -> Result<Self, ReaderError> {
        let mut file = File::open(&path).map_err(|source| ReaderError::Open { path: path.clone(), source })?;
        let meta = file.metadata().map_err(|source| ReaderError::Open { path: path.clone(), source })?;
        let dev_inode = DevInode::from_metadata(&meta);

        let mut sig_buf = vec![0u8; DEFAULT_SIGNATURE_SIZE];
        let read = file.read(&mut sig_buf).map_err(|source| ReaderError::Read { path: path.clone(), source })?;
        sig_buf.truncate(read);
        let signature_hash = hex::encode(blake3::hash(&sig_buf).as_bytes());
        let signature_length = read as u32;

        let offset = match checkpoint {
            Some(cp) if cp.signature_hash == signature_hash && cp.dev_inode == dev_inode => cp.offset,
            Some(cp) => {
                alarms.raise(
                    Alarm::new(Stage::Reader, Severity::Warn, "READER-SIGNATURE-MISMATCH", "checkpoint signature mismatch, treating as truncated/reused inode; resetting offset to 0")
                        .with_config(config_name.clone()),
                );
                let _ = cp;
                0
            }
            None => start_offset,
        };

        file.seek(SeekFrom::Start(offset)).map_err(|source| ReaderError::Read { path: path.clone(), source })?;

        Ok(LogFileReader {
            path,
            file,
            dev_inode,
            offset,
            uncommitted: 0,
            signature_hash,
            signature_length,
            pending: Vec::new(),
            last_non_empty_read: None,
            config_name,
            topic,
        })
    }

    pub fn dev_inode(&self) -> DevInode {
        self.dev_inode
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Durable offset record for this reader — reflects only bytes already
    /// folded in by `commit_pending`, never the uncommitted tail still
    /// awaiting downstream admission.
    pub fn checkpoint(&self) -> FileCheckpoint {
        FileCheckpoint {
            path: self.path.clone(),
            dev_inode: self.dev_inode,
            offset: self.offset,
            signature_hash: self.signature_hash.clone(),
            signature_length: self.signature_length,
            last_updated: 0,
            config_name: self.config_name.clone(),
        }
    }

    /// Reads one buffer's worth of new bytes, splits it via `parser`, and
    /// returns the records ready to enqueue. Does not advance `offset` for
    /// the trailing partial line (reserved for the next call).
    ///
    /// Bytes consumed this call accumulate in `uncommitted` rather than
    /// folding into `offset` immediately — the offset `checkpoint()` reports
    /// (and that gets persisted) only advances once the caller calls
    /// `commit_pending` after confirming the records built from them were
    /// admitted downstream (§4.3's rollback rule: if a read returns bytes
    /// but later stages reject them, the durable offset must not advance).
    /// If the caller never admits them (e.g. the process exits first), the
    /// next restart re-opens at the last committed offset and re-reads them.
    pub fn read_once(&mut self, parser: &dyn LineParser, now: i64) -> Result<Vec<LogRecord>, ReaderError> {
        let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
        let read = self.file.read(&mut buf).map_err(|source| ReaderError::Read {
            path: self.path.clone(),
            source,
        })?;
        if read == 0 {
            return Ok(Vec::new());
        }
        buf.truncate(read);
        self.pending.extend_from_slice(&buf);

        let (records, consumed) = parser.parse(&self.pending, &self.path, &self.topic, now);
        self.pending.drain(0..consumed);
        if !records.is_empty() || consumed > 0 {
            self.uncommitted += consumed as u64;
            self.last_non_empty_read = Some(Instant::now());
        }
        Ok(records)
    }

    /// Folds every byte accumulated since the last call into the durable
    /// offset. Callers must only call this once the records built from
    /// those bytes have been admitted downstream (handed to the aggregator);
    /// never call it just after `read_once`/`force_flush` returns.
    pub fn commit_pending(&mut self) {
        self.offset += self.uncommitted;
        self.uncommitted = 0;
    }

    /// True if buffered, unterminated bytes have sat longer than
    /// `flush_timeout` — the trigger for scheduling a FlushTimeout event.
    pub fn needs_flush_timeout(&self, flush_timeout: Duration) -> bool {
        !self.pending.is_empty()
            && self
                .last_non_empty_read
                .map(|t| t.elapsed() >= flush_timeout)
                .unwrap_or(false)
    }

    /// Force-read path: flush whatever is buffered as a final (possibly
    /// unterminated) record rather than waiting for a delimiter.
    pub fn force_flush(&mut self, now: i64) -> Option<LogRecord> {
        if self.pending.is_empty() {
            return None;
        }
        let contents = String::from_utf8_lossy(&self.pending).to_string();
        let raw_size = self.pending.len();
        self.uncommitted += raw_size as u64;
        self.pending.clear();
        Some(LogRecord {
            timestamp: now,
            source_path: self.path.clone(),
            topic: self.topic.clone(),
            contents: vec![("content".to_string(), contents)],
            raw_size,
        })
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// A minimal newline-delimited parser used where no multiline config is
/// present; the default `LineParser` a config without `multiline_begin_regex`
/// resolves to.
pub struct NewlineParser;

impl LineParser for NewlineParser {
    fn parse(&self, buffer: &[u8], source_path: &PathBuf, topic: &str, base_timestamp: i64) -> (Vec<LogRecord>, usize) {
        let mut records = Vec::new();
        let mut consumed = 0;
        let mut start = 0;
        for (i, &b) in buffer.iter().enumerate() {
            if b == b'\n' {
                let line = &buffer[start..i];
                let contents = String::from_utf8_lossy(line).to_string();
                records.push(LogRecord {
                    timestamp: base_timestamp,
                    source_path: source_path.clone(),
                    topic: topic.to_string(),
                    contents: vec![("content".to_string(), contents)],
                    raw_size: line.len() + 1,
                });
                start = i + 1;
                consumed = start;
            }
        }
        (records, consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn reads_complete_lines_and_leaves_partial_buffered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"line one\nline two\npartial").unwrap();
        let alarms = AlarmSink::new(false);
        let mut reader = LogFileReader::open(path, "cfg".into(), "topic".into(), None, 0, &alarms).unwrap();
        let records = reader.read_once(&NewlineParser, 1000).unwrap();
        assert_eq!(records.len(), 2);
        assert!(reader.has_buffered_data());
    }

    #[test]
    fn truncation_resets_offset_on_signature_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"some original content here").unwrap();
        let alarms = AlarmSink::new(false);
        let reader = LogFileReader::open(path.clone(), "cfg".into(), "topic".into(), None, 0, &alarms).unwrap();
        let stale_checkpoint = FileCheckpoint {
            path: path.clone(),
            dev_inode: reader.dev_inode(),
            offset: 20,
            signature_hash: "deadbeef-not-matching".into(),
            signature_length: 10,
            last_updated: 0,
            config_name: "cfg".into(),
        };
        let reopened = LogFileReader::open(path, "cfg".into(), "topic".into(), Some(&stale_checkpoint), 0, &alarms).unwrap();
        assert_eq!(reopened.offset(), 0);
    }

    #[test]
    fn flush_timeout_triggers_only_after_idle_with_buffered_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"no newline here").unwrap();
        let alarms = AlarmSink::new(false);
        let mut reader = LogFileReader::open(path, "cfg".into(), "topic".into(), None, 0, &alarms).unwrap();
        reader.read_once(&NewlineParser, 1000).unwrap();
        assert!(!reader.needs_flush_timeout(Duration::from_secs(3600)));
        assert!(reader.needs_flush_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn force_flush_emits_buffered_partial_and_advances_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"partial-no-newline").unwrap();
        let alarms = AlarmSink::new(false);
        let mut reader = LogFileReader::open(path, "cfg".into(), "topic".into(), None, 0, &alarms).unwrap();
        reader.read_once(&NewlineParser, 1000).unwrap();
        let flushed = reader.force_flush(2000).unwrap();
        assert_eq!(flushed.contents[0].1, "partial-no-newline");
        assert_eq!(reader.offset(), 0, "offset must not advance until the caller commits");
        reader.commit_pending();
        assert_eq!(reader.offset(), 18);
        assert!(!reader.has_buffered_data());
    }

    #[test]
    fn read_once_does_not_advance_offset_until_commit_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"line one\nline two\n").unwrap();
        let alarms = AlarmSink::new(false);
        let mut reader = LogFileReader::open(path, "cfg".into(), "topic".into(), None, 0, &alarms).unwrap();
        let records = reader.read_once(&NewlineParser, 1000).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.offset(), 0, "a read alone must never advance the durable offset");
        reader.commit_pending();
        assert_eq!(reader.offset(), 19);
    }
}
