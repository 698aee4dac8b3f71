//! On-disk rotating buffer file: the last line of defense when a batch
//! exhausts its retries (§6).
//!
//! Record layout, back to back, append-only:
//!   [u32 meta_len][meta bytes, JSON][u64 payload_len][compressed payload][StateMeta, fixed width]
//!
//! `StateMeta` trails its payload rather than leading it so the `handled`
//! flag can be flipped with a single in-place write at a known offset
//! without rewriting the rest of the record.

use crate::model::{Destination, FeedbackKey, RangeCheckpoint};
use crate::sender::PayloadKind;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub destination: Destination,
    pub payload_kind: PayloadKind,
    pub raw_bytes: usize,
    pub line_count: usize,
    pub shard_hash_key: String,
    pub feedback_key: FeedbackKey,
    pub cursor: Option<RangeCheckpoint>,
}

/// Fixed-width trailer. Every field is a fixed-size integer so the whole
/// struct serializes to a constant byte length (`STATE_META_LEN`) regardless
/// of content, which is what makes in-place rewriting of `handled` safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMeta {
    pub size: u64,
    pub encryption_size: u64,
    pub encoded_size: u64,
    pub timestamp: i64,
    pub handled: bool,
    pub retry_count: u32,
}

pub const STATE_META_LEN: usize = 8 + 8 + 8 + 8 + 1 + 4;
const HANDLED_FLAG_OFFSET_IN_TRAILER: u64 = 32;

impl StateMeta {
    fn to_bytes(self) -> [u8; STATE_META_LEN] {
        let mut buf = [0u8; STATE_META_LEN];
        buf[0..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.encryption_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.encoded_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32] = self.handled as u8;
        buf[33..37].copy_from_slice(&self.retry_count.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; STATE_META_LEN]) -> Self {
        StateMeta {
            size: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            encryption_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            encoded_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            timestamp: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            handled: buf[32] != 0,
            retry_count: u32::from_le_bytes(buf[33..37].try_into().unwrap()),
        }
    }
}

/// One record read back from the spill file, with enough positional info to
/// mark it handled later without a second scan.
pub struct SpillRecord {
    pub meta: PayloadMeta,
    pub payload: Vec<u8>,
    pub state: StateMeta,
    handled_flag_offset: u64,
}

/// Append-only rotating buffer file. "Rotating" here means size-bounded: once
/// `max_bytes` is exceeded, `compact()` rewrites the file keeping only
/// unhandled records. The shipper's periodic sweep drives compaction; §6
/// doesn't mandate a specific cadence.
pub struct SpillFile {
    path: PathBuf,
    max_bytes: u64,
}

impl SpillFile {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        SpillFile { path: path.into(), max_bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, compressed payload already produced by the
    /// caller. Returns the byte length written.
    pub fn append(&self, meta: &PayloadMeta, payload: &[u8], now: i64) -> Result<u64, SpillError> {
        let meta_bytes = serde_json::to_vec(meta)?;
        let state = StateMeta {
            size: meta.raw_bytes as u64,
            encryption_size: 0,
            encoded_size: payload.len() as u64,
            timestamp: now,
            handled: false,
            retry_count: 0,
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&(meta_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&meta_bytes)?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(payload)?;
        file.write_all(&state.to_bytes())?;
        let written = 4 + meta_bytes.len() as u64 + 8 + payload.len() as u64 + STATE_META_LEN as u64;
        Ok(written)
    }

    /// Scans the whole file front to back, returning every record (handled
    /// or not) along with its on-disk position. A truncated trailing record
    /// (a partial write interrupted by a crash) stops the scan instead of
    /// erroring — everything before it is still valid.
    pub fn scan(&self) -> Result<Vec<SpillRecord>, SpillError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let meta_len = u32::from_le_bytes(len_buf) as usize;

            let mut meta_bytes = vec![0u8; meta_len];
            if file.read_exact(&mut meta_bytes).is_err() {
                break;
            }
            let meta: PayloadMeta = match serde_json::from_slice(&meta_bytes) {
                Ok(m) => m,
                Err(_) => break,
            };

            let mut payload_len_buf = [0u8; 8];
            if file.read_exact(&mut payload_len_buf).is_err() {
                break;
            }
            let payload_len = u64::from_le_bytes(payload_len_buf) as usize;

            let mut payload = vec![0u8; payload_len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }

            let mut state_buf = [0u8; STATE_META_LEN];
            if file.read_exact(&mut state_buf).is_err() {
                break;
            }
            let state = StateMeta::from_bytes(&state_buf);
            let trailer_start = file.stream_position()? - STATE_META_LEN as u64;
            let handled_flag_offset = trailer_start + HANDLED_FLAG_OFFSET_IN_TRAILER;

            records.push(SpillRecord {
                meta,
                payload,
                state,
                handled_flag_offset,
            });
        }

        Ok(records)
    }

    pub fn mark_handled(&self, record: &SpillRecord) -> Result<(), SpillError> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(record.handled_flag_offset))?;
        file.write_all(&[1u8])?;
        Ok(())
    }

    /// Rewrites the file keeping only unhandled records.
    pub fn compact(&self) -> Result<(), SpillError> {
        let records = self.scan()?;
        let tmp_path = self.path.with_extension("compact.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in records.iter().filter(|r| !r.state.handled) {
                let meta_bytes = serde_json::to_vec(&record.meta)?;
                tmp.write_all(&(meta_bytes.len() as u32).to_le_bytes())?;
                tmp.write_all(&meta_bytes)?;
                tmp.write_all(&(record.payload.len() as u64).to_le_bytes())?;
                tmp.write_all(&record.payload)?;
                tmp.write_all(&record.state.to_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn should_compact(&self) -> bool {
        std::fs::metadata(&self.path).map(|m| m.len() >= self.max_bytes).unwrap_or(false)
    }
}
