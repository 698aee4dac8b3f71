//! Core data types shared across every stage of the pipeline.
//!
//! Kept deliberately dependency-light: these types cross thread boundaries
//! constantly (event queue, aggregator, sender queues) so they stay `Clone`
//! and free of interior mutability wherever the component design allows it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// (device-id, inode) pair identifying a file independently of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevInode {
    pub dev: u64,
    pub inode: u64,
}

impl DevInode {
    pub const NONE: DevInode = DevInode { dev: 0, inode: 0 };

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        DevInode {
            dev: meta.dev(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        // Windows has no stable dev/inode pair through std; callers on that
        // platform fall back to path + length + created-time elsewhere
        // (see discovery::dir_poller). We keep a degenerate but distinct
        // placeholder instead of panicking.
        let _ = meta;
        DevInode::NONE
    }
}

/// Primary key for readers and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub project: String,
    pub logstore: String,
    pub config_name: String,
    pub path: PathBuf,
    pub dev_inode: DevInode,
    pub fuse_mode: bool,
}

/// Durable offset record for one file.
///
/// Invariant: `offset >= signature_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheckpoint {
    pub path: PathBuf,
    pub dev_inode: DevInode,
    pub offset: u64,
    pub signature_hash: String,
    pub signature_length: u32,
    pub last_updated: i64,
    pub config_name: String,
}

impl FileCheckpoint {
    pub fn is_valid(&self) -> bool {
        self.offset >= self.signature_length as u64
    }
}

/// Durable record of a previously-seen directory, used to re-discover
/// subdirectories after restart without re-walking from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCheckpoint {
    pub path: PathBuf,
    pub children: BTreeMap<String, ()>,
    pub last_updated: i64,
}

/// Binds one in-flight exactly-once batch to one sender-queue slot.
///
/// Invariant: while `complete` is false, the slot exclusively reserves
/// `[read_offset, read_offset + read_length)` of the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCheckpoint {
    pub key: String,
    pub slot_index: usize,
    pub hash_key: String,
    pub sequence_id: u64,
    pub read_offset: u64,
    pub read_length: u64,
    pub complete: bool,
}

impl RangeCheckpoint {
    pub fn identity(&self) -> (String, u64) {
        (self.hash_key.clone(), self.sequence_id)
    }
}

/// A single parsed log line/record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub source_path: PathBuf,
    pub topic: String,
    pub contents: Vec<(String, String)>,
    pub raw_size: usize,
}

impl LogRecord {
    pub fn minute(&self) -> i64 {
        self.timestamp.div_euclid(60)
    }
}

/// Key identifying a unique (project, logstore, topic, source) tuple that the
/// aggregator groups records by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintKey(pub u64);

/// Key identifying a destination the sender queues by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackKey(pub u64);

/// Destination a batch is shipped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub project: String,
    pub logstore: String,
    pub region: String,
    pub aliuid: String,
}

/// Ordered sequence of LogRecords sharing (project, logstore, topic, source,
/// machine-uuid, tags). Invariant: all records share the same UTC minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroup {
    pub project: String,
    pub logstore: String,
    pub topic: String,
    pub source: PathBuf,
    pub machine_uuid: String,
    pub tags: BTreeMap<String, String>,
    pub records: Vec<LogRecord>,
}

impl LogGroup {
    pub fn minute(&self) -> Option<i64> {
        self.records.first().map(|r| r.minute())
    }

    pub fn raw_bytes(&self) -> usize {
        self.records.iter().map(|r| r.raw_size).sum()
    }
}
