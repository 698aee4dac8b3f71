//! Per-destination send queues: normal (ring buffer + hysteresis) and
//! exactly-once (fixed slots bound to `RangeCheckpoint`s), sharing one
//! interface the shipper drives (§4.5).

pub mod queue;
pub mod region;
pub mod signing;

use crate::model::{Destination, FeedbackKey, RangeCheckpoint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Lz4Compressed,
    PackageList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Idle,
    Sending,
    Ok,
}

/// Upstream context carried along so the sender's result handling can route
/// feedback back to the reader (rollback) and checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct BatchContext {
    pub file_path: Option<PathBuf>,
    pub cursor: Option<RangeCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct SendBatch {
    pub destination: Destination,
    pub payload_kind: PayloadKind,
    pub compressed_bytes: Vec<u8>,
    pub raw_bytes: usize,
    pub line_count: usize,
    pub retry_count: u32,
    pub shard_hash_key: String,
    pub feedback_key: FeedbackKey,
    pub context: BatchContext,
    pub status: BatchStatus,
}

impl SendBatch {
    pub fn new(destination: Destination, payload_kind: PayloadKind, compressed_bytes: Vec<u8>, raw_bytes: usize, line_count: usize) -> Self {
        let feedback_key = crate::aggregator::feedback_key_for(&destination);
        SendBatch {
            destination,
            payload_kind,
            compressed_bytes,
            raw_bytes,
            line_count,
            retry_count: 0,
            shard_hash_key: String::new(),
            feedback_key,
            context: BatchContext::default(),
            status: BatchStatus::Idle,
        }
    }
}

/// Outcome of one dispatch attempt, as reported by the shipper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Buffered,
    Discard,
    NetworkFail,
    QuotaFail,
    OtherFail,
    UnauthorizedFail,
}

impl SendResult {
    /// Ok/Buffered/Discard free the slot; everything else resets to Idle for
    /// redispatch (§4.5 "Send-result handling").
    pub fn frees_slot(&self) -> bool {
        matches!(self, SendResult::Ok | SendResult::Buffered | SendResult::Discard)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue at capacity")]
    Full,
    #[error("exactly-once slot {0} already occupied")]
    SlotOccupied(usize),
    #[error("exactly-once slot index {0} out of range")]
    SlotOutOfRange(usize),
    #[error("unknown batch id {0}")]
    UnknownBatch(u64),
}

/// Shared interface the shipper drives regardless of queue shape.
pub trait SenderQueue: Send + Sync {
    fn push(&self, batch: SendBatch, cursor: Option<RangeCheckpoint>) -> Result<u64, QueueError>;

    /// Exactly-once queues ignore urgent requests; correctness over
    /// responsiveness (§4.5). Default forwards to `push`.
    fn push_urgent(&self, batch: SendBatch, cursor: Option<RangeCheckpoint>) -> Result<u64, QueueError> {
        self.push(batch, cursor)
    }

    fn pop_idle(&self) -> Option<(u64, SendBatch)>;
    fn complete(&self, batch_id: u64, result: SendResult) -> Result<(), QueueError>;
    fn feedback_key(&self) -> FeedbackKey;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
