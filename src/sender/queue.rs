use super::{QueueError, SendBatch, SendResult, SenderQueue};
use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::feedback::FeedbackBus;
use crate::model::{FeedbackKey, RangeCheckpoint};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Ring buffer with `low_water`/`high_water` hysteresis: once `size` crosses
/// `high_water`, `is_valid_to_push` goes false and only flips back once size
/// drops to `low_water`, preventing flapping under oscillating load.
pub struct NormalQueue {
    capacity: usize,
    high_water: usize,
    low_water: usize,
    feedback: Arc<FeedbackBus>,
    feedback_key: FeedbackKey,
    alarms: Arc<AlarmSink>,
    next_id: AtomicU64,
    state: Mutex<NormalState>,
}

struct NormalState {
    order: VecDeque<u64>,
    items: HashMap<u64, SendBatch>,
    valid: bool,
}

impl NormalQueue {
    pub fn new(capacity: usize, high_water: usize, low_water: usize, feedback: Arc<FeedbackBus>, feedback_key: FeedbackKey, alarms: Arc<AlarmSink>) -> Self {
        assert!(low_water <= high_water && high_water <= capacity, "hysteresis marks must satisfy low <= high <= capacity");
        feedback.set_valid(feedback_key, true);
        NormalQueue {
            capacity,
            high_water,
            low_water,
            feedback,
            feedback_key,
            alarms,
            next_id: AtomicU64::new(1),
            state: Mutex::new(NormalState {
                order: VecDeque::new(),
                items: HashMap::new(),
                valid: true,
            }),
        }
    }

    fn update_hysteresis(&self, state: &mut NormalState) {
        let size = state.items.len();
        if state.valid && size >= self.high_water {
            state.valid = false;
            self.feedback.set_valid(self.feedback_key, false);
            self.alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Warn, "SQ-HIGH-WATER", format!("queue size {size} crossed high_water {}", self.high_water)));
        } else if !state.valid && size <= self.low_water {
            state.valid = true;
            self.feedback.set_valid(self.feedback_key, true);
        }
    }
}

impl SenderQueue for NormalQueue {
    fn push(&self, mut batch: SendBatch, cursor: Option<RangeCheckpoint>) -> Result<u64, QueueError> {
        batch.context.cursor = cursor;
        let mut state = self.state.lock().unwrap();
        if state.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.order.push_back(id);
        state.items.insert(id, batch);
        self.update_hysteresis(&mut state);
        Ok(id)
    }

    fn pop_idle(&self) -> Option<(u64, SendBatch)> {
        let mut state = self.state.lock().unwrap();
        let idle_id = state
            .order
            .iter()
            .find(|id| state.items.get(id).map(|b| b.status == super::BatchStatus::Idle).unwrap_or(false))
            .copied()?;
        let batch = state.items.get_mut(&idle_id).unwrap();
        batch.status = super::BatchStatus::Sending;
        Some((idle_id, batch.clone()))
    }

    fn complete(&self, batch_id: u64, result: SendResult) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if result.frees_slot() {
            state.order.retain(|id| *id != batch_id);
            state.items.remove(&batch_id).ok_or(QueueError::UnknownBatch(batch_id))?;
        } else {
            let batch = state.items.get_mut(&batch_id).ok_or(QueueError::UnknownBatch(batch_id))?;
            batch.status = super::BatchStatus::Idle;
            batch.retry_count += 1;
        }
        self.update_hysteresis(&mut state);
        Ok(())
    }

    fn feedback_key(&self) -> FeedbackKey {
        self.feedback_key
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

struct SlotEntry {
    id: u64,
    batch: SendBatch,
    cursor: RangeCheckpoint,
}

/// Capacity equals the replay-checkpoint slot count; each slot binds to
/// exactly one `RangeCheckpoint`. Overflow parks in `extra_buffer` until a
/// slot frees, and the queue is marked invalid while any overflow remains.
pub struct ExactlyOnceQueue {
    feedback: Arc<FeedbackBus>,
    feedback_key: FeedbackKey,
    alarms: Arc<AlarmSink>,
    next_id: AtomicU64,
    slots: Mutex<Vec<Option<SlotEntry>>>,
    write_hint: Mutex<usize>,
    extra_buffer: Mutex<VecDeque<(SendBatch, RangeCheckpoint, u64)>>,
}

impl ExactlyOnceQueue {
    pub fn new(slot_count: usize, feedback: Arc<FeedbackBus>, feedback_key: FeedbackKey, alarms: Arc<AlarmSink>) -> Self {
        feedback.set_valid(feedback_key, true);
        ExactlyOnceQueue {
            feedback,
            feedback_key,
            alarms,
            next_id: AtomicU64::new(1),
            slots: Mutex::new((0..slot_count).map(|_| None).collect()),
            write_hint: Mutex::new(0),
            extra_buffer: Mutex::new(VecDeque::new()),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn refresh_validity(&self) {
        let overflowing = !self.extra_buffer.lock().unwrap().is_empty();
        self.feedback.set_valid(self.feedback_key, !overflowing);
    }

    /// Find the next empty slot scanning forward from the write hint
    /// (mirrors the original's rotating `mWrite` index), wrapping once.
    fn find_empty_slot(slots: &[Option<SlotEntry>], start: usize) -> Option<usize> {
        let n = slots.len();
        if n == 0 {
            return None;
        }
        (0..n).map(|offset| (start + offset) % n).find(|idx| slots[*idx].is_none())
    }
}

impl SenderQueue for ExactlyOnceQueue {
    fn push(&self, mut batch: SendBatch, cursor: Option<RangeCheckpoint>) -> Result<u64, QueueError> {
        let cursor = cursor.expect("exactly-once push requires a RangeCheckpoint cursor");
        let mut slots = self.slots.lock().unwrap();

        if cursor.complete {
            let idx = cursor.slot_index;
            if idx >= slots.len() {
                return Err(QueueError::SlotOutOfRange(idx));
            }
            if slots[idx].is_some() {
                return Err(QueueError::SlotOccupied(idx));
            }
            let id = self.alloc_id();
            batch.context.cursor = Some(cursor.clone());
            slots[idx] = Some(SlotEntry { id, batch, cursor });
            return Ok(id);
        }

        let start = *self.write_hint.lock().unwrap();
        match Self::find_empty_slot(&slots, start) {
            Some(idx) => {
                let id = self.alloc_id();
                let mut bound_cursor = cursor.clone();
                bound_cursor.slot_index = idx;
                batch.context.cursor = Some(bound_cursor.clone());
                slots[idx] = Some(SlotEntry { id, batch, cursor: bound_cursor });
                *self.write_hint.lock().unwrap() = (idx + 1) % slots.len().max(1);
                Ok(id)
            }
            None => {
                drop(slots);
                let id = self.alloc_id();
                self.extra_buffer.lock().unwrap().push_back((batch, cursor, id));
                self.refresh_validity();
                self.alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Warn, "EO-SLOTS-EXHAUSTED", "no free exactly-once slot, buffering overflow"));
                Ok(id)
            }
        }
    }

    /// Exactly-once queues never honor urgent requests: correctness over
    /// flush pressure (§4.5).
    fn push_urgent(&self, batch: SendBatch, cursor: Option<RangeCheckpoint>) -> Result<u64, QueueError> {
        self.alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Debug, "EO-URGENT-IGNORED", "ignoring urgent flush request on exactly-once queue"));
        self.push(batch, cursor)
    }

    fn pop_idle(&self) -> Option<(u64, SendBatch)> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|s| matches!(s, Some(e) if e.batch.status == super::BatchStatus::Idle))?;
        let entry = slots[idx].as_mut().unwrap();
        entry.batch.status = super::BatchStatus::Sending;
        Some((entry.id, entry.batch.clone()))
    }

    fn complete(&self, batch_id: u64, result: SendResult) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|s| matches!(s, Some(e) if e.id == batch_id));

        if let Some(idx) = idx {
            if result.frees_slot() {
                slots[idx] = None;
                let mut extra = self.extra_buffer.lock().unwrap();
                if let Some((batch, mut cursor, id)) = extra.pop_front() {
                    cursor.slot_index = idx;
                    let mut batch = batch;
                    batch.context.cursor = Some(cursor.clone());
                    slots[idx] = Some(SlotEntry { id, batch, cursor });
                }
                drop(extra);
                drop(slots);
                self.refresh_validity();
            } else {
                let entry = slots[idx].as_mut().unwrap();
                entry.batch.status = super::BatchStatus::Idle;
                entry.batch.retry_count += 1;
            }
            return Ok(());
        }

        // Not yet slotted: might still be sitting in the overflow buffer if
        // the caller completed it before a slot freed (shouldn't normally
        // happen since pop_idle only returns slotted entries, but guard it).
        Err(QueueError::UnknownBatch(batch_id))
    }

    fn feedback_key(&self) -> FeedbackKey {
        self.feedback_key
    }

    fn len(&self) -> usize {
        let occupied = self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count();
        occupied + self.extra_buffer.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Destination;
    use crate::sender::{PayloadKind, SendBatch};

    fn destination() -> Destination {
        Destination {
            project: "proj".into(),
            logstore: "store".into(),
            region: "cn-hangzhou".into(),
            aliuid: "1".into(),
        }
    }

    fn batch() -> SendBatch {
        SendBatch::new(destination(), PayloadKind::Lz4Compressed, vec![1, 2, 3], 100, 5)
    }

    #[test]
    fn normal_queue_hysteresis_flaps_only_at_marks() {
        let feedback = FeedbackBus::new();
        let key = FeedbackKey(1);
        let q = NormalQueue::new(10, 8, 4, feedback.clone(), key, Arc::new(AlarmSink::new(false)));
        for _ in 0..8 {
            q.push(batch(), None).unwrap();
        }
        assert!(!feedback.is_valid_to_push(key), "crossing high_water must invalidate");
        // Completing down to low_water should restore validity.
        let ids: Vec<u64> = (1..=8).collect();
        for id in &ids[..4] {
            q.complete(*id, SendResult::Ok).unwrap();
        }
        assert!(feedback.is_valid_to_push(key), "dropping to low_water must revalidate");
    }

    #[test]
    fn normal_queue_rejects_push_past_capacity() {
        let feedback = FeedbackBus::new();
        let q = NormalQueue::new(1, 1, 0, feedback, FeedbackKey(1), Arc::new(AlarmSink::new(false)));
        q.push(batch(), None).unwrap();
        assert_eq!(q.push(batch(), None), Err(QueueError::Full));
    }

    fn cursor(slot: usize, seq: u64, complete: bool) -> RangeCheckpoint {
        RangeCheckpoint {
            key: format!("slot-{slot}"),
            slot_index: slot,
            hash_key: "h".into(),
            sequence_id: seq,
            read_offset: 0,
            read_length: 100,
            complete,
        }
    }

    #[test]
    fn exactly_once_binds_new_cursor_to_scanned_slot() {
        let feedback = FeedbackBus::new();
        let key = FeedbackKey(2);
        let q = ExactlyOnceQueue::new(2, feedback, key, Arc::new(AlarmSink::new(false)));
        let id = q.push(batch(), Some(cursor(0, 1, false))).unwrap();
        let (popped_id, popped) = q.pop_idle().unwrap();
        assert_eq!(popped_id, id);
        assert_eq!(popped.context.cursor.unwrap().slot_index, 0);
    }

    #[test]
    fn exactly_once_replay_targets_exact_slot_and_rejects_occupied() {
        let feedback = FeedbackBus::new();
        let q = ExactlyOnceQueue::new(2, feedback, FeedbackKey(3), Arc::new(AlarmSink::new(false)));
        q.push(batch(), Some(cursor(0, 1, true))).unwrap();
        let err = q.push(batch(), Some(cursor(0, 2, true))).unwrap_err();
        assert_eq!(err, QueueError::SlotOccupied(0));
    }

    #[test]
    fn exactly_once_overflow_invalidates_queue_until_slot_frees() {
        let feedback = FeedbackBus::new();
        let key = FeedbackKey(4);
        let q = ExactlyOnceQueue::new(1, feedback.clone(), key, Arc::new(AlarmSink::new(false)));
        let first = q.push(batch(), Some(cursor(0, 1, false))).unwrap();
        q.push(batch(), Some(cursor(0, 2, false))).unwrap(); // overflow
        assert!(!feedback.is_valid_to_push(key));
        q.complete(first, SendResult::Ok).unwrap();
        assert!(feedback.is_valid_to_push(key), "overflow entry should have backfilled the freed slot and then drained");
    }
}
