//! Scenario E (exactly-once replay): a RangeCheckpoint persisted from a
//! prior run, bound to a specific completed slot, must replay into that
//! exact slot on restart rather than scanning for a free one — and freeing
//! it on ack must not disturb any other slot.

use std::sync::Arc;
use std::time::Duration;
use tailship::alarm::AlarmSink;
use tailship::checkpoint::CheckpointStore;
use tailship::feedback::FeedbackBus;
use tailship::model::{Destination, FeedbackKey, RangeCheckpoint};
use tailship::sender::queue::ExactlyOnceQueue;
use tailship::sender::{PayloadKind, SendBatch, SendResult, SenderQueue};

#[test]
fn replayed_cursor_targets_its_recorded_slot_and_frees_on_ack() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointStore::load(dir.path().join("ckpt.json"), Duration::from_secs(3600), 1000, Arc::new(AlarmSink::new(false)));

    let cursor = RangeCheckpoint {
        key: "h:7".into(),
        slot_index: 0,
        hash_key: "h".into(),
        sequence_id: 7,
        read_offset: 100,
        read_length: 50,
        complete: true,
    };
    checkpoints.put_range(cursor.clone());
    checkpoints.dump().unwrap();

    // Simulate restart: reload the checkpoint store and replay its ranges
    // into a fresh ExactlyOnceQueue.
    let reloaded = CheckpointStore::load(dir.path().join("ckpt.json"), Duration::from_secs(3600), 1000, Arc::new(AlarmSink::new(false)));
    let ranges = reloaded.all_ranges();
    assert_eq!(ranges.len(), 1);
    let replayed_cursor = ranges[0].clone();
    assert_eq!(replayed_cursor.slot_index, 0);

    let destination = Destination {
        project: "proj".into(),
        logstore: "store".into(),
        region: "cn-hangzhou".into(),
        aliuid: "1".into(),
    };
    let feedback = FeedbackBus::new();
    let queue = ExactlyOnceQueue::new(4, feedback.clone(), FeedbackKey(99), Arc::new(AlarmSink::new(false)));

    let batch = SendBatch::new(destination, PayloadKind::Lz4Compressed, vec![4, 5, 6], 50, 1);
    let id = queue.push(batch, Some(replayed_cursor)).unwrap();

    let (popped_id, popped) = queue.pop_idle().unwrap();
    assert_eq!(popped_id, id);
    let popped_cursor = popped.context.cursor.as_ref().unwrap();
    assert_eq!(popped_cursor.slot_index, 0);
    assert_eq!(popped_cursor.hash_key, "h");
    assert_eq!(popped_cursor.sequence_id, 7);

    // Re-pushing against the same (complete) slot must be rejected while it
    // is still occupied.
    let duplicate = SendBatch::new(
        Destination {
            project: "proj".into(),
            logstore: "store".into(),
            region: "cn-hangzhou".into(),
            aliuid: "1".into(),
        },
        PayloadKind::Lz4Compressed,
        vec![],
        0,
        0,
    );
    let dup_cursor = RangeCheckpoint {
        key: "h:7".into(),
        slot_index: 0,
        hash_key: "h".into(),
        sequence_id: 8,
        read_offset: 150,
        read_length: 10,
        complete: true,
    };
    assert!(queue.push(duplicate, Some(dup_cursor)).is_err());

    queue.complete(id, SendResult::Ok).unwrap();
    assert_eq!(queue.len(), 0, "acking the slot must free it");
}
