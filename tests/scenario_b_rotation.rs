//! Scenario B (rotation): after scenario A's file fills up, rotate it away
//! and start a fresh file at the same path. The pre-rotation bytes flush as
//! their own LogGroup; the post-rotation bytes form a separate one.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tailship::aggregator::{fingerprint_for, Aggregator, MergeMode, Thresholds};
use tailship::alarm::AlarmSink;
use tailship::checkpoint::CheckpointStore;
use tailship::event::FilesystemEvent;
use tailship::feedback::FeedbackBus;
use tailship::ingest::MultilineParser;
use tailship::model::Destination;
use tailship::reader::ReaderRegistry;

fn registry(dir: &std::path::Path) -> ReaderRegistry {
    let checkpoints = Arc::new(CheckpointStore::load(dir.join("ckpt.json"), Duration::from_secs(3600), 1000, Arc::new(AlarmSink::new(false))));
    ReaderRegistry::new(
        "cfg".into(),
        "app".into(),
        checkpoints,
        Arc::new(AlarmSink::new(false)),
        Arc::new(MultilineParser::single_line()),
        Duration::from_millis(500),
    )
}

#[test]
fn rotated_file_produces_two_distinct_log_groups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.log");
    std::fs::write(&path, b"").unwrap();
    let reg = registry(dir.path());

    reg.handle_event(
        FilesystemEvent::Create {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            config_name: Some("cfg".into()),
        },
        1000,
    );
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        for i in 1..=100 {
            writeln!(f, "a{i}").unwrap();
        }
    }
    let outputs_a = reg.handle_event(
        FilesystemEvent::Modify {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            dev_inode: None,
            config_name: Some("cfg".into()),
        },
        1000,
    );
    assert_eq!(outputs_a.len(), 1);
    assert_eq!(outputs_a[0].records.len(), 100);

    // Rotate: the live path is renamed off, then a new empty file takes its place.
    let rotated_path = dir.path().join("a.log.1");
    std::fs::rename(&path, &rotated_path).unwrap();
    reg.handle_event(
        FilesystemEvent::MoveFrom {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            cookie: None,
            config_name: Some("cfg".into()),
        },
        1001,
    );
    std::fs::write(&path, b"").unwrap();
    reg.handle_event(
        FilesystemEvent::Create {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            config_name: Some("cfg".into()),
        },
        1001,
    );
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        for i in 1..=50 {
            writeln!(f, "b{i}").unwrap();
        }
    }
    let outputs_b = reg.handle_event(
        FilesystemEvent::Modify {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            dev_inode: None,
            config_name: Some("cfg".into()),
        },
        1001,
    );
    assert_eq!(outputs_b.len(), 1);
    assert_eq!(outputs_b[0].records.len(), 50);

    // Feed both outputs through the aggregator, flushing the "a" group before
    // the "b" group starts accumulating — exactly once rotation completes in
    // practice, since the old reader has already drained to EOF by then.
    let feedback = FeedbackBus::new();
    let aggregator = Aggregator::new(MergeMode::ByTopic, Thresholds::default(), feedback, Arc::new(AlarmSink::new(false)), "machine".into(), "host".into());
    let destination = Destination {
        project: "proj".into(),
        logstore: "store".into(),
        region: "cn-hangzhou".into(),
        aliuid: "1".into(),
    };

    for record in &outputs_a[0].records {
        let fp = fingerprint_for(&destination.project, &destination.logstore, &record.topic, &record.source_path, "cfg");
        aggregator.add_record(fp, destination.clone(), record.clone(), None, 1000);
    }
    let (group_a, _) = aggregator.sweep_ready(1000 + Thresholds::default().batch_send_interval.as_secs() as i64 + 1);
    assert_eq!(group_a.len(), 1);
    assert_eq!(group_a[0].group.records.len(), 100);

    for record in &outputs_b[0].records {
        let fp = fingerprint_for(&destination.project, &destination.logstore, &record.topic, &record.source_path, "cfg");
        aggregator.add_record(fp, destination.clone(), record.clone(), None, 1001);
    }
    let (group_b, _) = aggregator.sweep_ready(1001 + Thresholds::default().batch_send_interval.as_secs() as i64 + 1);
    assert_eq!(group_b.len(), 1);
    assert_eq!(group_b[0].group.records.len(), 50);
    assert_eq!(group_b[0].group.records[0].contents[0].1, "b1");
    assert_eq!(group_b[0].group.records[49].contents[0].1, "b50");
}
