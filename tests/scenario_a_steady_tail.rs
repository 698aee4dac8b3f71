//! Scenario A (steady tail): create a file, append a run of lines, and
//! confirm they land in exactly one LogGroup in order.

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

#[test]
fn one_hundred_appended_lines_flush_into_a_single_log_group() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.log");
    std::fs::write(&path, b"").unwrap();

    let checkpoints = Arc::new(CheckpointStore::load(dir.path().join("ckpt.json"), Duration::from_secs(3600), 1000, Arc::new(AlarmSink::new(false))));
    let registry = ReaderRegistry::new(
        "cfg".into(),
        "app".into(),
        checkpoints,
        Arc::new(AlarmSink::new(false)),
        Arc::new(MultilineParser::single_line()),
        Duration::from_millis(500),
    );

    registry.handle_event(
        FilesystemEvent::Create {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            config_name: Some("cfg".into()),
        },
        1000,
    );

    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    for i in 1..=100 {
        writeln!(f, "a{i}").unwrap();
    }
    drop(f);

    let outputs = registry.handle_event(
        FilesystemEvent::Modify {
            source_dir: dir.path().to_path_buf(),
            object_name: "a.log".into(),
            dev_inode: None,
            config_name: Some("cfg".into()),
        },
        1000,
    );
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].records.len(), 100);

    let feedback = FeedbackBus::new();
    let aggregator = Aggregator::new(MergeMode::ByTopic, Thresholds::default(), feedback, Arc::new(AlarmSink::new(false)), "machine".into(), "host".into());
    let destination = Destination {
        project: "proj".into(),
        logstore: "store".into(),
        region: "cn-hangzhou".into(),
        aliuid: "1".into(),
    };

    let mut flushed = Vec::new();
    for record in &outputs[0].records {
        let fp = fingerprint_for(&destination.project, &destination.logstore, &record.topic, &record.source_path, "cfg");
        flushed.extend(aggregator.add_record(fp, destination.clone(), record.clone(), None, 1000));
    }
    assert!(flushed.is_empty(), "100 lines is well under size/count thresholds, nothing should flush yet");

    let (ready, packages) = aggregator.sweep_ready(1000 + Thresholds::default().batch_send_interval.as_secs() as i64 + 1);
    assert!(packages.is_empty());
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].group.records.len(), 100);
    for (i, record) in ready[0].group.records.iter().enumerate() {
        assert_eq!(record.contents[0].1, format!("a{}", i + 1));
    }
}
