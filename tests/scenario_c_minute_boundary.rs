//! Scenario C (minute boundary split): four records arriving in one burst
//! with timestamps T, T, T+60, T+60 must split into two LogGroups, one per
//! UTC minute, never mixing minutes within a group.

use std::path::PathBuf;
use std::sync::Arc;
use tailship::aggregator::{fingerprint_for, Aggregator, MergeMode, Thresholds};
use tailship::alarm::AlarmSink;
use tailship::feedback::FeedbackBus;
use tailship::model::{Destination, LogRecord};

fn record(ts: i64, content: &str) -> LogRecord {
    LogRecord {
        timestamp: ts,
        source_path: PathBuf::from("/var/log/app.log"),
        topic: "app".into(),
        contents: vec![("content".to_string(), content.to_string())],
        raw_size: content.len(),
    }
}

#[test]
fn records_spanning_a_minute_boundary_split_into_two_groups() {
    let feedback = FeedbackBus::new();
    let aggregator = Aggregator::new(MergeMode::ByTopic, Thresholds::default(), feedback, Arc::new(AlarmSink::new(false)), "machine".into(), "host".into());
    let destination = Destination {
        project: "proj".into(),
        logstore: "store".into(),
        region: "cn-hangzhou".into(),
        aliuid: "1".into(),
    };
    let fp = fingerprint_for(&destination.project, &destination.logstore, "app", &PathBuf::from("/var/log/app.log"), "cfg");

    let t = 1_700_000_000i64;
    let records = [record(t, "r1"), record(t, "r2"), record(t + 60, "r3"), record(t + 60, "r4")];

    let mut flushed = Vec::new();
    for r in records {
        flushed.extend(aggregator.add_record(fp, destination.clone(), r, None, t));
    }
    assert_eq!(flushed.len(), 1, "crossing into minute T+60 must flush the T group before appending");
    assert_eq!(flushed[0].group.records.len(), 2);
    assert_eq!(flushed[0].group.records[0].contents[0].1, "r1");
    assert_eq!(flushed[0].group.records[1].contents[0].1, "r2");

    let (swept, _) = aggregator.sweep_ready(t + 60 + Thresholds::default().batch_send_interval.as_secs() as i64 + 1);
    flushed.extend(swept);

    assert_eq!(flushed.len(), 2);
    assert_eq!(flushed[1].group.records.len(), 2);
    assert_eq!(flushed[1].group.records[0].contents[0].1, "r3");
    assert_eq!(flushed[1].group.records[1].contents[0].1, "r4");

    for group in &flushed {
        let minutes: Vec<i64> = group.group.records.iter().map(|r| r.minute()).collect();
        assert!(minutes.windows(2).all(|w| w[0] == w[1]), "a single LogGroup must never mix minutes");
    }
}
