//! Merges parsed records into destination-keyed batches under size, count,
//! and time triggers, and hands ready batches to the sender.
//!
//! A single mutex guards both the per-fingerprint map and the per-logstore
//! package map; the aggregator is the sole mutator of either (§4.4).

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::feedback::FeedbackBus;
use crate::model::{Destination, FeedbackKey, FingerprintKey, LogGroup, LogRecord, RangeCheckpoint};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `merge_by_topic` keeps one MergeItem per fingerprint; `merge_by_logstore`
/// additionally concatenates same-(project, logstore) items into a
/// PackageList on flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    ByTopic,
    ByLogstore,
}

#[derive(Debug, Clone)]
pub struct Thresholds {
    pub batch_send_metric_size: usize,
    pub merge_log_count_limit: usize,
    pub batch_send_interval: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            batch_send_metric_size: 1024 * 1024,
            merge_log_count_limit: 4096,
            batch_send_interval: Duration::from_secs(3),
        }
    }
}

/// One accumulating batch, keyed by fingerprint. Owned by the aggregator
/// until flush, at which point ownership notionally transfers to the sender
/// queue (the caller moves the returned value there).
#[derive(Debug, Clone)]
pub struct MergeItem {
    pub fingerprint: FingerprintKey,
    pub destination: Destination,
    pub group: LogGroup,
    pub raw_bytes: usize,
    pub line_count: usize,
    pub first_log_time: i64,
    pub last_update_time: i64,
    pub cursor: Option<RangeCheckpoint>,
}

impl MergeItem {
    fn new(fingerprint: FingerprintKey, destination: Destination, group: LogGroup, now: i64) -> Self {
        MergeItem {
            fingerprint,
            destination,
            group,
            raw_bytes: 0,
            line_count: 0,
            first_log_time: now,
            last_update_time: now,
            cursor: None,
        }
    }

    fn append(&mut self, record: LogRecord, now: i64, cursor_update: Option<RangeCheckpoint>) {
        self.raw_bytes += record.raw_size;
        self.line_count += 1;
        self.last_update_time = now;
        self.group.records.push(record);
        if let Some(incoming) = cursor_update {
            match &mut self.cursor {
                Some(existing) => {
                    existing.read_length = incoming.read_offset + incoming.read_length - existing.read_offset;
                    existing.complete = incoming.complete;
                }
                None => self.cursor = Some(incoming),
            }
        }
    }

    fn minute(&self) -> Option<i64> {
        self.group.minute()
    }

    fn idle_for(&self, now: i64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.last_update_time).max(0) as u64)
    }

    fn exceeds_size_or_count(&self, thresholds: &Thresholds) -> bool {
        self.raw_bytes >= thresholds.batch_send_metric_size || self.line_count >= thresholds.merge_log_count_limit
    }
}

/// Sequence of MergeItems destined for the same logstore, formed on flush in
/// `ByLogstore` mode to amortize per-request overhead.
#[derive(Debug, Clone)]
pub struct PackageList {
    pub project: String,
    pub logstore: String,
    pub items: Vec<MergeItem>,
}

impl PackageList {
    pub fn raw_bytes(&self) -> usize {
        self.items.iter().map(|i| i.raw_bytes).sum()
    }

    pub fn oldest_age(&self, now: i64) -> Duration {
        self.items
            .iter()
            .map(|i| i.idle_for(now))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Deterministic, process-stable hash — not a security hash, just a stable
/// key derivation (mirrors `core/profiler/LogLineCount.cpp`'s per-source
/// sequence bookkeeping, reused here for pack-id tagging).
fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for p in parts {
        p.hash(&mut hasher);
    }
    hasher.finish()
}

pub fn fingerprint_for(project: &str, logstore: &str, topic: &str, source: &PathBuf, config_name: &str) -> FingerprintKey {
    FingerprintKey(stable_hash(&[project, logstore, topic, &source.to_string_lossy(), config_name]))
}

pub fn feedback_key_for(destination: &Destination) -> FeedbackKey {
    FeedbackKey(stable_hash(&[&destination.project, &destination.logstore]))
}

/// Per-fingerprint monotonic counter backing the `__pack_id__` tag.
#[derive(Default)]
struct PackIdSequence {
    counters: HashMap<FingerprintKey, u64>,
}

impl PackIdSequence {
    fn next(&mut self, fingerprint: FingerprintKey) -> u64 {
        let counter = self.counters.entry(fingerprint).or_insert(0);
        *counter += 1;
        *counter
    }
}

struct State {
    items: HashMap<FingerprintKey, MergeItem>,
    pack_ids: PackIdSequence,
}

pub struct Aggregator {
    mode: MergeMode,
    thresholds: Thresholds,
    feedback: Arc<FeedbackBus>,
    alarms: Arc<AlarmSink>,
    machine_uuid: String,
    hostname: String,
    state: Mutex<State>,
}

impl Aggregator {
    pub fn new(
        mode: MergeMode,
        thresholds: Thresholds,
        feedback: Arc<FeedbackBus>,
        alarms: Arc<AlarmSink>,
        machine_uuid: String,
        hostname: String,
    ) -> Self {
        Aggregator {
            mode,
            thresholds,
            feedback,
            alarms,
            machine_uuid,
            hostname,
            state: Mutex::new(State {
                items: HashMap::new(),
                pack_ids: PackIdSequence::default(),
            }),
        }
    }

    /// Appends one record to its fingerprint's MergeItem, enforcing the
    /// minute-boundary invariant (flushing the current item first if the new
    /// record falls in a different UTC minute) and size/count triggers.
    /// Returns any items the caller must hand to the sender as a result.
    pub fn add_record(
        &self,
        fingerprint: FingerprintKey,
        destination: Destination,
        record: LogRecord,
        cursor_update: Option<RangeCheckpoint>,
        now: i64,
    ) -> Vec<MergeItem> {
        let mut ready = Vec::new();
        let mut guard = self.state.lock().unwrap();

        let record_minute = record.minute();
        if let Some(existing) = guard.state_minute_mismatch(fingerprint, record_minute) {
            if let Some(item) = guard.items.remove(&fingerprint) {
                ready.push(item);
            }
            let _ = existing;
        }

        let entry = guard.items.entry(fingerprint).or_insert_with(|| {
            MergeItem::new(
                fingerprint,
                destination.clone(),
                LogGroup {
                    project: destination.project.clone(),
                    logstore: destination.logstore.clone(),
                    topic: String::new(),
                    source: record.source_path.clone(),
                    machine_uuid: self.machine_uuid.clone(),
                    tags: hostname_tag(&self.hostname),
                    records: Vec::new(),
                },
                now,
            )
        });
        entry.append(record, now, cursor_update);

        if entry.exceeds_size_or_count(&self.thresholds) {
            if let Some(item) = guard.items.remove(&fingerprint) {
                ready.push(item);
            }
        }
        drop(guard);

        for item in &mut ready {
            self.tag_on_flush(item);
        }
        self.admit(ready)
    }

    /// Periodic sweep (called from the sender main loop) that flushes
    /// idle-time-triggered items, and in `ByLogstore` mode, additionally
    /// flushes whole packages that clear a package-level trigger even if no
    /// member item has individually timed out. Consults the feedback bus
    /// before admitting anything; non-admitted items remain buffered.
    pub fn sweep_ready(&self, now: i64) -> (Vec<MergeItem>, Vec<PackageList>) {
        let mut guard = self.state.lock().unwrap();
        let mut timed_out: Vec<FingerprintKey> = guard
            .items
            .iter()
            .filter(|(_, item)| item.idle_for(now) >= self.thresholds.batch_send_interval)
            .map(|(fp, _)| *fp)
            .collect();

        if self.mode == MergeMode::ByLogstore {
            for fps in self.package_ready_groups(&guard.items, now) {
                timed_out.extend(fps);
            }
            timed_out.sort_unstable_by_key(|fp| fp.0);
            timed_out.dedup();
        }

        let mut items: Vec<MergeItem> = timed_out
            .into_iter()
            .filter_map(|fp| guard.items.remove(&fp))
            .collect();
        drop(guard);

        for item in &mut items {
            self.tag_on_flush(item);
        }

        match self.mode {
            MergeMode::ByTopic => (self.admit(items), Vec::new()),
            MergeMode::ByLogstore => {
                let admitted = self.admit(items);
                (Vec::new(), self.group_into_packages(admitted))
            }
        }
    }

    /// Fingerprints belonging to a (project, logstore) group whose aggregate
    /// bytes or oldest-item age clears a package-level trigger.
    fn package_ready_groups(&self, items: &HashMap<FingerprintKey, MergeItem>, now: i64) -> Vec<Vec<FingerprintKey>> {
        let mut by_logstore: BTreeMap<(String, String), Vec<FingerprintKey>> = BTreeMap::new();
        for (fp, item) in items.iter() {
            by_logstore
                .entry((item.destination.project.clone(), item.destination.logstore.clone()))
                .or_default()
                .push(*fp);
        }
        by_logstore
            .into_values()
            .filter(|fps| {
                let bytes: usize = fps.iter().filter_map(|fp| items.get(fp)).map(|i| i.raw_bytes).sum();
                let oldest = fps
                    .iter()
                    .filter_map(|fp| items.get(fp))
                    .map(|i| i.idle_for(now))
                    .max()
                    .unwrap_or(Duration::ZERO);
                bytes >= self.thresholds.batch_send_metric_size || oldest >= self.thresholds.batch_send_interval * 2
            })
            .collect()
    }

    /// `ByLogstore` mode only: concatenate same-(project, logstore) items
    /// into PackageLists.
    fn group_into_packages(&self, items: Vec<MergeItem>) -> Vec<PackageList> {
        let mut by_logstore: BTreeMap<(String, String), Vec<MergeItem>> = BTreeMap::new();
        for item in items {
            by_logstore
                .entry((item.destination.project.clone(), item.destination.logstore.clone()))
                .or_default()
                .push(item);
        }
        by_logstore
            .into_iter()
            .map(|((project, logstore), items)| PackageList { project, logstore, items })
            .collect()
    }

    /// Admission check per §4.4: consult `IsValidToPush`; non-admitted items
    /// are pushed back into the in-flight map to retry on the next sweep.
    fn admit(&self, items: Vec<MergeItem>) -> Vec<MergeItem> {
        let mut admitted = Vec::new();
        let mut rejected = Vec::new();
        for item in items {
            let key = feedback_key_for(&item.destination);
            if self.feedback.is_valid_to_push(key) {
                admitted.push(item);
            } else {
                rejected.push(item);
            }
        }
        if !rejected.is_empty() {
            let mut guard = self.state.lock().unwrap();
            for item in rejected {
                self.alarms.raise(Alarm::new(
                    Stage::Aggregator,
                    Severity::Debug,
                    "AGG-BACKPRESSURE-RETAIN",
                    format!("destination {}/{} not ready, retaining item", item.destination.project, item.destination.logstore),
                ));
                guard.items.insert(item.fingerprint, item);
            }
        }
        admitted
    }

    fn tag_on_flush(&self, item: &mut MergeItem) {
        item.group.tags.insert("__hostname__".to_string(), self.hostname.clone());
        item.group.tags.insert("__machine_uuid__".to_string(), self.machine_uuid.clone());
        let pack_id = {
            let mut guard = self.state.lock().unwrap();
            guard.pack_ids.next(item.fingerprint)
        };
        item.group
            .tags
            .insert("__pack_id__".to_string(), format!("{:016X}-{:X}", item.fingerprint.0, pack_id));
    }
}

impl State {
    /// Returns a sentinel if the existing item for `fingerprint` would cross
    /// the minute boundary with the incoming record — signals the caller to
    /// flush the current item before appending.
    fn state_minute_mismatch(&self, fingerprint: FingerprintKey, record_minute: i64) -> Option<()> {
        let existing = self.items.get(&fingerprint)?;
        let current_minute = existing.minute()?;
        if current_minute != record_minute {
            Some(())
        } else {
            None
        }
    }
}

fn hostname_tag(hostname: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("__source_host__".to_string(), hostname.to_string());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, size: usize) -> LogRecord {
        LogRecord {
            timestamp: ts,
            source_path: PathBuf::from("/var/log/app.log"),
            topic: "app".to_string(),
            contents: vec![("msg".to_string(), "hello".to_string())],
            raw_size: size,
        }
    }

    fn destination() -> Destination {
        Destination {
            project: "proj".to_string(),
            logstore: "store".to_string(),
            region: "cn-hangzhou".to_string(),
            aliuid: "1234".to_string(),
        }
    }

    fn new_aggregator(thresholds: Thresholds) -> Aggregator {
        Aggregator::new(
            MergeMode::ByTopic,
            thresholds,
            FeedbackBus::new(),
            Arc::new(AlarmSink::new(false)),
            "machine-uuid".to_string(),
            "host-a".to_string(),
        )
    }

    #[test]
    fn accumulates_until_count_threshold_then_flushes() {
        let agg = new_aggregator(Thresholds {
            merge_log_count_limit: 3,
            ..Thresholds::default()
        });
        let fp = fingerprint_for("proj", "store", "app", &PathBuf::from("/var/log/app.log"), "cfg");
        let mut flushed = Vec::new();
        for i in 0..3 {
            flushed.extend(agg.add_record(fp, destination(), record(1000 + i, 10), None, 1000));
        }
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].line_count, 3);
    }

    #[test]
    fn minute_boundary_forces_flush_before_append() {
        let agg = new_aggregator(Thresholds::default());
        let fp = fingerprint_for("proj", "store", "app", &PathBuf::from("/var/log/app.log"), "cfg");
        let first = agg.add_record(fp, destination(), record(60, 10), None, 60);
        assert!(first.is_empty());
        let second = agg.add_record(fp, destination(), record(130, 10), None, 130);
        assert_eq!(second.len(), 1, "crossing into a new minute must flush the old item");
        assert_eq!(second[0].group.records.len(), 1);
        assert_eq!(second[0].minute(), Some(1));
    }

    #[test]
    fn backpressure_retains_item_until_feedback_clears() {
        let feedback = FeedbackBus::new();
        let key = feedback_key_for(&destination());
        feedback.set_valid(key, false);
        let agg = Aggregator::new(
            MergeMode::ByTopic,
            Thresholds {
                batch_send_interval: Duration::from_secs(0),
                ..Thresholds::default()
            },
            feedback.clone(),
            Arc::new(AlarmSink::new(false)),
            "uuid".to_string(),
            "host".to_string(),
        );
        let fp = fingerprint_for("proj", "store", "app", &PathBuf::from("/var/log/app.log"), "cfg");
        agg.add_record(fp, destination(), record(100, 10), None, 100);
        let (ready, _) = agg.sweep_ready(101);
        assert!(ready.is_empty(), "item must be retained while destination is not valid to push");

        feedback.set_valid(key, true);
        let (ready, _) = agg.sweep_ready(102);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn exactly_once_cursor_extends_read_length_on_append() {
        let agg = new_aggregator(Thresholds::default());
        let fp = fingerprint_for("proj", "store", "app", &PathBuf::from("/var/log/app.log"), "cfg");
        let cursor1 = RangeCheckpoint {
            key: "slot-0".into(),
            slot_index: 0,
            hash_key: "h".into(),
            sequence_id: 1,
            read_offset: 0,
            read_length: 100,
            complete: false,
        };
        agg.add_record(fp, destination(), record(100, 10), Some(cursor1), 100);
        let cursor2 = RangeCheckpoint {
            key: "slot-0".into(),
            slot_index: 0,
            hash_key: "h".into(),
            sequence_id: 1,
            read_offset: 100,
            read_length: 50,
            complete: false,
        };
        // 100 and 110 both floor-divide to minute 1: no boundary flush yet.
        let flushed = agg.add_record(fp, destination(), record(110, 10), Some(cursor2), 110);
        assert!(flushed.is_empty());
        let (ready, _) = agg.sweep_ready(10_000);
        assert_eq!(ready.len(), 1);
        let cursor = ready[0].cursor.as_ref().unwrap();
        assert_eq!(cursor.read_offset, 0);
        assert_eq!(cursor.read_length, 150);
    }
}
