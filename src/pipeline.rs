//! Composition root: wires discovery, reading, aggregation, and shipping
//! into one running pipeline, and owns every thread handle (§2 "Module
//! map", §5 "Concurrency model").
//!
//! Everything upstream of this module is a library of independently
//! testable pieces; `spawn` is the only place that actually threads them
//! together against a loaded `Config`.

use crate::aggregator::{self, Aggregator, MergeMode, Thresholds};
use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::checkpoint::{CheckpointStore, DEFAULT_DUMP_INTERVAL};
use crate::config::Config;
use crate::discovery::blacklist::Blacklist;
use crate::discovery::dir_poller::{DirPoller, DirPollerConfig};
use crate::discovery::modify_poller::{ModifyPoller, ModifyPollerConfig};
use crate::discovery::{self, Discovery};
use crate::event::{EventQueue, FilesystemEvent};
use crate::feedback::FeedbackBus;
use crate::ingest::{MultilineParser, NoopTimestampExtractor};
use crate::model::{Destination, FeedbackKey};
use crate::reader::log_file_reader::LineParser;
use crate::reader::ReaderRegistry;
use crate::sender::queue::NormalQueue;
use crate::sender::region::{DestinationEndpoint, RegionRegistry, RegionState};
use crate::sender::signing::{HmacV4Signer, RequestSigner};
use crate::sender::{SendBatch, SenderQueue};
use crate::shipper::spill::SpillFile;
use crate::shipper::transport::{ReqwestTransport, Transport};
use crate::shipper::{self, Shipper, ShipperConfig};
use crate::sysinfo;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 65_536;
const DEFAULT_NORMAL_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_READER_TIME_SLICE: Duration = Duration::from_millis(200);
const DEFAULT_FIRST_WATCH_TIMEOUT: Duration = Duration::from_secs(3 * 3600);
const DEFAULT_REPUSH_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_CHECKPOINT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Anchors a configured path under `state_dir` the same way
/// `sysinfo::machine_uuid` anchors `machine.uuid`: a relative path is rooted
/// there, an absolute one is left alone.
fn resolve_state_path(state_dir: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        state_dir.join(configured)
    }
}

/// On startup, hand every spilled-but-unhandled batch back to its
/// destination's queue before any fresh record can reach it, so a restart
/// resumes shipping instead of leaving the buffer file to grow forever
/// (§4.6 "retry can happen after restart"). A batch that can't be replaced
/// yet (queue full, or its destination was dropped from the config) is left
/// unhandled in the file and is retried on the next restart.
fn replay_spilled_batches(spill: &SpillFile, queues_by_key: &HashMap<FeedbackKey, Arc<dyn SenderQueue>>, alarms: &AlarmSink) {
    let records = match spill.scan() {
        Ok(records) => records,
        Err(e) => {
            alarms.raise(Alarm::new(Stage::Bootstrap, Severity::Error, "PIPE-SPILL-SCAN-FAIL", format!("failed to scan spill file for replay: {e}")));
            return;
        }
    };

    for record in records {
        if record.state.handled {
            continue;
        }
        let mut batch = SendBatch::new(record.meta.destination.clone(), record.meta.payload_kind, record.payload.clone(), record.meta.raw_bytes, record.meta.line_count);
        batch.shard_hash_key = record.meta.shard_hash_key.clone();
        batch.retry_count = record.state.retry_count;
        let cursor = record.meta.cursor.clone();

        match queues_by_key.get(&record.meta.feedback_key) {
            Some(queue) => match queue.push(batch, cursor) {
                Ok(_) => {
                    if let Err(e) = spill.mark_handled(&record) {
                        alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Error, "PIPE-SPILL-MARK-FAIL", format!("failed to mark replayed spill record handled: {e}")));
                    }
                }
                Err(e) => {
                    alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Warn, "PIPE-SPILL-REPLAY-BUSY", format!("spilled batch for {}/{} not re-enqueued yet: {e}", record.meta.destination.project, record.meta.destination.logstore)));
                }
            },
            None => {
                alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Error, "PIPE-SPILL-NO-QUEUE", format!("no sender queue registered for spilled destination {}/{}", record.meta.destination.project, record.meta.destination.logstore)));
            }
        }
    }
}

/// Everything the dispatcher needs to route one input config's events and
/// records: the destination it ships to and the registry that owns its
/// per-file readers.
struct InputRuntime {
    destination: Destination,
    registry: Arc<ReaderRegistry>,
}

/// A fully wired, running pipeline. Dropping this without calling `join`
/// still leaves every thread observing `run_flag`; `join` simply blocks
/// until they've all noticed it cleared.
pub struct Pipeline {
    threads: Vec<JoinHandle<()>>,
    pub alarms: Arc<AlarmSink>,
    pub checkpoints: Arc<CheckpointStore>,
}

impl Pipeline {
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn event_config_name(event: &FilesystemEvent) -> Option<String> {
    match event {
        FilesystemEvent::Create { config_name, .. }
        | FilesystemEvent::Modify { config_name, .. }
        | FilesystemEvent::Delete { config_name, .. }
        | FilesystemEvent::MoveFrom { config_name, .. }
        | FilesystemEvent::MoveTo { config_name, .. }
        | FilesystemEvent::Timeout { config_name, .. }
        | FilesystemEvent::ContainerStopped { config_name }
        | FilesystemEvent::FlushTimeout { config_name, .. } => config_name.clone(),
    }
}

fn enqueue_batch(batch: SendBatch, queues_by_key: &HashMap<FeedbackKey, Arc<dyn SenderQueue>>, alarms: &AlarmSink) {
    let key = batch.feedback_key;
    let cursor = batch.context.cursor.clone();
    match queues_by_key.get(&key) {
        Some(queue) => {
            if let Err(e) = queue.push(batch, cursor) {
                alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Error, "PIPE-ENQUEUE-FAIL", format!("failed to enqueue flushed batch: {e}")));
            }
        }
        None => {
            alarms.raise(Alarm::new(Stage::SenderQueue, Severity::Error, "PIPE-NO-QUEUE", format!("no sender queue registered for destination {}/{}", batch.destination.project, batch.destination.logstore)));
        }
    }
}

fn dispatch_event(
    event: FilesystemEvent,
    inputs: &HashMap<String, InputRuntime>,
    aggregator: &Aggregator,
    queues_by_key: &HashMap<FeedbackKey, Arc<dyn SenderQueue>>,
    alarms: &AlarmSink,
    now: i64,
) {
    let Some(config_name) = event_config_name(&event) else {
        return;
    };
    let Some(input) = inputs.get(&config_name) else {
        return;
    };

    for output in input.registry.handle_event(event, now) {
        for record in output.records {
            let fingerprint = aggregator::fingerprint_for(&input.destination.project, &input.destination.logstore, &record.topic, &record.source_path, &config_name);
            let ready = aggregator.add_record(fingerprint, input.destination.clone(), record, None, now);
            for item in ready {
                enqueue_batch(shipper::build_log_group_batch(item), queues_by_key, alarms);
            }
        }
        // Every record from this output has now been admitted into the
        // aggregator; only now is it safe to let the durable offset catch up
        // to what was actually read (§4.3's rollback rule).
        input.registry.commit_read(&output.path);
    }
}

fn build_parser(pattern: &Option<String>, config_name: &str) -> Result<Arc<dyn LineParser>> {
    match pattern {
        Some(raw) => {
            let re = Regex::new(raw).with_context(|| format!("invalid multiline_begin_regex for input {config_name}"))?;
            Ok(Arc::new(MultilineParser::new(Some(re), Box::new(NoopTimestampExtractor))))
        }
        None => Ok(Arc::new(MultilineParser::single_line())),
    }
}

/// Wire a loaded `Config` into a running pipeline rooted at `state_dir`
/// (home of the checkpoint file, the machine UUID, and the spill buffer
/// unless the config gives them absolute paths of their own). Every thread
/// this spawns watches `run_flag` and exits once it's cleared.
pub fn spawn(config: Config, state_dir: PathBuf, run_flag: Arc<AtomicBool>) -> Result<Pipeline> {
    let global = config.global.clone();
    let alarms = Arc::new(AlarmSink::new(true));
    let feedback = FeedbackBus::new();
    let now = now_secs();

    let checkpoint_path = resolve_state_path(&state_dir, &global.checkpoint_path);
    let checkpoints = Arc::new(CheckpointStore::load(checkpoint_path, DEFAULT_CHECKPOINT_TTL, now, alarms.clone()));

    let hostname = sysinfo::hostname();
    let machine_uuid = sysinfo::machine_uuid(&state_dir).context("failed to load or create machine UUID")?;

    let aggregator = Arc::new(Aggregator::new(MergeMode::ByTopic, Thresholds::default(), feedback.clone(), alarms.clone(), machine_uuid, hostname));

    // Every destination seen across inputs gets exactly one queue, keyed by
    // its feedback key so a project/logstore shared by two input configs
    // shares one queue rather than fragmenting flow control across it.
    //
    // Always a NormalQueue: ExactlyOnceQueue is implemented and unit-tested
    // (see sender::queue) but nothing in the reader layer yet produces the
    // per-read RangeCheckpoint cursors it requires — wiring it here would
    // mean every push panics on the missing cursor. Selecting it per
    // `customized.data_integrity` is future work once the reader grows
    // range-checkpoint generation.
    let mut queues_by_key: HashMap<FeedbackKey, Arc<dyn SenderQueue>> = HashMap::new();
    let mut inputs: HashMap<String, InputRuntime> = HashMap::new();
    let mut dir_poller_configs = Vec::new();
    let mut dir_blacklist = Vec::new();
    let mut filepath_blacklist = Vec::new();
    let mut filename_blacklist = Vec::new();

    for input in &config.inputs {
        dir_blacklist.extend(input.dir_blacklist.iter().cloned());
        filepath_blacklist.extend(input.filepath_blacklist.iter().cloned());
        filename_blacklist.extend(input.filename_blacklist.iter().cloned());

        let destination = Destination {
            project: input.project.clone(),
            logstore: input.logstore.clone(),
            region: global.region.clone(),
            aliuid: global.aliuid.clone(),
        };
        let key = aggregator::feedback_key_for(&destination);
        queues_by_key.entry(key).or_insert_with(|| {
            let capacity = DEFAULT_NORMAL_QUEUE_CAPACITY;
            Arc::new(NormalQueue::new(capacity, capacity * 3 / 4, capacity / 4, feedback.clone(), key, alarms.clone())) as Arc<dyn SenderQueue>
        });

        let topic = input.topic_format.clone().unwrap_or_else(|| input.log_type.clone());
        let parser = build_parser(&input.multiline_begin_regex, &input.config_name)?;
        let registry = Arc::new(ReaderRegistry::new(input.config_name.clone(), topic, checkpoints.clone(), alarms.clone(), parser, DEFAULT_READER_TIME_SLICE));
        inputs.insert(input.config_name.clone(), InputRuntime { destination, registry });

        dir_poller_configs.push(DirPollerConfig {
            config_name: input.config_name.clone(),
            roots: vec![PathBuf::from(&input.base_path)],
            max_depth: input.max_depth,
            first_watch_timeout: DEFAULT_FIRST_WATCH_TIMEOUT,
            repush_interval: DEFAULT_REPUSH_INTERVAL,
        });
    }

    let blacklist = Arc::new(Blacklist::new(&dir_blacklist, &filepath_blacklist, &filename_blacklist).context("invalid blacklist pattern in configuration")?);
    let dir_poller = Arc::new(DirPoller::new(dir_poller_configs, blacklist));
    let modify_poller = Arc::new(ModifyPoller::new(ModifyPollerConfig::default()));
    let events = Arc::new(EventQueue::new(DEFAULT_EVENT_QUEUE_CAPACITY, alarms.clone()));

    let discovery = Discovery::new(dir_poller, modify_poller, events.clone(), alarms.clone());
    let hold_flag = Arc::new(AtomicBool::new(false));

    let mut threads = Vec::new();
    threads.push(discovery.spawn_dir_poller(discovery::default_dir_poll_interval(), run_flag.clone(), hold_flag.clone()));
    threads.push(discovery.spawn_modify_poller(discovery::default_modify_poll_interval(), run_flag.clone(), hold_flag.clone()));

    let mut regions = RegionRegistry::new();
    if !global.endpoints.is_empty() {
        let endpoints: Vec<DestinationEndpoint> = global.endpoints.iter().map(|e| DestinationEndpoint::new(e.address.clone(), e.proxy)).collect();
        regions.register(RegionState::new(global.region.clone(), endpoints, global.region_concurrency, global.max_bytes_per_sec));
    } else {
        alarms.raise(Alarm::new(Stage::Bootstrap, Severity::Warn, "PIPE-NO-ENDPOINTS", "no endpoints configured for region; shipped batches will spill until endpoints are added"));
    }

    let signer: Arc<dyn RequestSigner> = Arc::new(HmacV4Signer::new(global.credentials.access_key_id.clone(), global.credentials.access_key_secret.clone()));
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(DEFAULT_TRANSPORT_TIMEOUT).context("failed to build HTTP transport")?);
    let buffer_file_path = resolve_state_path(&state_dir, &global.buffer_file_path);
    let spill = Arc::new(SpillFile::new(buffer_file_path, global.buffer_file_max_size));
    replay_spilled_batches(&spill, &queues_by_key, &alarms);

    let shipper = Arc::new(Shipper::new(
        queues_by_key.values().cloned().collect(),
        Arc::new(regions),
        signer,
        transport,
        spill,
        feedback.clone(),
        alarms.clone(),
        ShipperConfig::default(),
    ));
    threads.extend(shipper.spawn_workers(run_flag.clone(), now_secs));

    threads.push(checkpoints.clone().spawn_periodic_dump(DEFAULT_DUMP_INTERVAL, run_flag.clone()));

    let inputs = Arc::new(inputs);
    let queues_by_key = Arc::new(queues_by_key);

    {
        let events = events.clone();
        let inputs = inputs.clone();
        let aggregator = aggregator.clone();
        let queues_by_key = queues_by_key.clone();
        let alarms = alarms.clone();
        let run_flag = run_flag.clone();
        threads.push(std::thread::spawn(move || {
            while run_flag.load(Ordering::SeqCst) {
                let drained = events.drain_blocking(DEFAULT_DRAIN_TIMEOUT);
                if drained.is_empty() {
                    continue;
                }
                let now = now_secs();
                for event in drained {
                    dispatch_event(event, &inputs, &aggregator, &queues_by_key, &alarms, now);
                }
            }
        }));
    }

    {
        let inputs = inputs.clone();
        let aggregator = aggregator.clone();
        let queues_by_key = queues_by_key.clone();
        let alarms = alarms.clone();
        let run_flag = run_flag.clone();
        threads.push(std::thread::spawn(move || {
            while run_flag.load(Ordering::SeqCst) {
                std::thread::sleep(DEFAULT_SWEEP_INTERVAL);
                let now = now_secs();
                let (items, packages) = aggregator.sweep_ready(now);
                for item in items {
                    enqueue_batch(shipper::build_log_group_batch(item), &queues_by_key, &alarms);
                }
                for package in packages {
                    enqueue_batch(shipper::build_package_list_batch(package), &queues_by_key, &alarms);
                }
                for input in inputs.values() {
                    input.registry.reap_exhausted_rotators();
                }
            }
        }));
    }

    Ok(Pipeline { threads, alarms, checkpoints })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::PayloadKind;
    use crate::sender::queue::NormalQueue;
    use tempfile::tempdir;

    fn destination() -> Destination {
        Destination {
            project: "proj".into(),
            logstore: "store".into(),
            region: "cn-hangzhou".into(),
            aliuid: "1".into(),
        }
    }

    #[test]
    fn replay_reenqueues_unhandled_spilled_batch_and_marks_it_handled() {
        let dir = tempdir().unwrap();
        let spill = SpillFile::new(dir.path().join("buffer"), 1024 * 1024);
        let destination = destination();
        let key = aggregator::feedback_key_for(&destination);
        let feedback = FeedbackBus::new();
        let alarms = Arc::new(AlarmSink::new(false));

        let meta = crate::shipper::spill::PayloadMeta {
            destination: destination.clone(),
            payload_kind: PayloadKind::Lz4Compressed,
            raw_bytes: 5,
            line_count: 1,
            shard_hash_key: "shard".into(),
            feedback_key: key,
            cursor: None,
        };
        spill.append(&meta, b"hello", 1_000).unwrap();

        let mut queues_by_key: HashMap<FeedbackKey, Arc<dyn SenderQueue>> = HashMap::new();
        let queue: Arc<dyn SenderQueue> = Arc::new(NormalQueue::new(16, 12, 4, feedback, key, alarms.clone()));
        queues_by_key.insert(key, queue.clone());

        replay_spilled_batches(&spill, &queues_by_key, &alarms);

        assert_eq!(queue.len(), 1, "the spilled batch must be re-enqueued on restart");
        let records = spill.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].state.handled, "a successfully re-enqueued record must be marked handled so it isn't replayed again");
    }

    #[test]
    fn replay_leaves_record_unhandled_when_no_queue_matches() {
        let dir = tempdir().unwrap();
        let spill = SpillFile::new(dir.path().join("buffer"), 1024 * 1024);
        let destination = destination();
        let key = aggregator::feedback_key_for(&destination);
        let alarms = Arc::new(AlarmSink::new(false));

        let meta = crate::shipper::spill::PayloadMeta {
            destination,
            payload_kind: PayloadKind::Lz4Compressed,
            raw_bytes: 5,
            line_count: 1,
            shard_hash_key: "shard".into(),
            feedback_key: key,
            cursor: None,
        };
        spill.append(&meta, b"hello", 1_000).unwrap();

        let queues_by_key: HashMap<FeedbackKey, Arc<dyn SenderQueue>> = HashMap::new();
        replay_spilled_batches(&spill, &queues_by_key, &alarms);

        let records = spill.scan().unwrap();
        assert!(!records[0].state.handled, "a record with no matching queue must stay unhandled so a later restart can retry it");
    }

    #[test]
    fn resolve_state_path_roots_relative_paths_under_state_dir_but_leaves_absolute_ones_alone() {
        let state_dir = PathBuf::from("/var/lib/tailship");
        assert_eq!(resolve_state_path(&state_dir, &PathBuf::from("checkpoint.json")), PathBuf::from("/var/lib/tailship/checkpoint.json"));
        assert_eq!(resolve_state_path(&state_dir, &PathBuf::from("/etc/tailship/checkpoint.json")), PathBuf::from("/etc/tailship/checkpoint.json"));
    }
}
