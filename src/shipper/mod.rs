//! Worker pool: picks Idle batches round-robin across queues, honors
//! per-region flow control, signs and POSTs the request, and on final
//! failure spills to the on-disk buffer file (§4.6).

pub mod spill;
pub mod transport;

use crate::aggregator::{MergeItem, PackageList};
use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::feedback::FeedbackBus;
use crate::model::Destination;
use crate::sender::region::RegionRegistry;
use crate::sender::signing::RequestSigner;
use crate::sender::{BatchContext, PayloadKind, SendBatch, SendResult, SenderQueue};
use spill::{PayloadMeta, SpillFile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use transport::{Transport, TransportRequest};

/// Pure-Rust LZ4 block compression, prefixed with the original length so
/// the receiving side (or a local decompress-for-test) doesn't need it
/// passed out of band.
pub fn compress_bytes(raw: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(raw)
}

pub fn decompress_bytes(compressed: &[u8]) -> Result<Vec<u8>, lz4_flex::block::DecompressError> {
    lz4_flex::decompress_size_prepended(compressed)
}

/// Serializes and compresses one flushed MergeItem into a `SendBatch` ready
/// to push onto a sender queue.
pub fn build_log_group_batch(item: MergeItem) -> SendBatch {
    let raw = serde_json::to_vec(&item.group).expect("LogGroup always serializes");
    let compressed = compress_bytes(&raw);
    let mut batch = SendBatch::new(item.destination, PayloadKind::Lz4Compressed, compressed, item.raw_bytes, item.line_count);
    batch.context = BatchContext {
        file_path: item.group.source.clone().into(),
        cursor: item.cursor.clone(),
    };
    batch.shard_hash_key = item.fingerprint_hash_key();
    batch
}

/// Concatenates a PackageList's member groups (length-prefixed) and
/// compresses the whole package once, per §4.6's "per-protocol for
/// PackageList" note.
pub fn build_package_list_batch(package: PackageList) -> SendBatch {
    let mut raw = Vec::new();
    let destination = Destination {
        project: package.project.clone(),
        logstore: package.logstore.clone(),
        region: package.items.first().map(|i| i.destination.region.clone()).unwrap_or_default(),
        aliuid: package.items.first().map(|i| i.destination.aliuid.clone()).unwrap_or_default(),
    };
    let raw_bytes: usize = package.raw_bytes();
    let line_count: usize = package.items.iter().map(|i| i.line_count).sum();
    for item in &package.items {
        let group_bytes = serde_json::to_vec(&item.group).expect("LogGroup always serializes");
        raw.extend_from_slice(&(group_bytes.len() as u32).to_le_bytes());
        raw.extend_from_slice(&group_bytes);
    }
    let compressed = compress_bytes(&raw);
    let mut batch = SendBatch::new(destination, PayloadKind::PackageList, compressed, raw_bytes, line_count);
    batch.shard_hash_key = format!("{}:{}", package.project, package.logstore);
    batch
}

impl MergeItem {
    fn fingerprint_hash_key(&self) -> String {
        format!("{:016X}", self.fingerprint.0)
    }
}

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub idle_backoff: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        ShipperConfig {
            worker_count: 4,
            max_retries: 5,
            idle_backoff: Duration::from_millis(200),
        }
    }
}

/// Owns the full set of per-destination queues and drives dispatch against
/// them round-robin. One `Shipper` serves the whole process; its worker
/// threads are spawned by `spawn_workers`.
pub struct Shipper {
    queues: Vec<Arc<dyn SenderQueue>>,
    regions: Arc<RegionRegistry>,
    signer: Arc<dyn RequestSigner>,
    transport: Arc<dyn Transport>,
    spill: Arc<SpillFile>,
    feedback: Arc<FeedbackBus>,
    alarms: Arc<AlarmSink>,
    config: ShipperConfig,
    next_queue: Mutex<usize>,
}

impl Shipper {
    pub fn new(
        queues: Vec<Arc<dyn SenderQueue>>,
        regions: Arc<RegionRegistry>,
        signer: Arc<dyn RequestSigner>,
        transport: Arc<dyn Transport>,
        spill: Arc<SpillFile>,
        feedback: Arc<FeedbackBus>,
        alarms: Arc<AlarmSink>,
        config: ShipperConfig,
    ) -> Self {
        Shipper {
            queues,
            regions,
            signer,
            transport,
            spill,
            feedback,
            alarms,
            config,
            next_queue: Mutex::new(0),
        }
    }

    /// Pops one idle batch from the next queue in round-robin order and
    /// dispatches it. Returns true if a batch was found (whether or not the
    /// dispatch itself succeeded).
    pub fn dispatch_once(&self, now_ts: i64) -> bool {
        if self.queues.is_empty() {
            return false;
        }
        let start = {
            let mut cursor = self.next_queue.lock().unwrap();
            let start = *cursor;
            *cursor = (*cursor + 1) % self.queues.len();
            start
        };

        for offset in 0..self.queues.len() {
            let queue = &self.queues[(start + offset) % self.queues.len()];
            if let Some((id, batch)) = queue.pop_idle() {
                self.handle_batch(queue.as_ref(), id, batch, now_ts);
                return true;
            }
        }
        false
    }

    fn handle_batch(&self, queue: &dyn SenderQueue, id: u64, batch: SendBatch, now_ts: i64) {
        let region_name = batch.destination.region.clone();
        let Some(region) = self.regions.get(&region_name) else {
            self.alarms.raise(Alarm::new(Stage::Shipper, Severity::Error, "SHIP-NO-REGION", format!("no region registered for {region_name}")));
            self.spill_and_complete(queue, id, batch, now_ts);
            return;
        };

        if !region.try_reserve(batch.compressed_bytes.len() as i64, Instant::now()) {
            let _ = queue.complete(id, SendResult::NetworkFail);
            return;
        }

        let result = self.attempt_send(region_name.as_str(), &batch, now_ts);
        region.release();

        match result {
            Ok(endpoint_address) => {
                region.report_success(&endpoint_address, Duration::from_millis(0));
                let _ = queue.complete(id, SendResult::Ok);
            }
            Err(DispatchFailure::Unauthorized) => {
                self.alarms.raise(Alarm::new(Stage::Shipper, Severity::Warn, "SHIP-UNAUTHORIZED", "credential refresh required, retrying"));
                let _ = queue.complete(id, SendResult::UnauthorizedFail);
            }
            Err(DispatchFailure::Quota) => {
                let _ = queue.complete(id, SendResult::QuotaFail);
            }
            Err(DispatchFailure::Network(endpoint_address)) => {
                if let Some(addr) = &endpoint_address {
                    region.report_failure(addr);
                }
                if batch.retry_count + 1 >= self.config.max_retries {
                    self.spill_and_complete(queue, id, batch, now_ts);
                } else {
                    let _ = queue.complete(id, SendResult::NetworkFail);
                }
            }
            Err(DispatchFailure::Other) => {
                if batch.retry_count + 1 >= self.config.max_retries {
                    self.spill_and_complete(queue, id, batch, now_ts);
                } else {
                    let _ = queue.complete(id, SendResult::OtherFail);
                }
            }
        }
    }

    fn attempt_send(&self, region_name: &str, batch: &SendBatch, now_ts: i64) -> Result<String, DispatchFailure> {
        let region = self.regions.get(region_name).ok_or(DispatchFailure::Other)?;
        let endpoint = region.pick_endpoint().ok_or(DispatchFailure::Other)?;
        let path = format!("/logstores/{}", batch.destination.logstore);
        let signed = self.signer.sign("POST", &path, &batch.compressed_bytes, now_ts);

        let request = TransportRequest {
            url: format!("https://{}{}", endpoint.address, path),
            method: "POST",
            headers: vec![
                ("Authorization".to_string(), signed.authorization),
                ("Content-SHA256".to_string(), signed.content_sha256),
                ("x-ts-bodyrawsize".to_string(), batch.raw_bytes.to_string()),
            ],
            body: batch.compressed_bytes.clone(),
        };

        match self.transport.send(request) {
            Ok(response) if (200..300).contains(&response.status) => Ok(endpoint.address),
            Ok(response) if response.status == 401 => Err(DispatchFailure::Unauthorized),
            Ok(response) if response.status == 429 => Err(DispatchFailure::Quota),
            Ok(response) if response.status >= 500 => Err(DispatchFailure::Network(Some(endpoint.address))),
            Ok(_) => Err(DispatchFailure::Other),
            Err(_) => Err(DispatchFailure::Network(Some(endpoint.address))),
        }
    }

    fn spill_and_complete(&self, queue: &dyn SenderQueue, id: u64, batch: SendBatch, now_ts: i64) {
        let meta = PayloadMeta {
            destination: batch.destination.clone(),
            payload_kind: batch.payload_kind,
            raw_bytes: batch.raw_bytes,
            line_count: batch.line_count,
            shard_hash_key: batch.shard_hash_key.clone(),
            feedback_key: batch.feedback_key,
            cursor: batch.context.cursor.clone(),
        };
        match self.spill.append(&meta, &batch.compressed_bytes, now_ts) {
            Ok(_) => {
                self.alarms.raise(Alarm::new(Stage::Shipper, Severity::Warn, "SHIP-SPILLED", format!("exhausted retries for {}/{}, spilled to disk", batch.destination.project, batch.destination.logstore)));
                let _ = queue.complete(id, SendResult::Buffered);
            }
            Err(e) => {
                self.alarms.raise(Alarm::new(Stage::Shipper, Severity::Error, "SHIP-SPILL-FAIL", format!("failed to spill batch, discarding: {e}")));
                let _ = queue.complete(id, SendResult::Discard);
            }
        }
        if self.spill.should_compact() {
            let _ = self.spill.compact();
        }
    }

    /// Spawns `config.worker_count` threads, each independently
    /// round-robining across every queue. A worker that finds no idle work
    /// anywhere backs off for `idle_backoff` rather than busy-spinning, and
    /// wakes early on any feedback transition.
    pub fn spawn_workers(self: Arc<Self>, run_flag: Arc<AtomicBool>, now_source: impl Fn() -> i64 + Send + Sync + Clone + 'static) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|_| {
                let shipper = Arc::clone(&self);
                let run_flag = Arc::clone(&run_flag);
                let now_source = now_source.clone();
                std::thread::spawn(move || {
                    while run_flag.load(Ordering::Relaxed) {
                        let did_work = shipper.dispatch_once(now_source());
                        if !did_work {
                            shipper.feedback.wait_for_change(shipper.config.idle_backoff);
                        }
                    }
                })
            })
            .collect()
    }
}

enum DispatchFailure {
    Unauthorized,
    Quota,
    Network(Option<String>),
    Other,
}
