//! Filesystem events and the bounded `EventQueue` between Discovery and the
//! reader registries.

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::model::DevInode;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Tagged filesystem event, heap-owned: the queue transfers ownership from
/// producer (a poller) to consumer (the dispatcher thread).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemEvent {
    Create {
        source_dir: PathBuf,
        object_name: String,
        config_name: Option<String>,
    },
    Modify {
        source_dir: PathBuf,
        object_name: String,
        dev_inode: Option<DevInode>,
        config_name: Option<String>,
    },
    Delete {
        source_dir: PathBuf,
        object_name: String,
        config_name: Option<String>,
    },
    MoveFrom {
        source_dir: PathBuf,
        object_name: String,
        cookie: Option<u64>,
        config_name: Option<String>,
    },
    MoveTo {
        source_dir: PathBuf,
        object_name: String,
        cookie: Option<u64>,
        config_name: Option<String>,
    },
    Timeout {
        source_dir: PathBuf,
        config_name: Option<String>,
    },
    ContainerStopped {
        config_name: Option<String>,
    },
    FlushTimeout {
        source_dir: PathBuf,
        object_name: String,
        dev_inode: Option<DevInode>,
        config_name: Option<String>,
        /// Generation at schedule time; used to detect staleness per §4.3.
        generation: u64,
    },
}

impl FilesystemEvent {
    /// Coalescing key: successive identical (source, object, type, dev_inode)
    /// events collapse into one on drain.
    fn coalesce_key(&self) -> (u8, &std::path::Path, &str, Option<DevInode>) {
        match self {
            FilesystemEvent::Create { source_dir, object_name, .. } => (0, source_dir, object_name, None),
            FilesystemEvent::Modify { source_dir, object_name, dev_inode, .. } => {
                (1, source_dir, object_name, *dev_inode)
            }
            FilesystemEvent::Delete { source_dir, object_name, .. } => (2, source_dir, object_name, None),
            FilesystemEvent::MoveFrom { source_dir, object_name, .. } => (3, source_dir, object_name, None),
            FilesystemEvent::MoveTo { source_dir, object_name, .. } => (4, source_dir, object_name, None),
            FilesystemEvent::Timeout { source_dir, .. } => (5, source_dir, "", None),
            FilesystemEvent::ContainerStopped { .. } => (6, std::path::Path::new(""), "", None),
            FilesystemEvent::FlushTimeout { source_dir, object_name, dev_inode, .. } => {
                (7, source_dir, object_name, *dev_inode)
            }
        }
    }
}

/// Default retry budget per spec §4.2: back off 10ms, retry up to 1000 times.
pub const DEFAULT_PUSH_RETRY_ATTEMPTS: u32 = 1000;
pub const DEFAULT_PUSH_RETRY_BACKOFF: Duration = Duration::from_millis(10);

struct Inner {
    deque: VecDeque<FilesystemEvent>,
    capacity: usize,
}

/// Mutex-guarded bounded deque of events with drop-on-overflow semantics.
pub struct EventQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    alarms: Arc<AlarmSink>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl EventQueue {
    pub fn new(capacity: usize, alarms: Arc<AlarmSink>) -> Self {
        Self::with_retry_policy(capacity, alarms, DEFAULT_PUSH_RETRY_ATTEMPTS, DEFAULT_PUSH_RETRY_BACKOFF)
    }

    /// Same as `new` but with an explicit retry budget — used by tests that
    /// need to exercise the drop-on-overflow path without waiting ~10s.
    pub fn with_retry_policy(capacity: usize, alarms: Arc<AlarmSink>, retry_attempts: u32, retry_backoff: Duration) -> Self {
        EventQueue {
            inner: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity),
                capacity,
            }),
            not_empty: Condvar::new(),
            alarms,
            retry_attempts,
            retry_backoff,
        }
    }

    /// Push one event, retrying on a full queue for up to the configured
    /// retry budget; on final failure, drops and alarms — the only place in
    /// the pipeline allowed to drop data.
    pub fn push(&self, event: FilesystemEvent) {
        let mut attempts = 0;
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if guard.deque.len() < guard.capacity {
                    guard.deque.push_back(event);
                    drop(guard);
                    self.not_empty.notify_one();
                    return;
                }
            }
            if attempts >= self.retry_attempts {
                self.alarms.raise(
                    Alarm::new(
                        Stage::EventQueue,
                        Severity::Warn,
                        "EQ-OVERFLOW-DROP",
                        "event queue full after retry budget exhausted; dropping event",
                    ),
                );
                return;
            }
            attempts += 1;
            std::thread::sleep(self.retry_backoff);
        }
    }

    /// Drain all currently-queued events, coalescing successive duplicates.
    /// Blocks until at least one event is available or `timeout` elapses.
    pub fn drain_blocking(&self, timeout: Duration) -> Vec<FilesystemEvent> {
        let guard = self.inner.lock().unwrap();
        let (mut guard, _) = self
            .not_empty
            .wait_timeout_while(guard, timeout, |inner| inner.deque.is_empty())
            .unwrap();
        Self::drain_locked(&mut guard)
    }

    pub fn try_drain(&self) -> Vec<FilesystemEvent> {
        let mut guard = self.inner.lock().unwrap();
        Self::drain_locked(&mut guard)
    }

    fn drain_locked(guard: &mut Inner) -> Vec<FilesystemEvent> {
        let mut out: Vec<FilesystemEvent> = Vec::with_capacity(guard.deque.len());
        while let Some(event) = guard.deque.pop_front() {
            let key = event.coalesce_key();
            let dup = out
                .last()
                .map(|prev: &FilesystemEvent| prev.coalesce_key() == key)
                .unwrap_or(false);
            if !dup {
                out.push(event);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modify(dir: &str, name: &str) -> FilesystemEvent {
        FilesystemEvent::Modify {
            source_dir: PathBuf::from(dir),
            object_name: name.to_string(),
            dev_inode: None,
            config_name: None,
        }
    }

    #[test]
    fn coalesces_successive_identical_events_on_drain() {
        let q = EventQueue::new(16, Arc::new(AlarmSink::new(false)));
        q.push(modify("/a", "x.log"));
        q.push(modify("/a", "x.log"));
        q.push(modify("/a", "x.log"));
        q.push(modify("/a", "y.log"));
        let drained = q.try_drain();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn drops_and_alarms_when_full_past_retry_budget() {
        let alarms = Arc::new(AlarmSink::new(false));
        let q = EventQueue::with_retry_policy(1, alarms.clone(), 3, Duration::from_millis(1));
        q.push(modify("/a", "1"));
        // Second push retries against a queue nothing drains, forcing the
        // drop-on-overflow path after the (tiny, test-only) retry budget.
        q.push(modify("/a", "2"));
        let snap = alarms.snapshot();
        assert!(snap.iter().any(|a| a.code == "EQ-OVERFLOW-DROP"));
        // Only the first event survives.
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drain_preserves_order_across_distinct_keys() {
        let q = EventQueue::new(16, Arc::new(AlarmSink::new(false)));
        q.push(modify("/a", "1"));
        q.push(modify("/a", "2"));
        q.push(modify("/a", "3"));
        let drained = q.try_drain();
        let names: Vec<_> = drained
            .iter()
            .map(|e| match e {
                FilesystemEvent::Modify { object_name, .. } => object_name.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["1", "2", "3"]);
    }
}
