//! Persistent checkpoint subsystem: durable snapshots of reader offsets and
//! in-flight exactly-once slots.
//!
//! Periodic dump (default every 5s, jittered) writes all current file
//! checkpoints and exactly-once slot states to a single file atomically
//! (write-temp + rename). On load, entries older than `file_check_point_time_out`
//! are discarded. Deleting a reader's checkpoint is idempotent.

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::model::{DirectoryCheckpoint, FileCheckpoint, RangeCheckpoint};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const CHECK_POINT_VERSION: u32 = 1;
pub const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write checkpoint file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse checkpoint file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk representation: forward-compatible via `check_point_version`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CheckpointFile {
    check_point_version: u32,
    files: Vec<FileCheckpoint>,
    directories: Vec<DirectoryCheckpoint>,
    ranges: Vec<RangeCheckpoint>,
}

#[derive(Default)]
struct State {
    files: HashMap<PathBuf, FileCheckpoint>,
    directories: HashMap<PathBuf, DirectoryCheckpoint>,
    ranges: HashMap<String, RangeCheckpoint>,
}

pub struct CheckpointStore {
    state: Mutex<State>,
    path: PathBuf,
    alarms: Arc<AlarmSink>,
}

impl CheckpointStore {
    /// Load the checkpoint file at `path` if present, discarding entries
    /// older than `ttl`. Missing or corrupt files start fresh (logged, not
    /// fatal) per the process-level error-handling policy.
    pub fn load(path: PathBuf, ttl: Duration, now: i64, alarms: Arc<AlarmSink>) -> Self {
        let mut state = State::default();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CheckpointFile>(&bytes) {
                Ok(file) => {
                    let ttl_secs = ttl.as_secs() as i64;
                    for fc in file.files {
                        if now - fc.last_updated <= ttl_secs {
                            state.files.insert(fc.path.clone(), fc);
                        }
                    }
                    for dc in file.directories {
                        if now - dc.last_updated <= ttl_secs {
                            state.directories.insert(dc.path.clone(), dc);
                        }
                    }
                    for rc in file.ranges {
                        state.ranges.insert(rc.key.clone(), rc);
                    }
                }
                Err(e) => {
                    alarms.raise(Alarm::new(
                        Stage::Checkpoint,
                        Severity::Error,
                        "CKPT-CORRUPT",
                        format!("checkpoint file corrupt, starting fresh: {e}"),
                    ));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                alarms.raise(Alarm::new(
                    Stage::Checkpoint,
                    Severity::Warn,
                    "CKPT-READ-FAIL",
                    format!("failed reading checkpoint file, starting fresh: {e}"),
                ));
            }
        }
        CheckpointStore {
            state: Mutex::new(state),
            path,
            alarms,
        }
    }

    pub fn put_file(&self, checkpoint: FileCheckpoint) {
        self.state.lock().unwrap().files.insert(checkpoint.path.clone(), checkpoint);
    }

    pub fn get_file(&self, path: &Path) -> Option<FileCheckpoint> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Idempotent: removing an absent checkpoint is not an error.
    pub fn remove_file(&self, path: &Path) {
        self.state.lock().unwrap().files.remove(path);
    }

    pub fn put_directory(&self, checkpoint: DirectoryCheckpoint) {
        self.state.lock().unwrap().directories.insert(checkpoint.path.clone(), checkpoint);
    }

    pub fn get_directory(&self, path: &Path) -> Option<DirectoryCheckpoint> {
        self.state.lock().unwrap().directories.get(path).cloned()
    }

    pub fn put_range(&self, checkpoint: RangeCheckpoint) {
        self.state.lock().unwrap().ranges.insert(checkpoint.key.clone(), checkpoint);
    }

    pub fn get_range(&self, key: &str) -> Option<RangeCheckpoint> {
        self.state.lock().unwrap().ranges.get(key).cloned()
    }

    pub fn remove_range(&self, key: &str) {
        self.state.lock().unwrap().ranges.remove(key);
    }

    pub fn all_ranges(&self) -> Vec<RangeCheckpoint> {
        self.state.lock().unwrap().ranges.values().cloned().collect()
    }

    /// Write-temp + rename: the only durable persistence point in the crate.
    pub fn dump(&self) -> Result<(), CheckpointError> {
        let snapshot = {
            let guard = self.state.lock().unwrap();
            CheckpointFile {
                check_point_version: CHECK_POINT_VERSION,
                files: guard.files.values().cloned().collect(),
                directories: guard.directories.values().cloned().collect(),
                ranges: guard.ranges.values().cloned().collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        std::fs::write(&tmp_path, &bytes).map_err(|source| CheckpointError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    fn dump_with_alarm(&self) {
        if let Err(e) = self.dump() {
            self.alarms.raise(Alarm::new(
                Stage::Checkpoint,
                Severity::Error,
                "CKPT-DUMP-FAIL",
                format!("periodic checkpoint dump failed: {e}"),
            ));
        }
    }

    /// Spawn the checkpoint thread: dumps every `interval`, jittered once at
    /// startup by a random offset in `[0, interval)` (mirrors the upstream
    /// `RandomUtil` jitter so many configs don't all flush in lockstep).
    pub fn spawn_periodic_dump(
        self: Arc<Self>,
        interval: Duration,
        run_flag: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64));
        std::thread::spawn(move || {
            std::thread::sleep(jitter);
            while run_flag.load(Ordering::SeqCst) {
                self.dump_with_alarm();
                std::thread::sleep(interval);
            }
            // Final best-effort dump so cancellation doesn't lose the last
            // interval's worth of progress.
            self.dump_with_alarm();
        })
    }
}
