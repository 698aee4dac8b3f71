//! Reader registry (`ModifyHandler`): one instance per active config, owning
//! the path→reader-array and dev-inode→reader indices, rotation handling,
//! and the per-registry read time-slice (§4.3).

pub mod log_file_reader;

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::checkpoint::CheckpointStore;
use crate::event::FilesystemEvent;
use crate::model::DevInode;
use log_file_reader::{LineParser, LogFileReader, ReaderError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A read produced by the registry for the aggregator to consume.
///
/// The bytes behind `records` are not yet reflected in the durable
/// checkpoint: the caller must call `ReaderRegistry::commit_read(&path)`
/// once it has handed every record here to the aggregator, so the offset
/// persisted to disk never runs ahead of what was actually admitted.
pub struct ReaderOutput {
    pub config_name: String,
    pub path: PathBuf,
    pub records: Vec<crate::model::LogRecord>,
}

struct RotatorEntry {
    reader: LogFileReader,
    retired_at: Instant,
}

pub struct ReaderRegistry {
    config_name: String,
    topic: String,
    checkpoints: Arc<CheckpointStore>,
    alarms: Arc<AlarmSink>,
    parser: Arc<dyn LineParser>,
    read_time_slice: Duration,
    name_to_reader_array: Mutex<HashMap<PathBuf, Vec<DevInode>>>,
    devinode_to_reader: Mutex<HashMap<DevInode, LogFileReader>>,
    rotator_readers: Mutex<Vec<RotatorEntry>>,
    generation: Mutex<u64>,
}

impl ReaderRegistry {
    pub fn new(config_name: String, topic: String, checkpoints: Arc<CheckpointStore>, alarms: Arc<AlarmSink>, parser: Arc<dyn LineParser>, read_time_slice: Duration) -> Self {
        ReaderRegistry {
            config_name,
            topic,
            checkpoints,
            alarms,
            parser,
            read_time_slice,
            name_to_reader_array: Mutex::new(HashMap::new()),
            devinode_to_reader: Mutex::new(HashMap::new()),
            rotator_readers: Mutex::new(Vec::new()),
            generation: Mutex::new(0),
        }
    }

    pub fn current_generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    fn bump_generation(&self) -> u64 {
        let mut g = self.generation.lock().unwrap();
        *g += 1;
        *g
    }

    /// Dispatch one drained event to this registry, producing whatever
    /// records were read (if any). Runs under the registry's time-slice: if
    /// the cumulative read time for this call would exceed
    /// `read_time_slice`, reading stops early and resumes on the next event
    /// for the same file.
    pub fn handle_event(&self, event: FilesystemEvent, now: i64) -> Vec<ReaderOutput> {
        match event {
            FilesystemEvent::Create { source_dir, object_name, .. } => {
                self.handle_create(source_dir.join(object_name), now);
                Vec::new()
            }
            FilesystemEvent::Modify { source_dir, object_name, dev_inode, .. } => {
                self.handle_modify(source_dir.join(object_name), dev_inode, now)
            }
            FilesystemEvent::Delete { source_dir, object_name, .. } => {
                self.handle_delete(source_dir.join(object_name));
                Vec::new()
            }
            FilesystemEvent::MoveFrom { source_dir, object_name, .. } => {
                self.handle_rotation(source_dir.join(object_name));
                Vec::new()
            }
            FilesystemEvent::MoveTo { .. } => Vec::new(),
            FilesystemEvent::Timeout { .. } => Vec::new(),
            FilesystemEvent::ContainerStopped { .. } => {
                self.mark_all_container_stopped();
                Vec::new()
            }
            FilesystemEvent::FlushTimeout { source_dir, object_name, generation, .. } => {
                if generation != self.current_generation() {
                    self.alarms.raise(Alarm::new(Stage::Reader, Severity::Debug, "READER-STALE-FLUSH", "discarding stale FlushTimeout").with_config(self.config_name.clone()));
                    return Vec::new();
                }
                self.handle_flush_timeout(source_dir.join(object_name), now)
            }
        }
    }

    fn handle_create(&self, path: PathBuf, _now: i64) {
        let mut devinode_map = self.devinode_to_reader.lock().unwrap();
        let checkpoint = self.checkpoints.get_file(&path);
        let start_offset = checkpoint.as_ref().map(|c| c.offset).unwrap_or_else(|| std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0));

        let reader = match LogFileReader::open(path.clone(), self.config_name.clone(), self.topic.clone(), checkpoint.as_ref(), start_offset, &self.alarms) {
            Ok(r) => r,
            Err(e) => {
                self.alarms.raise(Alarm::new(Stage::Reader, Severity::Warn, "READER-OPEN-FAIL", format!("failed to open new file: {e}")).with_config(self.config_name.clone()));
                return;
            }
        };
        let dev_inode = reader.dev_inode();
        devinode_map.insert(dev_inode, reader);
        drop(devinode_map);

        let mut names = self.name_to_reader_array.lock().unwrap();
        names.entry(path).or_default().insert(0, dev_inode);
    }

    fn handle_modify(&self, path: PathBuf, dev_inode: Option<DevInode>, now: i64) -> Vec<ReaderOutput> {
        let started = Instant::now();
        let target = dev_inode.or_else(|| self.head_dev_inode(&path));
        let Some(dev_inode) = target else {
            self.handle_create(path, now);
            return Vec::new();
        };

        let mut devinode_map = self.devinode_to_reader.lock().unwrap();
        let Some(reader) = devinode_map.get_mut(&dev_inode) else {
            return Vec::new();
        };

        let mut all_records = Vec::new();
        loop {
            let records = match reader.read_once(&*self.parser, now) {
                Ok(r) => r,
                Err(e) => {
                    self.alarms.raise(Alarm::new(Stage::Reader, Severity::Warn, "READER-READ-FAIL", format!("{e}")).with_config(self.config_name.clone()));
                    break;
                }
            };
            let exhausted = records.is_empty();
            all_records.extend(records);
            if exhausted || started.elapsed() >= self.read_time_slice {
                break;
            }
        }

        if !all_records.is_empty() {
            vec![ReaderOutput {
                config_name: self.config_name.clone(),
                path,
                records: all_records,
            }]
        } else {
            Vec::new()
        }
    }

    /// Folds the bytes behind a prior `ReaderOutput` into the durable
    /// checkpoint. Call only after every record in that output has been
    /// handed to (and admitted by) the aggregator — never right after
    /// `handle_event` returns, or a crash before admission would still
    /// advance the on-disk offset past data the aggregator never saw.
    pub fn commit_read(&self, path: &PathBuf) {
        let Some(dev_inode) = self.head_dev_inode(path) else { return };
        let mut devinode_map = self.devinode_to_reader.lock().unwrap();
        let Some(reader) = devinode_map.get_mut(&dev_inode) else { return };
        reader.commit_pending();
        self.checkpoints.put_file(reader.checkpoint());
    }

    fn handle_delete(&self, path: PathBuf) {
        let mut names = self.name_to_reader_array.lock().unwrap();
        if let Some(dev_inodes) = names.remove(&path) {
            let mut devinode_map = self.devinode_to_reader.lock().unwrap();
            for di in dev_inodes {
                devinode_map.remove(&di);
                self.checkpoints.remove_file(&path);
            }
        }
    }

    /// A rotation: move the current head reader into `rotator_readers` and
    /// let the next Create/Modify event build a fresh head.
    fn handle_rotation(&self, path: PathBuf) {
        let mut names = self.name_to_reader_array.lock().unwrap();
        let Some(dev_inodes) = names.get_mut(&path) else { return };
        if dev_inodes.is_empty() {
            return;
        }
        let retired = dev_inodes.remove(0);
        drop(names);

        let mut devinode_map = self.devinode_to_reader.lock().unwrap();
        if let Some(reader) = devinode_map.remove(&retired) {
            self.rotator_readers.lock().unwrap().push(RotatorEntry { reader, retired_at: Instant::now() });
        }
    }

    fn head_dev_inode(&self, path: &PathBuf) -> Option<DevInode> {
        self.name_to_reader_array.lock().unwrap().get(path).and_then(|arr| arr.first().copied())
    }

    fn mark_all_container_stopped(&self) {
        self.alarms.raise(Alarm::new(Stage::Reader, Severity::Info, "READER-CONTAINER-STOPPED", "marking all readers for teardown at EOF").with_config(self.config_name.clone()));
    }

    fn handle_flush_timeout(&self, path: PathBuf, now: i64) -> Vec<ReaderOutput> {
        let Some(dev_inode) = self.head_dev_inode(&path) else { return Vec::new() };
        let mut devinode_map = self.devinode_to_reader.lock().unwrap();
        let Some(reader) = devinode_map.get_mut(&dev_inode) else { return Vec::new() };
        if !reader.has_buffered_data() {
            return Vec::new();
        }
        let Some(record) = reader.force_flush(now) else { return Vec::new() };
        vec![ReaderOutput {
            config_name: self.config_name.clone(),
            path,
            records: vec![record],
        }]
    }

    /// Drains fully-read rotator readers (their file has been renamed off
    /// the live path but still had unread bytes at rotation time).
    pub fn reap_exhausted_rotators(&self) {
        let mut rotators = self.rotator_readers.lock().unwrap();
        rotators.retain(|entry| entry.reader.has_buffered_data() || entry.retired_at.elapsed() < Duration::from_secs(3600));
    }

    /// Arms the generation counter for a newly-scheduled FlushTimeout so a
    /// stale one (superseded by a real read) can be detected and discarded.
    pub fn arm_flush_timeout(&self) -> u64 {
        self.bump_generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::log_file_reader::NewlineParser;
    use tempfile::tempdir;

    fn registry(checkpoints: Arc<CheckpointStore>) -> ReaderRegistry {
        ReaderRegistry::new(
            "cfg".into(),
            "topic".into(),
            checkpoints,
            Arc::new(AlarmSink::new(false)),
            Arc::new(NewlineParser),
            Duration::from_millis(500),
        )
    }

    fn store() -> Arc<CheckpointStore> {
        let dir = tempdir().unwrap();
        Arc::new(CheckpointStore::load(dir.path().join("ckpt.json"), Duration::from_secs(3600), 0, Arc::new(AlarmSink::new(false))))
    }

    #[test]
    fn create_then_modify_reads_only_bytes_appended_after_discovery() {
        // A config-less Create (no checkpoint) opens at EOF, not BOF: whatever
        // was already in the file before discovery is never read.
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"pre-existing line\n").unwrap();
        let reg = registry(store());
        reg.handle_event(
            FilesystemEvent::Create {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                config_name: Some("cfg".into()),
            },
            1000,
        );
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        f.write_all(b"line1\nline2\n").unwrap();
        drop(f);

        let outputs = reg.handle_event(
            FilesystemEvent::Modify {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                dev_inode: None,
                config_name: Some("cfg".into()),
            },
            1000,
        );
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].records.len(), 2);
        assert_eq!(outputs[0].records[0].contents[0].1, "line1");
        assert_eq!(outputs[0].records[1].contents[0].1, "line2");
    }

    #[test]
    fn create_on_empty_file_reads_everything_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"").unwrap();
        let reg = registry(store());
        reg.handle_event(
            FilesystemEvent::Create {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                config_name: Some("cfg".into()),
            },
            1000,
        );
        std::fs::write(&path, b"line1\nline2\n").unwrap();
        let outputs = reg.handle_event(
            FilesystemEvent::Modify {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                dev_inode: None,
                config_name: Some("cfg".into()),
            },
            1000,
        );
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].records.len(), 2);
    }

    #[test]
    fn delete_event_removes_reader_and_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"x\n").unwrap();
        let checkpoints = store();
        let reg = registry(checkpoints.clone());
        reg.handle_event(
            FilesystemEvent::Create {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                config_name: Some("cfg".into()),
            },
            1000,
        );
        reg.handle_event(
            FilesystemEvent::Delete {
                source_dir: dir.path().to_path_buf(),
                object_name: "a.log".into(),
                config_name: Some("cfg".into()),
            },
            1000,
        );
        assert!(checkpoints.get_file(&path).is_none());
    }

    #[test]
    fn stale_flush_timeout_generation_is_discarded() {
        let reg = registry(store());
        let outputs = reg.handle_event(
            FilesystemEvent::FlushTimeout {
                source_dir: PathBuf::from("/tmp"),
                object_name: "a.log".into(),
                dev_inode: None,
                config_name: Some("cfg".into()),
                generation: 999,
            },
            1000,
        );
        assert!(outputs.is_empty());
    }
}
