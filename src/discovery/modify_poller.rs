//! Per-file stat poller (§4.1 "Modify poller"): tracks dev-inode/size/mtime
//! for every file handed to it by the dir-file poller and emits Modify /
//! Delete events on change.

use crate::event::{EventQueue, FilesystemEvent};
use crate::model::DevInode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct ModifyCheckCache {
    dev_inode: DevInode,
    size: u64,
    modify_time: i64,
}

pub struct ModifyPollerConfig {
    pub ignore_file_modify_timeout: Duration,
    pub cache_size_limit: usize,
    pub make_space_interval: Duration,
}

impl Default for ModifyPollerConfig {
    fn default() -> Self {
        ModifyPollerConfig {
            ignore_file_modify_timeout: Duration::from_secs(180),
            cache_size_limit: 100_000,
            make_space_interval: Duration::from_secs(600),
        }
    }
}

pub struct ModifyPoller {
    config: ModifyPollerConfig,
    tracked: Mutex<HashMap<PathBuf, (ModifyCheckCache, Option<String>)>>,
    last_eviction: Mutex<Option<SystemTime>>,
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

impl ModifyPoller {
    pub fn new(config: ModifyPollerConfig) -> Self {
        ModifyPoller {
            config,
            tracked: Mutex::new(HashMap::new()),
            last_eviction: Mutex::new(None),
        }
    }

    /// Register a path discovered by the dir-file poller; no-op if already
    /// tracked (the dev-inode sentinel marks it for first-observation
    /// handling on the next tick).
    pub fn register(&self, path: PathBuf, config_name: Option<String>) {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.entry(path).or_insert((
            ModifyCheckCache {
                dev_inode: DevInode::NONE,
                size: 0,
                modify_time: 0,
            },
            config_name,
        ));
    }

    pub fn unregister(&self, path: &PathBuf) {
        self.tracked.lock().unwrap().remove(path);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    /// One stat sweep over every tracked file, pushing Modify/Delete events.
    pub fn tick(&self, events: &EventQueue) {
        self.maybe_evict();
        let mut tracked = self.tracked.lock().unwrap();
        let mut to_remove = Vec::new();
        let now = now_secs();

        for (path, (cache, config_name)) in tracked.iter_mut() {
            let meta = match std::fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    events.push(FilesystemEvent::Delete {
                        source_dir: path.parent().unwrap_or(std::path::Path::new("/")).to_path_buf(),
                        object_name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                        config_name: config_name.clone(),
                    });
                    to_remove.push(path.clone());
                    continue;
                }
                Err(_) => continue,
            };
            let dev_inode = DevInode::from_metadata(&meta);
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(now);
            let size = meta.len();

            if cache.dev_inode.is_none() {
                if now - mtime > self.config.ignore_file_modify_timeout.as_secs() as i64 {
                    *cache = ModifyCheckCache { dev_inode, size, modify_time: mtime };
                    continue;
                }
                *cache = ModifyCheckCache { dev_inode, size, modify_time: mtime };
                emit_modify(events, path, dev_inode, config_name.clone());
                continue;
            }

            if cache.dev_inode != dev_inode {
                let stale = now - mtime > self.config.ignore_file_modify_timeout.as_secs() as i64;
                *cache = ModifyCheckCache { dev_inode, size, modify_time: mtime };
                if !stale {
                    emit_modify(events, path, dev_inode, config_name.clone());
                }
                continue;
            }

            if cache.size != size || cache.modify_time != mtime {
                cache.size = size;
                cache.modify_time = mtime;
                emit_modify(events, path, dev_inode, config_name.clone());
            }
        }

        for path in to_remove {
            tracked.remove(&path);
        }
    }

    fn maybe_evict(&self) {
        let mut tracked = self.tracked.lock().unwrap();
        if tracked.len() < self.config.cache_size_limit {
            return;
        }
        let mut last = self.last_eviction.lock().unwrap();
        let now = SystemTime::now();
        if let Some(prev) = *last {
            if now.duration_since(prev).unwrap_or(Duration::ZERO) < self.config.make_space_interval {
                return;
            }
        }
        *last = Some(now);

        let mut by_mtime: Vec<(PathBuf, i64)> = tracked.iter().map(|(p, (c, _))| (p.clone(), c.modify_time)).collect();
        by_mtime.sort_unstable_by_key(|(_, mtime)| *mtime);
        let evict_count = by_mtime.len() / 5;
        for (path, _) in by_mtime.into_iter().take(evict_count) {
            tracked.remove(&path);
        }
    }
}

fn emit_modify(events: &EventQueue, path: &PathBuf, dev_inode: DevInode, config_name: Option<String>) {
    events.push(FilesystemEvent::Modify {
        source_dir: path.parent().unwrap_or(std::path::Path::new("/")).to_path_buf(),
        object_name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        dev_inode: Some(dev_inode),
        config_name,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmSink;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn queue() -> EventQueue {
        EventQueue::new(1024, Arc::new(AlarmSink::new(false)))
    }

    #[test]
    fn first_observation_of_fresh_file_emits_modify() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"hello").unwrap();
        let poller = ModifyPoller::new(ModifyPollerConfig::default());
        poller.register(path.clone(), Some("cfg".to_string()));
        let events = queue();
        poller.tick(&events);
        let drained = events.try_drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], FilesystemEvent::Modify { .. }));
    }

    #[test]
    fn size_change_emits_modify_on_next_tick() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"hello").unwrap();
        let poller = ModifyPoller::new(ModifyPollerConfig::default());
        poller.register(path.clone(), None);
        let events = queue();
        poller.tick(&events);
        events.try_drain();

        std::fs::write(&path, b"hello world, more bytes").unwrap();
        poller.tick(&events);
        let drained = events.try_drain();
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn deleted_file_emits_delete_and_untracks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"hello").unwrap();
        let poller = ModifyPoller::new(ModifyPollerConfig::default());
        poller.register(path.clone(), None);
        let events = queue();
        poller.tick(&events);
        events.try_drain();

        std::fs::remove_file(&path).unwrap();
        poller.tick(&events);
        let drained = events.try_drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], FilesystemEvent::Delete { .. }));
        assert_eq!(poller.tracked_count(), 0);
    }
}
