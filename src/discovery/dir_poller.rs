//! Directory/file scanning poller (§4.1 "Dir-file poller").
//!
//! Walks configured roots on a fixed interval, maintaining round-numbered
//! caches for both directories and files, emitting Create events for newly
//! seen entries and Timeout events on cache eviction.

use crate::alarm::{Alarm, AlarmSink, Severity, Stage};
use crate::discovery::blacklist::Blacklist;
use crate::event::{EventQueue, FilesystemEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
struct CacheEntry {
    last_seen_round: u64,
    last_modify_time: i64,
    event_emitted: bool,
    last_event_time: i64,
    first_seen_time: i64,
}

#[derive(Debug, Clone)]
pub struct DirPollerConfig {
    pub config_name: String,
    pub roots: Vec<PathBuf>,
    pub max_depth: i32,
    pub first_watch_timeout: Duration,
    pub repush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Ceilings {
    pub global_stat_ceiling: u64,
    pub per_directory_stat_ceiling: u64,
    pub per_config_stat_ceiling: u64,
}

impl Default for Ceilings {
    fn default() -> Self {
        Ceilings {
            global_stat_ceiling: 200_000,
            per_directory_stat_ceiling: 50_000,
            per_config_stat_ceiling: 100_000,
        }
    }
}

pub struct DirPoller {
    configs: Vec<DirPollerConfig>,
    ceilings: Ceilings,
    eviction_every_n_rounds: u64,
    eviction_round_threshold: u64,
    blacklist: Arc<Blacklist>,
    round: Mutex<u64>,
    dir_cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    file_cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn mtime_secs(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified().ok()?.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
}

impl DirPoller {
    pub fn new(configs: Vec<DirPollerConfig>, blacklist: Arc<Blacklist>) -> Self {
        DirPoller {
            configs,
            ceilings: Ceilings::default(),
            eviction_every_n_rounds: 20,
            eviction_round_threshold: 100,
            blacklist,
            round: Mutex::new(0),
            dir_cache: Mutex::new(HashMap::new()),
            file_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run one scan round across all configured roots, pushing Create events
    /// for newly seen entries into `events` and returning the set of regular
    /// file paths discovered this round (for the caller to register with the
    /// modify poller).
    pub fn run_round(&self, events: &EventQueue, alarms: &AlarmSink) -> Vec<(PathBuf, String)> {
        let round = {
            let mut guard = self.round.lock().unwrap();
            *guard += 1;
            *guard
        };
        let now = now_secs();
        let mut discovered_files = Vec::new();
        let mut per_config_stats: u64 = 0;
        let mut global_stats: u64 = 0;

        for config in &self.configs {
            per_config_stats = 0;
            for root in &config.roots {
                let mut per_dir_stats: u64 = 0;
                let max_depth = if config.max_depth < 0 { usize::MAX } else { config.max_depth as usize };
                let walker = WalkDir::new(root).max_depth(max_depth.min(64)).into_iter();
                for entry in walker.filter_map(|e| e.ok()) {
                    global_stats += 1;
                    per_config_stats += 1;
                    per_dir_stats += 1;

                    if global_stats > self.ceilings.global_stat_ceiling {
                        alarms.raise(Alarm::new(Stage::Discovery, Severity::Warn, "DISC-CEILING", "global stat ceiling exceeded, aborting round").with_config(config.config_name.clone()));
                        return discovered_files;
                    }
                    if per_config_stats > self.ceilings.per_config_stat_ceiling {
                        alarms.raise(Alarm::new(Stage::Discovery, Severity::Warn, "DISC-CEILING", "per-config stat ceiling exceeded, skipping remainder of this root").with_config(config.config_name.clone()));
                        break;
                    }
                    if per_dir_stats > self.ceilings.per_directory_stat_ceiling {
                        alarms.raise(Alarm::new(Stage::Discovery, Severity::Warn, "DISC-CEILING", "per-directory stat ceiling exceeded").with_config(config.config_name.clone()));
                        break;
                    }

                    let path = entry.path();
                    let filename = entry.file_name().to_string_lossy().to_string();
                    let mtime = entry.metadata().ok().and_then(|m| mtime_secs(&m)).unwrap_or(now);
                    let age_secs = (now - mtime).max(0);
                    if entry.file_type().is_dir() {
                        if self.blacklist.is_dir_blacklisted(path) {
                            continue;
                        }
                        self.handle_directory(path, round, now, age_secs, config, events);
                    } else if entry.file_type().is_file() {
                        if !self.blacklist.is_path_collectible(path, &filename) {
                            continue;
                        }
                        if self.handle_file(path, round, now, age_secs, config, events) {
                            discovered_files.push((path.to_path_buf(), config.config_name.clone()));
                        }
                    }
                    // FIFOs, sockets, symlinks to non-file/dir targets are
                    // silently skipped per the external-interfaces contract.
                }
            }
        }

        if round % self.eviction_every_n_rounds == 0 {
            self.evict_stale(round, events);
        }

        discovered_files
    }

    fn handle_directory(&self, path: &Path, round: u64, now: i64, age_secs: i64, config: &DirPollerConfig, events: &EventQueue) {
        let mut cache = self.dir_cache.lock().unwrap();
        match cache.get_mut(path) {
            Some(entry) => {
                entry.last_seen_round = round;
                entry.last_modify_time = now;
            }
            None => {
                let age = Duration::from_secs(age_secs.max(0) as u64);
                let pre_existing = round > 1 && age > config.first_watch_timeout;
                let entry = CacheEntry {
                    last_seen_round: round,
                    last_modify_time: now,
                    event_emitted: !pre_existing,
                    last_event_time: now,
                    first_seen_time: now,
                };
                if !pre_existing {
                    events.push(FilesystemEvent::Create {
                        source_dir: path.to_path_buf(),
                        object_name: String::new(),
                        config_name: Some(config.config_name.clone()),
                    });
                }
                cache.insert(path.to_path_buf(), entry);
            }
        }
    }

    /// Returns true if this round newly registers the file for modify
    /// polling (first sight, or a qualifying re-push).
    fn handle_file(&self, path: &Path, round: u64, now: i64, age_secs: i64, config: &DirPollerConfig, events: &EventQueue) -> bool {
        let mut cache = self.file_cache.lock().unwrap();
        let first_watch_timeout_secs = config.first_watch_timeout.as_secs() as i64;
        let repush_interval_secs = config.repush_interval.as_secs() as i64;

        match cache.get_mut(path) {
            Some(entry) => {
                entry.last_seen_round = round;
                let age = now - entry.first_seen_time;
                let since_last_event = now - entry.last_event_time;
                if entry.event_emitted && age < first_watch_timeout_secs && since_last_event >= repush_interval_secs {
                    entry.last_event_time = now;
                    let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
                    let object_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                    events.push(FilesystemEvent::Create {
                        source_dir: dir,
                        object_name,
                        config_name: Some(config.config_name.clone()),
                    });
                    return true;
                }
                false
            }
            None => {
                if age_secs > first_watch_timeout_secs {
                    cache.insert(
                        path.to_path_buf(),
                        CacheEntry {
                            last_seen_round: round,
                            last_modify_time: now,
                            event_emitted: false,
                            last_event_time: now,
                            first_seen_time: now,
                        },
                    );
                    false
                } else {
                    cache.insert(
                        path.to_path_buf(),
                        CacheEntry {
                            last_seen_round: round,
                            last_modify_time: now,
                            event_emitted: true,
                            last_event_time: now,
                            first_seen_time: now,
                        },
                    );
                    true
                }
            }
        }
    }

    fn evict_stale(&self, round: u64, events: &EventQueue) {
        let threshold = self.eviction_round_threshold;
        let mut dirs = self.dir_cache.lock().unwrap();
        let stale: Vec<PathBuf> = dirs
            .iter()
            .filter(|(_, entry)| round.saturating_sub(entry.last_seen_round) > threshold)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            dirs.remove(&path);
            events.push(FilesystemEvent::Timeout {
                source_dir: path,
                config_name: None,
            });
        }
        drop(dirs);

        let mut files = self.file_cache.lock().unwrap();
        files.retain(|_, entry| round.saturating_sub(entry.last_seen_round) <= threshold);
    }
}
