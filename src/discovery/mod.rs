//! File-discovery engine: two cooperating pollers under one registry,
//! spawned as dedicated threads (§4.1, §5).

pub mod blacklist;
pub mod dir_poller;
pub mod modify_poller;

use crate::alarm::AlarmSink;
use crate::event::EventQueue;
use dir_poller::DirPoller;
use modify_poller::ModifyPoller;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Discovery {
    dir_poller: Arc<DirPoller>,
    modify_poller: Arc<ModifyPoller>,
    events: Arc<EventQueue>,
    alarms: Arc<AlarmSink>,
}

impl Discovery {
    pub fn new(dir_poller: Arc<DirPoller>, modify_poller: Arc<ModifyPoller>, events: Arc<EventQueue>, alarms: Arc<AlarmSink>) -> Self {
        Discovery {
            dir_poller,
            modify_poller,
            events,
            alarms,
        }
    }

    /// Spawn the dir-file poller thread. `run_flag` cleared causes the
    /// current round to finish and the thread to exit (§5 cancellation);
    /// `hold_flag` set pauses polling without exiting, for config reload.
    pub fn spawn_dir_poller(&self, interval: Duration, run_flag: Arc<AtomicBool>, hold_flag: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let dir_poller = self.dir_poller.clone();
        let modify_poller = self.modify_poller.clone();
        let events = self.events.clone();
        let alarms = self.alarms.clone();
        std::thread::spawn(move || {
            while run_flag.load(Ordering::SeqCst) {
                if hold_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    continue;
                }
                let discovered = dir_poller.run_round(&events, &alarms);
                for (path, config_name) in discovered {
                    modify_poller.register(path, Some(config_name));
                }
                std::thread::sleep(interval);
            }
        })
    }

    /// Spawn the modify poller thread.
    pub fn spawn_modify_poller(&self, interval: Duration, run_flag: Arc<AtomicBool>, hold_flag: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let modify_poller = self.modify_poller.clone();
        let events = self.events.clone();
        std::thread::spawn(move || {
            while run_flag.load(Ordering::SeqCst) {
                if hold_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    continue;
                }
                modify_poller.tick(&events);
                std::thread::sleep(interval);
            }
        })
    }
}

/// Default poll intervals per §4.1: 5s on POSIX, 1s on Windows for the
/// dir-file poller (finer because Windows lacks inotify-style hints
/// entirely in this design); the modify poller always ticks at 1s.
pub fn default_dir_poll_interval() -> Duration {
    if cfg!(windows) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(5)
    }
}

pub fn default_modify_poll_interval() -> Duration {
    Duration::from_secs(1)
}
