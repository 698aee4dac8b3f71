//! Structured, fire-and-forget alarms — this crate's logging layer.
//!
//! `language-level logging` is out of scope per the pipeline spec, so rather
//! than reaching for `tracing`/`log` (as elsewhere in the retrieval pack) we
//! follow the teacher's own idiom: a small, deterministically-sortable,
//! serializable diagnostic type, printed to stderr and retained in an
//! in-memory ring a test can inspect. Every stage that would otherwise "just
//! log" raises an `Alarm` through here instead.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// Which stage of the pipeline raised the alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Discovery,
    EventQueue,
    Reader,
    Aggregator,
    SenderQueue,
    Shipper,
    Checkpoint,
    Feedback,
    Bootstrap,
}

impl Stage {
    fn sort_key(&self) -> u8 {
        match self {
            Stage::Bootstrap => 0,
            Stage::Discovery => 1,
            Stage::EventQueue => 2,
            Stage::Reader => 3,
            Stage::Aggregator => 4,
            Stage::SenderQueue => 5,
            Stage::Shipper => 6,
            Stage::Checkpoint => 7,
            Stage::Feedback => 8,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Discovery => "discovery",
            Stage::EventQueue => "event_queue",
            Stage::Reader => "reader",
            Stage::Aggregator => "aggregator",
            Stage::SenderQueue => "sender_queue",
            Stage::Shipper => "shipper",
            Stage::Checkpoint => "checkpoint",
            Stage::Feedback => "feedback",
            Stage::Bootstrap => "bootstrap",
        };
        write!(f, "{s}")
    }
}

/// Severity of an alarm. `Alarm`s never block the data path regardless of
/// severity; this only affects stderr formatting and retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured alarm record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub stage: Stage,
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub config_name: Option<String>,
}

impl Alarm {
    pub fn new(stage: Stage, severity: Severity, code: &'static str, message: impl Into<String>) -> Self {
        Alarm {
            stage,
            severity,
            code,
            message: message.into(),
            config_name: None,
        }
    }

    pub fn with_config(mut self, config_name: impl Into<String>) -> Self {
        self.config_name = Some(config_name.into());
        self
    }

    /// Stable sort key: stage first, then severity (worst first), then code.
    pub fn sort_key(&self) -> (u8, u8, &str) {
        let severity_rank = match self.severity {
            Severity::Error => 0,
            Severity::Warn => 1,
            Severity::Info => 2,
            Severity::Debug => 3,
        };
        (self.stage.sort_key(), severity_rank, self.code)
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config_name {
            Some(cfg) => write!(f, "[{:?}][{}][{}] {}: {}", self.severity, self.stage, cfg, self.code, self.message),
            None => write!(f, "[{:?}][{}] {}: {}", self.severity, self.stage, self.code, self.message),
        }
    }
}

const RING_CAPACITY: usize = 1024;

/// Process-wide alarm sink. Cheap to clone (wraps an `Arc` internally via
/// `Mutex` + the owning struct being behind an `Arc` at the call sites).
pub struct AlarmSink {
    ring: Mutex<VecDeque<Alarm>>,
    print_to_stderr: bool,
}

impl AlarmSink {
    pub fn new(print_to_stderr: bool) -> Self {
        AlarmSink {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            print_to_stderr,
        }
    }

    pub fn raise(&self, alarm: Alarm) {
        if self.print_to_stderr {
            eprintln!("{alarm}");
        }
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(alarm);
    }

    /// Snapshot of retained alarms, oldest first.
    pub fn snapshot(&self) -> Vec<Alarm> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
    }
}

impl Default for AlarmSink {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_display_includes_stage_and_code() {
        let a = Alarm::new(Stage::Discovery, Severity::Warn, "DISC-CEILING", "round aborted");
        let s = a.to_string();
        assert!(s.contains("discovery"));
        assert!(s.contains("DISC-CEILING"));
    }

    #[test]
    fn sink_retains_bounded_history() {
        let sink = AlarmSink::new(false);
        for i in 0..(RING_CAPACITY + 10) {
            sink.raise(Alarm::new(Stage::EventQueue, Severity::Info, "EQ-DROP", format!("drop {i}")));
        }
        assert_eq!(sink.snapshot().len(), RING_CAPACITY);
    }
}
