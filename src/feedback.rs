//! Downstream→upstream readiness signals driving backpressure.
//!
//! The sender queues own the actual `is_valid_to_push` hysteresis (see
//! `sender::queue`); this module is the narrow-waist `FeedbackBus` the
//! aggregator consults before flushing, and the condition variable the
//! sender main thread blocks on between push/feedback/timeout.

use crate::model::FeedbackKey;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Per-key readiness state plus a single shared condvar so the sender main
/// thread can block until *something* changed rather than busy-polling.
pub struct FeedbackBus {
    state: Mutex<HashMap<FeedbackKey, bool>>,
    changed: Condvar,
}

impl FeedbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(FeedbackBus {
            state: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        })
    }

    /// True until a key is explicitly registered as invalid (fail-open: an
    /// aggregator item for a destination the sender has never heard of is
    /// allowed to flush once, establishing the key).
    pub fn is_valid_to_push(&self, key: FeedbackKey) -> bool {
        *self.state.lock().unwrap().get(&key).unwrap_or(&true)
    }

    /// Called by a `SenderQueue` on each valid↔invalid transition.
    pub fn set_valid(&self, key: FeedbackKey, valid: bool) {
        let mut guard = self.state.lock().unwrap();
        let prev = guard.insert(key, valid);
        if prev != Some(valid) {
            drop(guard);
            self.changed.notify_all();
        }
    }

    /// Block the sender main thread until a feedback transition happens or
    /// `timeout` elapses, whichever first — mirrors the "suspension point"
    /// called out in the concurrency model.
    pub fn wait_for_change(&self, timeout: Duration) {
        let guard = self.state.lock().unwrap();
        let _ = self.changed.wait_timeout(guard, timeout).unwrap();
    }
}

impl Default for FeedbackBus {
    fn default() -> Self {
        FeedbackBus {
            state: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_defaults_valid() {
        let bus = FeedbackBus::new();
        assert!(bus.is_valid_to_push(FeedbackKey(1)));
    }

    #[test]
    fn transition_is_observed() {
        let bus = FeedbackBus::new();
        bus.set_valid(FeedbackKey(1), false);
        assert!(!bus.is_valid_to_push(FeedbackKey(1)));
        bus.set_valid(FeedbackKey(1), true);
        assert!(bus.is_valid_to_push(FeedbackKey(1)));
    }
}
