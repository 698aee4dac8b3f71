//! Per-region flow control: endpoint health, concurrency limiting, and
//! byte-rate caps (§4.5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DestinationEndpoint {
    pub address: String,
    pub healthy: bool,
    pub last_latency: Duration,
    pub proxy: bool,
}

impl DestinationEndpoint {
    pub fn new(address: impl Into<String>, proxy: bool) -> Self {
        DestinationEndpoint {
            address: address.into(),
            healthy: true,
            last_latency: Duration::ZERO,
            proxy,
        }
    }
}

struct Inner {
    endpoints: Vec<DestinationEndpoint>,
    concurrency_limit: u32,
    in_flight: u32,
    continuous_errors: u32,
    last_recovery: Option<Instant>,
    byte_budget: i64,
    byte_budget_expires: Option<Instant>,
}

/// One region's endpoint set, concurrency counter, and error-driven recovery
/// state. Endpoint picker prefers non-proxy healthy, then proxy, then the
/// first registered endpoint as a last resort.
pub struct RegionState {
    name: String,
    inner: Mutex<Inner>,
    max_concurrency: u32,
    byte_rate_cap: i64,
}

impl RegionState {
    pub fn new(name: impl Into<String>, endpoints: Vec<DestinationEndpoint>, max_concurrency: u32, byte_rate_cap: i64) -> Self {
        RegionState {
            name: name.into(),
            inner: Mutex::new(Inner {
                endpoints,
                concurrency_limit: max_concurrency,
                in_flight: 0,
                continuous_errors: 0,
                last_recovery: None,
                byte_budget: byte_rate_cap,
                byte_budget_expires: None,
            }),
            max_concurrency,
            byte_rate_cap,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if a dispatch slot and byte budget are both available.
    pub fn try_reserve(&self, payload_bytes: i64, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight >= inner.concurrency_limit {
            return false;
        }
        if self.byte_rate_cap >= 0 {
            match inner.byte_budget_expires {
                Some(expiry) if now < expiry => {
                    if inner.byte_budget < payload_bytes {
                        return false;
                    }
                }
                _ => {
                    inner.byte_budget = self.byte_rate_cap;
                    inner.byte_budget_expires = Some(now + Duration::from_secs(1));
                }
            }
            inner.byte_budget -= payload_bytes;
        }
        inner.in_flight += 1;
        true
    }

    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Called on a successful send: replenishes concurrency, resets error
    /// streak, restores the configured limit if it had been throttled down.
    pub fn report_success(&self, endpoint_address: &str, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.continuous_errors = 0;
        if inner.concurrency_limit < self.max_concurrency {
            inner.concurrency_limit += 1;
            inner.last_recovery = None;
        }
        if let Some(ep) = inner.endpoints.iter_mut().find(|e| e.address == endpoint_address) {
            ep.healthy = true;
            ep.last_latency = latency;
        }
    }

    /// Continuous errors shrink the concurrency limit (never below 1);
    /// marks the endpoint unhealthy so the picker skips it.
    pub fn report_failure(&self, endpoint_address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.continuous_errors += 1;
        if inner.continuous_errors >= 3 && inner.concurrency_limit > 1 {
            inner.concurrency_limit -= 1;
            inner.last_recovery = Some(Instant::now());
        }
        if let Some(ep) = inner.endpoints.iter_mut().find(|e| e.address == endpoint_address) {
            ep.healthy = false;
        }
    }

    /// Prefer a non-proxy healthy endpoint, then a proxy healthy endpoint,
    /// then fall back to the first registered endpoint regardless of health.
    pub fn pick_endpoint(&self) -> Option<DestinationEndpoint> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .iter()
            .find(|e| e.healthy && !e.proxy)
            .or_else(|| inner.endpoints.iter().find(|e| e.healthy && e.proxy))
            .or_else(|| inner.endpoints.first())
            .cloned()
    }
}

/// Registry of all configured regions, keyed by region name.
#[derive(Default)]
pub struct RegionRegistry {
    regions: HashMap<String, RegionState>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        RegionRegistry { regions: HashMap::new() }
    }

    pub fn register(&mut self, region: RegionState) {
        self.regions.insert(region.name().to_string(), region);
    }

    pub fn get(&self, name: &str) -> Option<&RegionState> {
        self.regions.get(name)
    }
}
