//! Shared health state for the /health endpoint.
//! Updated by CdpManager, PageRelay, and Broker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared health metrics. Updated by pipeline components, read by API.
#[derive(Default)]
pub struct HealthState {
    /// True while a DevTools session to the trading page is open.
    pub cdp_connected: AtomicBool,
    /// Tabs currently in the broker registry.
    pub registered_tabs: AtomicU64,
    /// True once the broker holds a credential. The value itself is never exposed.
    pub has_credential: AtomicBool,
    /// Millisecond timestamp of the last forwarded operation (0 = none).
    pub last_operation_at_ms: AtomicU64,
    /// Operations forwarded to the broker.
    pub forwarded: AtomicU64,
    /// Records discarded as already seen within the window.
    pub suppressed: AtomicU64,
    /// Records discarded because no canonical operation could be built.
    pub rejected: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cdp_connected(&self, v: bool) {
        self.cdp_connected.store(v, Ordering::Relaxed);
    }

    pub fn set_registered_tabs(&self, n: usize) {
        self.registered_tabs.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_has_credential(&self, v: bool) {
        self.has_credential.store(v, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, at_ms: u64) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.last_operation_at_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn inc_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cdp_connected(&self) -> bool {
        self.cdp_connected.load(Ordering::Relaxed)
    }

    pub fn registered_tabs(&self) -> u64 {
        self.registered_tabs.load(Ordering::Relaxed)
    }

    pub fn has_credential(&self) -> bool {
        self.has_credential.load(Ordering::Relaxed)
    }

    pub fn last_operation_at_ms(&self) -> u64 {
        self.last_operation_at_ms.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
