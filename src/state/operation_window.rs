use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::Operation;

#[derive(Debug, Clone)]
struct WindowEntry {
    operation: Operation,
    forwarded_at: Instant,
}

// ---------------------------------------------------------------------------
// OperationWindow
// ---------------------------------------------------------------------------

/// Short-lived record of forwarded operations keyed by fingerprint.
///
/// Written only by the relay task; the HTTP API reads it concurrently. Nothing
/// survives longer than `ttl`.
pub struct OperationWindow {
    ttl: Duration,
    /// fingerprint → most recent forwarded operation
    entries: DashMap<String, WindowEntry>,
}

impl OperationWindow {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            entries: DashMap::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True if `fingerprint` was forwarded less than `ttl` before `now`.
    pub fn contains_active(&self, fingerprint: &str, now: Instant) -> bool {
        self.entries
            .get(fingerprint)
            .is_some_and(|e| now.saturating_duration_since(e.forwarded_at) < self.ttl)
    }

    pub fn insert(&self, operation: Operation, now: Instant) {
        self.entries.insert(
            operation.fingerprint.clone(),
            WindowEntry {
                operation,
                forwarded_at: now,
            },
        );
    }

    /// Drops entries older than `ttl`. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.forwarded_at) < self.ttl);
        before - self.entries.len()
    }

    /// Active operations, newest first.
    pub fn recent(&self, now: Instant) -> Vec<Operation> {
        let mut active: Vec<WindowEntry> = self
            .entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.forwarded_at) < self.ttl)
            .map(|e| e.value().clone())
            .collect();
        active.sort_by(|a, b| b.forwarded_at.cmp(&a.forwarded_at));
        active.into_iter().map(|e| e.operation).collect()
    }

    pub fn remove(&self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
