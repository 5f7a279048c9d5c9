//! Shared cells owned by the controller and injected into readers.

use crate::config::Configuration;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Holds the latest published configuration snapshot.
///
/// `get` returns a deep copy so that readers never observe a snapshot that
/// is concurrently replaced.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    latest: Mutex<Option<Configuration>>,
}

/// Process-level readiness. Flipped once, never back.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    ready: AtomicBool,
}

// === impl SnapshotStore ===

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Configuration> {
        self.latest.lock().clone()
    }

    pub fn set(&self, config: Configuration) {
        *self.latest.lock() = Some(config);
    }
}

// === impl ReadinessGate ===

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}
