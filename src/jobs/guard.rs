//! Per-resource mutual exclusion for in-flight jobs
//!
//! The held-key set is the only state shared across concurrently running
//! jobs. Acquisition never waits: a busy key is reported to the caller, who
//! rejects the job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    held: Mutex<HashSet<String>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`; false if another job already holds it
    pub fn try_acquire(&self, key: &str) -> bool {
        let acquired = self.held().insert(key.to_string());
        debug!(resource_key = %key, acquired, "Resource lock attempt");
        acquired
    }

    /// Free `key`; returns whether it was held
    pub fn release(&self, key: &str) -> bool {
        let released = self.held().remove(key);
        debug!(resource_key = %key, released, "Resource lock released");
        released
    }

    /// Claim `key` for the lifetime of the returned lease
    pub fn acquire_lease(self: &Arc<Self>, key: &str) -> Option<ResourceLease> {
        self.try_acquire(key).then(|| ResourceLease {
            guard: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    /// Drop every lock, returning how many were held
    pub fn release_all(&self) -> usize {
        let mut held = self.held();
        let count = held.len();
        held.clear();
        count
    }
}

/// Scoped ownership of one resource key; released on drop on every exit path
#[derive(Debug)]
pub struct ResourceLease {
    guard: Arc<ConcurrencyGuard>,
    key: String,
}

impl ResourceLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.guard.release(&self.key);
    }
}
