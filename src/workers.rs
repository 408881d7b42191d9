//! Worker tracking.
//!
//! Thread-safe registry of in-flight runs. Workers are OS threads rather than
//! processes, so the registry exists for observability and for verifying the
//! exactly-once cleanup contract, not for reaping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Information about a tracked worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Run this worker was spawned for
    pub run_id: String,
    /// Timestamp when the worker was started
    pub started_at: DateTime<Utc>,
}

/// Map of run id -> WorkerInfo for active workers
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    active: RwLock<HashMap<String, WorkerInfo>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its run id. Spawning two workers for the same
    /// run would be a host bug, so a collision is logged loudly.
    pub fn register(&self, run_id: &str) {
        let info = WorkerInfo {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
        };
        let previous = self.active.write().insert(run_id.to_string(), info);
        if previous.is_some() {
            warn!(%run_id, "Worker registered twice for the same run");
        } else {
            debug!(%run_id, "Worker registered");
        }
    }

    /// Remove a worker. Safe to call more than once: the second call is a
    /// no-op, which is what makes host cleanup idempotent.
    pub fn unregister(&self, run_id: &str) -> bool {
        let removed = self.active.write().remove(run_id).is_some();
        if removed {
            debug!(%run_id, "Worker unregistered");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.read().contains_key(run_id)
    }

    /// Snapshot of active workers, oldest first.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.active.read().values().cloned().collect();
        workers.sort_by_key(|w| w.started_at);
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = WorkerRegistry::new();
        registry.register("run-1");
        assert_eq!(registry.active_count(), 1);
        assert!(registry.is_active("run-1"));

        assert!(registry.unregister("run-1"));
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_active("run-1"));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = WorkerRegistry::new();
        registry.register("run-1");
        assert!(registry.unregister("run-1"));
        assert!(!registry.unregister("run-1"));
        assert!(!registry.unregister("never-registered"));
    }

    #[test]
    fn test_snapshot_oldest_first() {
        let registry = WorkerRegistry::new();
        registry.register("first");
        registry.register("second");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].started_at <= snapshot[1].started_at);
    }
}
