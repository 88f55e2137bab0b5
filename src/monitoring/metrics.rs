/*
* Scheduler metrics
* -----------------
* @project: cloud-scheduler
*
* Counters for everything the ledger cares about: creates, destroys, kill
* retries, forced local cleanups and failed polls. One `SchedulerMetrics` is
* shared (Arc) by every cluster in a pool, so the numbers are pool-wide.
*
* Plain atomics, no locks. Where the numbers end up (logs, a JSON dump from
* the CLI, an exporter someday) is somebody else's problem.
*/

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::core::vm::VM;

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    vms_created: AtomicU64,
    create_failures: AtomicU64,
    vms_destroyed: AtomicU64,
    destroy_retries: AtomicU64,
    forced_cleanups: AtomicU64,
    deferred_kills: AtomicU64,
    poll_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub vms_created: u64,
    pub create_failures: u64,
    pub vms_destroyed: u64,
    pub destroy_retries: u64,
    pub forced_cleanups: u64,
    pub deferred_kills: u64,
    pub poll_errors: u64,
}

/// Serializable view of one cluster: identity, ledger and hosted VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub name: String,
    pub network_address: String,
    pub cloud_type: String,
    pub vm_slots: u32,
    pub cpu_cores: u32,
    pub storage_gb: u64,
    pub memory_blocks: Vec<u64>,
    pub cpu_archs: Vec<String>,
    pub network_pools: Vec<String>,
    pub vms: Vec<VM>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self) {
        self.vms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_create_failure(&self) {
        self.create_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroy(&self) {
        self.vms_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroy_retries(&self, retries: u32) {
        self.destroy_retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub fn record_forced_cleanup(&self) {
        self.forced_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred_kill(&self) {
        self.deferred_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            vms_created: self.vms_created.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            vms_destroyed: self.vms_destroyed.load(Ordering::Relaxed),
            destroy_retries: self.destroy_retries.load(Ordering::Relaxed),
            forced_cleanups: self.forced_cleanups.load(Ordering::Relaxed),
            deferred_kills: self.deferred_kills.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            created = s.vms_created,
            create_failures = s.create_failures,
            destroyed = s.vms_destroyed,
            destroy_retries = s.destroy_retries,
            forced_cleanups = s.forced_cleanups,
            deferred_kills = s.deferred_kills,
            poll_errors = s.poll_errors,
            "Scheduler metrics"
        );
    }
}
