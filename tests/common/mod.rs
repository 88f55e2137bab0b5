#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cloud_scheduler::errors::RetryPolicy;
use cloud_scheduler::monitoring::SchedulerMetrics;
use cloud_scheduler::backends::SimulatedBackend;
use cloud_scheduler::{Cluster, ClusterSpec, LifecyclePolicy, VMRequest};

pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn spec(name: &str, vm_slots: u32, memory: &[u64], archs: &[&str], networks: &[&str]) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        network_address: format!("{}.cloud.test", name),
        cloud_type: "Simulated".to_string(),
        vm_slots,
        cpu_cores: 16,
        storage_gb: 100,
        memory_blocks: memory.to_vec(),
        cpu_archs: set(archs),
        network_pools: set(networks),
    }
}

/// Same shape as production defaults (3 kill attempts, 90s grace) but with
/// millisecond retry delays. Pair with paused tokio time for the grace period.
pub fn test_policy() -> LifecyclePolicy {
    LifecyclePolicy {
        destroy_retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_secs(5)),
        backend_timeout: Duration::from_secs(5),
        kill_grace: Duration::from_secs(90),
    }
}

pub fn cluster_on(spec: ClusterSpec, backend: &Arc<SimulatedBackend>) -> Arc<Cluster> {
    cluster_with_metrics(spec, backend, Arc::new(SchedulerMetrics::new()))
}

pub fn cluster_with_metrics(
    spec: ClusterSpec,
    backend: &Arc<SimulatedBackend>,
    metrics: Arc<SchedulerMetrics>,
) -> Arc<Cluster> {
    let backend = Arc::clone(backend);
    Arc::new(Cluster::new(spec, backend, test_policy(), metrics))
}

pub fn simulated_cluster(spec: ClusterSpec) -> (Arc<Cluster>, Arc<SimulatedBackend>) {
    let backend = Arc::new(SimulatedBackend::new());
    (cluster_on(spec, &backend), backend)
}

pub fn request(network: &str, arch: &str, memory_mb: u64) -> VMRequest {
    VMRequest::new("test-vm", network, arch, "http://images.test/worker.img", memory_mb)
}
