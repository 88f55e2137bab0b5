// End to end through the Scheduler front end, plus an API-style backend.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloud_scheduler::backends::{ApiBackend, InstanceRunner, RunnerFactory, SimulatedBackend};
use cloud_scheduler::monitoring::SchedulerMetrics;
use cloud_scheduler::{BackendError, CloudError, Cluster, ResourcePool, Scheduler, VMStatus};

mod common;
use common::{cluster_with_metrics, request, spec, test_policy};

fn two_cluster_scheduler(backend: &Arc<SimulatedBackend>) -> Scheduler {
    let metrics = Arc::new(SchedulerMetrics::new());
    let mut pool = ResourcePool::new("default");
    pool.add(cluster_with_metrics(spec("alpha", 2, &[2048], &["x86"], &["public"]), backend, metrics.clone()));
    pool.add(cluster_with_metrics(spec("beta", 2, &[4096], &["x86", "x86_64"], &["public"]), backend, metrics.clone()));
    Scheduler::new(pool, metrics)
}

#[tokio::test]
async fn test_request_without_fit_is_no_resource() {
    let backend = Arc::new(SimulatedBackend::new());
    let scheduler = two_cluster_scheduler(&backend);

    let err = scheduler.request_vm(&request("private", "x86", 256)).await.err().unwrap();
    assert!(matches!(err, CloudError::NoResource { .. }));
    assert_eq!(backend.creates(), 0);
}

#[tokio::test]
async fn test_request_poll_release() -> Result<()> {
    let backend = Arc::new(SimulatedBackend::new());
    let scheduler = two_cluster_scheduler(&backend);

    let mut placements = Vec::new();
    for _ in 0..3 {
        placements.push(scheduler.request_vm(&request("public", "x86", 512)).await?);
    }
    let hosts: Vec<&str> = placements.iter().map(|p| p.cluster.name()).collect();
    assert_eq!(hosts, vec!["alpha", "alpha", "beta"]);

    let located = scheduler.locate(&placements[2].vm.backend_id).await.unwrap();
    assert_eq!(located.name(), "beta");

    let polled = scheduler.poll_all().await;
    assert_eq!(polled.len(), 3);
    assert!(polled.iter().all(|(_, o)| o.status == VMStatus::Running));

    assert_eq!(scheduler.release_all("test over").await, 3);
    for cluster in scheduler.pool().clusters() {
        assert_eq!(cluster.vm_count().await, 0);
        assert_eq!(cluster.vm_slots().await, 2);
    }

    let metrics = scheduler.metrics().snapshot();
    assert_eq!(metrics.vms_created, 3);
    assert_eq!(metrics.vms_destroyed, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_release_swallows_destroy_failure() -> Result<()> {
    let backend = Arc::new(SimulatedBackend::new());
    let scheduler = two_cluster_scheduler(&backend);
    let placement = scheduler.request_vm(&request("public", "x86_64", 1024)).await?;
    assert_eq!(placement.cluster.name(), "beta");

    backend.fail_next_shutdowns(1);
    backend.fail_next_kills(10);
    scheduler.release_vm(&placement, "stuck").await;

    assert!(scheduler.locate(&placement.vm.backend_id).await.is_none());
    assert_eq!(scheduler.metrics().snapshot().forced_cleanups, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_background_poller_tracks_boot() -> Result<()> {
    let backend = Arc::new(SimulatedBackend::new().with_boot_polls(2));
    let scheduler = Arc::new(two_cluster_scheduler(&backend));
    let placement = scheduler.request_vm(&request("public", "x86", 256)).await?;

    let poller = Arc::clone(&scheduler).spawn_poller(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(31)).await;
    poller.abort();

    let record = placement.cluster.vm(&placement.vm.backend_id).await.unwrap();
    assert_eq!(record.status, VMStatus::Running);
    assert!(backend.polls() >= 2);
    Ok(())
}

struct CountingRunner {
    next_id: AtomicU64,
    kills: Arc<AtomicU32>,
}

#[async_trait]
impl InstanceRunner for CountingRunner {
    async fn run_instance(&self) -> Result<Vec<u64>, BackendError> {
        Ok(vec![self.next_id.fetch_add(1, Ordering::SeqCst)])
    }

    async fn shutdown_instances(&self, _ids: &[u64]) -> Result<(), BackendError> {
        Ok(())
    }

    async fn kill_instances(&self, _ids: &[u64]) -> Result<(), BackendError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn vm_state(&self, _id: u64) -> Result<String, BackendError> {
        Ok("Running".into())
    }
}

struct CountingFactory {
    kills: Arc<AtomicU32>,
}

impl RunnerFactory for CountingFactory {
    fn runner(&self, _image_location: &str) -> Arc<dyn InstanceRunner> {
        Arc::new(CountingRunner {
            next_id: AtomicU64::new(100),
            kills: Arc::clone(&self.kills),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_api_backend_shutdown_is_followed_by_kill() -> Result<()> {
    let kills = Arc::new(AtomicU32::new(0));
    let backend = Arc::new(ApiBackend::new(
        "StratusLab",
        Arc::new(CountingFactory { kills: Arc::clone(&kills) }),
    ));
    let mut cluster_spec = spec("stratus", 2, &[2048], &["x86_64"], &["public"]);
    cluster_spec.cloud_type = "StratusLab".to_string();
    let policy = test_policy();
    let cluster = Cluster::new(cluster_spec, backend.clone(), policy, Arc::new(SchedulerMetrics::new()));

    let vm = cluster.vm_create(&request("public", "x86_64", 1024)).await?;
    assert_eq!(vm.backend_id, "100");
    assert_eq!(cluster.vm_poll(&vm).await.status, VMStatus::Running);

    cluster.vm_destroy(&vm, "done").await?;
    assert_eq!(cluster.vm_slots().await, 2);
    assert_eq!(kills.load(Ordering::SeqCst), 0);
    assert_eq!(backend.tracked_instances().await, 1);

    tokio::time::sleep(policy.kill_grace + Duration::from_secs(1)).await;
    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert_eq!(backend.tracked_instances().await, 0);
    assert_eq!(backend.cached_runners().await, 0);
    Ok(())
}
