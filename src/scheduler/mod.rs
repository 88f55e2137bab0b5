use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::core::{Cluster, PollOutcome, ResourcePool, VMRequest, VM};
use crate::errors::{CloudError, CloudResult};
use crate::monitoring::SchedulerMetrics;

/// Where a VM ended up.
#[derive(Clone)]
pub struct Placement {
    pub cluster: Arc<Cluster>,
    pub vm: VM,
}

/// Caller-facing front end over a pool: first-fit placement, periodic
/// polling and best-effort release.
pub struct Scheduler {
    pool: ResourcePool,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(pool: ResourcePool, metrics: Arc<SchedulerMetrics>) -> Self {
        Self { pool, metrics }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    pub async fn request_vm(&self, request: &VMRequest) -> CloudResult<Placement> {
        let cluster = self
            .pool
            .get_resource_first_fit(&request.network, &request.cpu_arch, request.memory_mb)
            .await
            .ok_or_else(|| CloudError::NoResource {
                network: request.network.clone(),
                cpu_arch: request.cpu_arch.clone(),
                memory_mb: request.memory_mb,
            })?;

        let vm = cluster.vm_create(request).await?;
        Ok(Placement { cluster, vm })
    }

    /// Polls every hosted VM on every cluster, concurrently.
    pub async fn poll_all(&self) -> Vec<(VM, PollOutcome)> {
        let mut targets = Vec::new();
        for cluster in self.pool.clusters() {
            for vm in cluster.vms().await {
                targets.push((Arc::clone(cluster), vm));
            }
        }

        let outcomes = join_all(targets.iter().map(|(cluster, vm)| cluster.vm_poll(vm))).await;
        targets
            .into_iter()
            .map(|(_, vm)| vm)
            .zip(outcomes)
            .collect()
    }

    /// Runs `poll_all` every `interval` until the handle is aborted.
    pub fn spawn_poller(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let outcomes = self.poll_all().await;
                let failed = outcomes.iter().filter(|(_, o)| o.error.is_some()).count();
                debug!(polled = outcomes.len(), failed, "Poll round finished");
            }
        })
    }

    /// Destroys a VM, logging instead of returning failures. Local state is
    /// consistent afterwards either way.
    pub async fn release_vm(&self, placement: &Placement, reason: &str) {
        if let Err(e) = placement.cluster.vm_destroy(&placement.vm, reason).await {
            warn!(
                cluster = %placement.cluster.name(),
                backend_id = %placement.vm.backend_id,
                error = %e,
                "Destroy did not complete cleanly"
            );
        }
    }

    /// Destroys every hosted VM in the pool. Returns how many were released.
    pub async fn release_all(&self, reason: &str) -> usize {
        let mut released = 0;
        for cluster in self.pool.clusters() {
            for vm in cluster.vms().await {
                let placement = Placement {
                    cluster: Arc::clone(cluster),
                    vm,
                };
                self.release_vm(&placement, reason).await;
                released += 1;
            }
        }
        info!(released, "Released all VMs");
        released
    }

    pub async fn locate(&self, backend_id: &str) -> Option<Arc<Cluster>> {
        for cluster in self.pool.clusters() {
            if cluster.hosts(backend_id).await {
                return Some(Arc::clone(cluster));
            }
        }
        None
    }

    /// Cancels outstanding deferred kills on every cluster.
    pub async fn shutdown(&self) {
        for cluster in self.pool.clusters() {
            cluster.shutdown().await;
        }
        self.metrics.log_summary();
    }
}
