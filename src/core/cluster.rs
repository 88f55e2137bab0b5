/*
* Cluster: one IaaS backend plus the capacity it has left
* --------------------------------------------------------
* @project: cloud-scheduler
*
* A Cluster owns two things that must never drift apart: the capacity ledger
* (slots + per-node memory blocks) and the table of VMs it hosts. Both live
* behind ONE mutex, because every create/destroy touches them as a pair.
*
* Lifecycle contract (every backend gets it for free):
* ---------------------------------------------------
* vm_create  - check out capacity under the lock, drop the lock, ask the
*              backend, then insert the record or give the capacity back.
* vm_destroy - graceful shutdown, deferred forceful kill when the backend
*              won't confirm, bounded kill retries when it errors. Capacity
*              is always returned, even if the backend never answers.
* vm_poll    - ask the backend, translate its vocabulary, update the record.
*              Never fails loudly, never retries.
*
* The lock is never held across a backend call. Backends can be slow
* (subprocesses, remote APIs) and polls must not queue behind them.
*/

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backends::{CloudBackend, Termination};
use crate::core::ledger::CapacityLedger;
use crate::core::reaper::DeferredKills;
use crate::core::vm::{VMRequest, VMStatus, VM};
use crate::errors::handlers::with_timeout;
use crate::errors::{BackendError, ClusterError, ResourceType, RetryPolicy};
use crate::monitoring::{ClusterSnapshot, SchedulerMetrics};

/// Validated inventory entry for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub network_address: String,
    pub cloud_type: String,
    pub vm_slots: u32,
    pub cpu_cores: u32,
    pub storage_gb: u64,
    pub memory_blocks: Vec<u64>,
    pub cpu_archs: BTreeSet<String>,
    pub network_pools: BTreeSet<String>,
}

/// Timing knobs for backend calls made by a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Kill retries after a failed graceful shutdown.
    pub destroy_retry: RetryPolicy,
    /// Cap on every single backend call.
    pub backend_timeout: Duration,
    /// Wait between an unconfirmed shutdown and the forceful kill.
    pub kill_grace: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            destroy_retry: RetryPolicy::default(),
            backend_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(90),
        }
    }
}

/// Result of one poll. `error` is set when the backend itself failed, in
/// which case `status` is `Error` and the stored record was left alone.
#[derive(Debug)]
pub struct PollOutcome {
    pub status: VMStatus,
    pub error: Option<BackendError>,
}

struct ClusterState {
    ledger: CapacityLedger,
    vms: HashMap<String, VM>,
}

impl ClusterState {
    /// The hosted record for `backend_id`, if it is still the one numbered
    /// `record`. A reused id belongs to a different record.
    fn record_mut(&mut self, backend_id: &str, record: u64) -> Option<&mut VM> {
        self.vms.get_mut(backend_id).filter(|vm| vm.record == record)
    }

    /// Removes the record and hands its reservation back. Only the first
    /// caller for a given record gets `Some`.
    fn release(&mut self, backend_id: &str, record: u64) -> Option<VM> {
        self.record_mut(backend_id, record)?;
        let mut vm = self.vms.remove(backend_id)?;
        if !self.ledger.resource_return(vm.memory_entry, vm.memory_mb) {
            error!(
                backend_id,
                memory_entry = vm.memory_entry,
                "VM points at a memory block that does not exist, memory not returned"
            );
        }
        vm.status = VMStatus::Shutdown;
        Some(vm)
    }
}

pub struct Cluster {
    name: String,
    network_address: String,
    cloud_type: String,
    cpu_archs: BTreeSet<String>,
    network_pools: BTreeSet<String>,
    backend: Arc<dyn CloudBackend>,
    policy: LifecyclePolicy,
    metrics: Arc<SchedulerMetrics>,
    state: Mutex<ClusterState>,
    kills: DeferredKills,
    next_record: AtomicU64,
}

impl Cluster {
    pub fn new(
        spec: ClusterSpec,
        backend: Arc<dyn CloudBackend>,
        policy: LifecyclePolicy,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        info!(
            cluster = %spec.name,
            cloud_type = %spec.cloud_type,
            vm_slots = spec.vm_slots,
            memory = ?spec.memory_blocks,
            "Cluster registered"
        );
        Self {
            state: Mutex::new(ClusterState {
                ledger: CapacityLedger::new(
                    spec.vm_slots,
                    spec.cpu_cores,
                    spec.storage_gb,
                    spec.memory_blocks,
                ),
                vms: HashMap::new(),
            }),
            name: spec.name,
            network_address: spec.network_address,
            cloud_type: spec.cloud_type,
            cpu_archs: spec.cpu_archs,
            network_pools: spec.network_pools,
            backend,
            policy,
            metrics,
            kills: DeferredKills::new(),
            next_record: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_address(&self) -> &str {
        &self.network_address
    }

    pub fn cloud_type(&self) -> &str {
        &self.cloud_type
    }

    pub fn cpu_archs(&self) -> &BTreeSet<String> {
        &self.cpu_archs
    }

    pub fn network_pools(&self) -> &BTreeSet<String> {
        &self.network_pools
    }

    pub fn supports(&self, network: &str, cpu_arch: &str) -> bool {
        self.cpu_archs.contains(cpu_arch) && self.network_pools.contains(network)
    }

    pub async fn find_memory_entry(&self, memory_mb: u64) -> Option<usize> {
        self.state.lock().await.ledger.find_memory_entry(memory_mb)
    }

    pub async fn vm_slots(&self) -> u32 {
        self.state.lock().await.ledger.vm_slots()
    }

    pub async fn memory_blocks(&self) -> Vec<u64> {
        self.state.lock().await.ledger.memory_blocks().to_vec()
    }

    pub async fn ledger(&self) -> CapacityLedger {
        self.state.lock().await.ledger.clone()
    }

    /// Advisory check used by the pool. Nothing is reserved.
    pub async fn can_host(&self, network: &str, cpu_arch: &str, memory_mb: u64) -> bool {
        if !self.supports(network, cpu_arch) {
            return false;
        }
        self.state.lock().await.ledger.can_host(memory_mb)
    }

    pub async fn vm(&self, backend_id: &str) -> Option<VM> {
        self.state.lock().await.vms.get(backend_id).cloned()
    }

    pub async fn hosts(&self, backend_id: &str) -> bool {
        self.state.lock().await.vms.contains_key(backend_id)
    }

    /// Hosted VMs, oldest first.
    pub async fn vms(&self) -> Vec<VM> {
        let mut vms: Vec<VM> = self.state.lock().await.vms.values().cloned().collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.backend_id.cmp(&b.backend_id)));
        vms
    }

    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    pub async fn vm_create(&self, request: &VMRequest) -> Result<VM, ClusterError> {
        if !self.cpu_archs.contains(&request.cpu_arch) {
            return Err(self.refuse(ResourceType::CpuArchitecture, &request.cpu_arch));
        }
        if !self.network_pools.contains(&request.network) {
            return Err(self.refuse(ResourceType::Network, &request.network));
        }

        let entry = {
            let mut state = self.state.lock().await;
            match state.ledger.resource_checkout(request.memory_mb) {
                Ok(entry) => {
                    debug!(
                        cluster = %self.name,
                        memory_entry = entry,
                        memory_mb = request.memory_mb,
                        vm_slots = state.ledger.vm_slots(),
                        "Capacity checked out"
                    );
                    entry
                }
                Err(resource) => {
                    error!(
                        cluster = %self.name,
                        vm = %request.name,
                        %resource,
                        "Request routed to a cluster that cannot host it"
                    );
                    return Err(self.refuse(resource, &format!("{}MB", request.memory_mb)));
                }
            }
        };

        let backend_id = match with_timeout(self.policy.backend_timeout, self.backend.create(request)).await {
            Ok(id) => id,
            Err(source) => {
                self.state.lock().await.ledger.resource_return(entry, request.memory_mb);
                self.metrics.record_create_failure();
                warn!(
                    cluster = %self.name,
                    vm = %request.name,
                    error = %source,
                    "Backend refused VM, reservation rolled back"
                );
                return Err(ClusterError::CreateFailed {
                    cluster: self.name.clone(),
                    vm_name: request.name.clone(),
                    source,
                });
            }
        };

        // A timer still aimed at this id belongs to an older instance.
        if self.kills.cancel(&backend_id).await {
            warn!(cluster = %self.name, %backend_id, "Backend reused an id with a pending kill, kill cancelled");
        }

        let vm = VM::new(
            request,
            self.next_record.fetch_add(1, Ordering::Relaxed),
            backend_id.clone(),
            &self.name,
            &self.network_address,
            &self.cloud_type,
            entry,
        );

        {
            let mut state = self.state.lock().await;
            if state.vms.contains_key(&backend_id) {
                state.ledger.resource_return(entry, request.memory_mb);
                drop(state);
                self.metrics.record_create_failure();
                error!(cluster = %self.name, %backend_id, "Backend handed out an id that is already in use");
                return Err(ClusterError::DuplicateBackendId {
                    cluster: self.name.clone(),
                    backend_id,
                });
            }
            state.vms.insert(backend_id.clone(), vm.clone());
        }

        self.metrics.record_create();
        info!(
            cluster = %self.name,
            vm = %vm.name,
            %backend_id,
            memory_entry = entry,
            "VM create requested, cluster updated"
        );
        Ok(vm)
    }

    pub async fn vm_destroy(&self, vm: &VM, reason: &str) -> Result<(), ClusterError> {
        let backend_id = vm.backend_id.as_str();
        let record = vm.record;
        if self.state.lock().await.record_mut(backend_id, record).is_none() {
            debug!(cluster = %self.name, backend_id, record, "VM already destroyed, nothing to do");
            return Ok(());
        }

        debug!(cluster = %self.name, backend_id, "Sending shutdown signal");
        if !reason.is_empty() {
            debug!(cluster = %self.name, backend_id, reason, "Destroy reason");
        }

        match with_timeout(self.policy.backend_timeout, self.backend.shutdown(backend_id)).await {
            Ok(Termination::Confirmed) => {
                self.kills.cancel(backend_id).await;
                self.release(backend_id, record).await;
                self.backend.forget(backend_id).await;
                Ok(())
            }
            Ok(Termination::Pending) => {
                self.schedule_kill(backend_id).await;
                self.release(backend_id, record).await;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(cluster = %self.name, backend_id, "Backend has no record of VM, assuming it is gone");
                self.kills.cancel(backend_id).await;
                self.release(backend_id, record).await;
                self.backend.forget(backend_id).await;
                Ok(())
            }
            Err(e) => {
                warn!(cluster = %self.name, backend_id, error = %e, "Shutdown failed, killing instead");
                self.force_kill(backend_id, record).await
            }
        }
    }

    pub async fn vm_poll(&self, vm: &VM) -> PollOutcome {
        let backend_id = vm.backend_id.as_str();
        let polled = with_timeout(self.policy.backend_timeout, self.backend.status(backend_id)).await;
        let now = Utc::now();

        let mut gone = false;
        let status = match polled {
            Ok(raw) => match self.backend.map_status(&raw) {
                Some(status) => status,
                None => {
                    warn!(cluster = %self.name, backend_id, raw = %raw, "Unrecognised backend status, treating as Error");
                    VMStatus::Error
                }
            },
            Err(e) if e.is_not_found() => {
                debug!(cluster = %self.name, backend_id, "Backend no longer knows the VM, reporting Shutdown");
                gone = true;
                VMStatus::Shutdown
            }
            Err(e) => {
                self.metrics.record_poll_error();
                warn!(cluster = %self.name, backend_id, error = %e, "Poll failed");
                if let Some(hosted) = self.state.lock().await.record_mut(backend_id, vm.record) {
                    hosted.last_poll = Some(now);
                }
                return PollOutcome {
                    status: VMStatus::Error,
                    error: Some(e),
                };
            }
        };

        {
            let mut state = self.state.lock().await;
            if let Some(hosted) = state.record_mut(backend_id, vm.record) {
                let previous = hosted.status;
                if hosted.apply_poll(status, now) {
                    info!(
                        cluster = %self.name,
                        backend_id,
                        from = %previous,
                        to = %status,
                        "VM changed state"
                    );
                }
            }
        }

        // A Shutdown-mapped state can still be a VM winding down (EPILOG),
        // only an instance the backend has forgotten needs no kill.
        if gone && self.kills.cancel(backend_id).await {
            self.backend.forget(backend_id).await;
        }

        PollOutcome { status, error: None }
    }

    /// Forces an operator status onto a VM until its next successful poll.
    pub async fn set_override_status(&self, backend_id: &str, status: Option<VMStatus>) -> bool {
        match self.state.lock().await.vms.get_mut(backend_id) {
            Some(vm) => {
                vm.override_status = status;
                true
            }
            None => false,
        }
    }

    pub async fn pending_kills(&self) -> usize {
        self.kills.len().await
    }

    pub async fn has_pending_kill(&self, backend_id: &str) -> bool {
        self.kills.is_pending(backend_id).await
    }

    pub async fn cancel_pending_kill(&self, backend_id: &str) -> bool {
        self.kills.cancel(backend_id).await
    }

    /// Stops every outstanding timer. Hosted VMs are left alone.
    pub async fn shutdown(&self) {
        let cancelled = self.kills.cancel_all().await;
        if cancelled > 0 {
            info!(cluster = %self.name, cancelled, "Pending kills cancelled on shutdown");
        }
    }

    pub async fn snapshot(&self) -> ClusterSnapshot {
        let vms = self.vms().await;
        let ledger = self.ledger().await;
        ClusterSnapshot {
            name: self.name.clone(),
            network_address: self.network_address.clone(),
            cloud_type: self.cloud_type.clone(),
            vm_slots: ledger.vm_slots(),
            cpu_cores: ledger.cpu_cores(),
            storage_gb: ledger.storage_gb(),
            memory_blocks: ledger.memory_blocks().to_vec(),
            cpu_archs: self.cpu_archs.iter().cloned().collect(),
            network_pools: self.network_pools.iter().cloned().collect(),
            vms,
        }
    }

    pub async fn describe(&self) -> String {
        let ledger = self.ledger().await;
        format!(
            "CLUSTER Name: {}, Address: {}, Type: {}, VM slots: {}, Mem: {}",
            self.name,
            self.network_address,
            self.cloud_type,
            ledger.vm_slots(),
            join(ledger.memory_blocks()),
        )
    }

    fn refuse(&self, resource: ResourceType, requested: &str) -> ClusterError {
        ClusterError::InsufficientCapacity {
            cluster: self.name.clone(),
            resource,
            requested: requested.to_string(),
        }
    }

    async fn release(&self, backend_id: &str, record: u64) -> Option<VM> {
        let (released, vm_slots) = {
            let mut state = self.state.lock().await;
            let released = state.release(backend_id, record);
            (released, state.ledger.vm_slots())
        };

        match &released {
            Some(vm) => {
                self.metrics.record_destroy();
                info!(
                    cluster = %self.name,
                    backend_id,
                    memory_entry = vm.memory_entry,
                    memory_mb = vm.memory_mb,
                    vm_slots,
                    "VM destroyed and removed, cluster updated"
                );
            }
            None => debug!(cluster = %self.name, backend_id, "Another destroy already released this VM"),
        }
        released
    }

    async fn schedule_kill(&self, backend_id: &str) {
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let cluster = self.name.clone();
        let id = backend_id.to_string();
        let limit = self.policy.backend_timeout;

        debug!(
            cluster = %self.name,
            backend_id,
            grace_secs = self.policy.kill_grace.as_secs(),
            "Scheduling forceful kill"
        );
        self.kills
            .schedule(backend_id, self.policy.kill_grace, async move {
                metrics.record_deferred_kill();
                match with_timeout(limit, backend.kill(&id)).await {
                    Ok(()) => info!(cluster = %cluster, backend_id = %id, "Deferred kill sent"),
                    Err(e) if e.is_not_found() => {
                        debug!(cluster = %cluster, backend_id = %id, "Deferred kill found nothing to kill")
                    }
                    Err(e) => warn!(cluster = %cluster, backend_id = %id, error = %e, "Deferred kill failed"),
                }
                backend.forget(&id).await;
            })
            .await;
    }

    async fn force_kill(&self, backend_id: &str, record: u64) -> Result<(), ClusterError> {
        self.kills.cancel(backend_id).await;

        let backend = &self.backend;
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let outcome = self
            .policy
            .destroy_retry
            .run("kill", move || {
                counter.fetch_add(1, Ordering::Relaxed);
                backend.kill(backend_id)
            })
            .await;
        self.metrics
            .record_destroy_retries(attempts.load(Ordering::Relaxed).saturating_sub(1));

        let failure = match outcome {
            Ok(()) => None,
            Err(failure) if failure.error.is_not_found() => None,
            Err(failure) => Some(failure),
        };

        self.release(backend_id, record).await;
        self.backend.forget(backend_id).await;

        match failure {
            None => {
                debug!(cluster = %self.name, backend_id, "Managed to kill VM");
                Ok(())
            }
            Some(failure) => {
                self.metrics.record_forced_cleanup();
                warn!(
                    cluster = %self.name,
                    backend_id,
                    attempts = failure.attempts,
                    "Could not destroy VM, maybe already destroyed, cleaned up locally"
                );
                Err(ClusterError::DestroyIncomplete {
                    backend_id: backend_id.to_string(),
                    attempts: failure.attempts,
                    source: failure.error,
                })
            }
        }
    }
}

fn join(blocks: &[u64]) -> String {
    blocks
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
