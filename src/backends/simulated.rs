use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CloudBackend, Termination};
use crate::core::vm::{VMRequest, VMStatus};
use crate::errors::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    Pending,
    Running,
    Stopping,
}

#[derive(Debug)]
struct SimInstance {
    polls: u32,
    state: SimState,
    raw_override: Option<String>,
}

/// An in-memory cloud. Instances boot after a few polls, and every call can
/// be made to fail on demand so lifecycle handling can be exercised without
/// a real IaaS.
pub struct SimulatedBackend {
    cloud_type: String,
    boot_polls: u32,
    latency: Duration,
    pending_shutdowns: bool,
    instances: Mutex<HashMap<String, SimInstance>>,
    next_ids: Mutex<VecDeque<String>>,
    reject_creates: AtomicU32,
    fail_shutdowns: AtomicU32,
    fail_kills: AtomicU32,
    fail_polls: AtomicU32,
    creates: AtomicU32,
    shutdowns: AtomicU32,
    kills: AtomicU32,
    polls: AtomicU32,
    forgotten: AtomicU32,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            cloud_type: "Simulated".to_string(),
            boot_polls: 1,
            latency: Duration::ZERO,
            pending_shutdowns: false,
            instances: Mutex::new(HashMap::new()),
            next_ids: Mutex::new(VecDeque::new()),
            reject_creates: AtomicU32::new(0),
            fail_shutdowns: AtomicU32::new(0),
            fail_kills: AtomicU32::new(0),
            fail_polls: AtomicU32::new(0),
            creates: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
            kills: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            forgotten: AtomicU32::new(0),
        }
    }

    /// Polls an instance needs before it reports RUNNING.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Delay added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make shutdown behave like an API cloud: accepted, never confirmed.
    pub fn with_pending_shutdowns(mut self) -> Self {
        self.pending_shutdowns = true;
        self
    }

    pub fn reject_next_creates(&self, n: u32) {
        self.reject_creates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_shutdowns(&self, n: u32) {
        self.fail_shutdowns.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_kills(&self, n: u32) {
        self.fail_kills.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_polls(&self, n: u32) {
        self.fail_polls.store(n, Ordering::SeqCst);
    }

    /// The next create hands out this id instead of a fresh one.
    pub async fn push_next_id(&self, id: impl Into<String>) {
        self.next_ids.lock().await.push_back(id.into());
    }

    /// Makes the instance report an arbitrary raw status from now on.
    pub async fn set_raw_status(&self, backend_id: &str, raw: impl Into<String>) -> bool {
        match self.instances.lock().await.get_mut(backend_id) {
            Some(instance) => {
                instance.raw_override = Some(raw.into());
                true
            }
            None => false,
        }
    }

    /// Drops an instance behind the scheduler's back.
    pub async fn vanish(&self, backend_id: &str) -> bool {
        self.instances.lock().await.remove(backend_id).is_some()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> u32 {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn forgotten(&self) -> u32 {
        self.forgotten.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CloudBackend for SimulatedBackend {
    fn cloud_type(&self) -> &str {
        &self.cloud_type
    }

    async fn create(&self, request: &VMRequest) -> Result<String, BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if take_one(&self.reject_creates) {
            return Err(BackendError::Rejected(format!("simulated refusal for {}", request.name)));
        }

        let id = match self.next_ids.lock().await.pop_front() {
            Some(id) => id,
            None => format!("sim-{}", Uuid::new_v4().simple()),
        };
        self.instances.lock().await.insert(
            id.clone(),
            SimInstance {
                polls: 0,
                state: SimState::Pending,
                raw_override: None,
            },
        );
        debug!(backend_id = %id, image = %request.image_location, "Simulated instance requested");
        Ok(id)
    }

    async fn shutdown(&self, backend_id: &str) -> Result<Termination, BackendError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if take_one(&self.fail_shutdowns) {
            return Err(BackendError::Transient("simulated shutdown failure".into()));
        }

        let mut instances = self.instances.lock().await;
        if self.pending_shutdowns {
            let instance = instances
                .get_mut(backend_id)
                .ok_or_else(|| BackendError::NotFound(backend_id.to_string()))?;
            instance.state = SimState::Stopping;
            Ok(Termination::Pending)
        } else {
            instances
                .remove(backend_id)
                .map(|_| Termination::Confirmed)
                .ok_or_else(|| BackendError::NotFound(backend_id.to_string()))
        }
    }

    async fn kill(&self, backend_id: &str) -> Result<(), BackendError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if take_one(&self.fail_kills) {
            return Err(BackendError::Transient("simulated kill failure".into()));
        }
        self.instances
            .lock()
            .await
            .remove(backend_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(backend_id.to_string()))
    }

    async fn status(&self, backend_id: &str) -> Result<String, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if take_one(&self.fail_polls) {
            return Err(BackendError::Transient("simulated poll failure".into()));
        }

        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(backend_id)
            .ok_or_else(|| BackendError::NotFound(backend_id.to_string()))?;
        if let Some(raw) = &instance.raw_override {
            return Ok(raw.clone());
        }

        instance.polls += 1;
        if instance.state == SimState::Pending && instance.polls >= self.boot_polls {
            instance.state = SimState::Running;
        }
        let raw = match instance.state {
            SimState::Pending => "PENDING",
            SimState::Running => "RUNNING",
            SimState::Stopping => "EPILOG",
        };
        Ok(raw.to_string())
    }

    fn map_status(&self, raw: &str) -> Option<VMStatus> {
        match raw {
            "PENDING" => Some(VMStatus::Starting),
            "RUNNING" => Some(VMStatus::Running),
            "EPILOG" | "DONE" => Some(VMStatus::Shutdown),
            "FAILED" => Some(VMStatus::Error),
            _ => None,
        }
    }

    async fn forget(&self, _backend_id: &str) {
        self.forgotten.fetch_add(1, Ordering::SeqCst);
    }
}
