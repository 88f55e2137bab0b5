use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CloudBackend, Termination};
use crate::core::vm::{VMRequest, VMStatus};
use crate::errors::BackendError;

/// Client handle for one image on a provisioning API. The remote library
/// behind it is supplied by the embedding application.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    /// Starts instances of the runner's image, returning every instance id
    /// the API reports. The newest id comes last.
    async fn run_instance(&self) -> Result<Vec<u64>, BackendError>;
    async fn shutdown_instances(&self, ids: &[u64]) -> Result<(), BackendError>;
    async fn kill_instances(&self, ids: &[u64]) -> Result<(), BackendError>;
    async fn vm_state(&self, id: u64) -> Result<String, BackendError>;
}

pub trait RunnerFactory: Send + Sync {
    fn runner(&self, image_location: &str) -> Arc<dyn InstanceRunner>;
}

/// Runner cache and instance bookkeeping for one `ApiBackend`.
///
/// Lives exactly as long as the adapter that owns it; nothing here is
/// process-wide.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn InstanceRunner>>,
    image_of: HashMap<String, String>,
    ids_by_image: HashMap<String, Vec<String>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached runner for an image, created through `factory` on first use.
    pub fn runner_for(&mut self, image_location: &str, factory: &dyn RunnerFactory) -> Arc<dyn InstanceRunner> {
        Arc::clone(
            self.runners
                .entry(image_location.to_string())
                .or_insert_with(|| factory.runner(image_location)),
        )
    }

    pub fn bind(&mut self, instance_id: &str, image_location: &str) {
        self.image_of
            .insert(instance_id.to_string(), image_location.to_string());
        self.ids_by_image
            .entry(image_location.to_string())
            .or_default()
            .push(instance_id.to_string());
    }

    pub fn runner_of(&self, instance_id: &str) -> Option<Arc<dyn InstanceRunner>> {
        let image = self.image_of.get(instance_id)?;
        self.runners.get(image).cloned()
    }

    /// Forgets an instance. A runner with no instances left is dropped too.
    pub fn forget(&mut self, instance_id: &str) -> bool {
        let Some(image) = self.image_of.remove(instance_id) else {
            return false;
        };
        if let Some(ids) = self.ids_by_image.get_mut(&image) {
            ids.retain(|id| id != instance_id);
            if ids.is_empty() {
                self.ids_by_image.remove(&image);
                self.runners.remove(&image);
            }
        }
        true
    }

    pub fn instances(&self) -> usize {
        self.image_of.len()
    }

    pub fn runners(&self) -> usize {
        self.runners.len()
    }
}

/// Adapter for clouds driven through a provisioning API (StratusLab style).
/// Shutdown is only a request there, so it reports `Termination::Pending`
/// and leaves the forceful kill to the cluster's deferred kill.
pub struct ApiBackend {
    cloud_type: String,
    factory: Arc<dyn RunnerFactory>,
    registry: Mutex<RunnerRegistry>,
}

impl ApiBackend {
    pub fn new(cloud_type: impl Into<String>, factory: Arc<dyn RunnerFactory>) -> Self {
        Self {
            cloud_type: cloud_type.into(),
            factory,
            registry: Mutex::new(RunnerRegistry::new()),
        }
    }

    pub async fn tracked_instances(&self) -> usize {
        self.registry.lock().await.instances()
    }

    pub async fn cached_runners(&self) -> usize {
        self.registry.lock().await.runners()
    }

    async fn lookup(&self, backend_id: &str) -> Result<(Arc<dyn InstanceRunner>, u64), BackendError> {
        let id = backend_id
            .parse::<u64>()
            .map_err(|_| BackendError::NotFound(backend_id.to_string()))?;
        let runner = self
            .registry
            .lock()
            .await
            .runner_of(backend_id)
            .ok_or_else(|| BackendError::NotFound(backend_id.to_string()))?;
        Ok((runner, id))
    }
}

pub fn map_api_status(raw: &str) -> Option<VMStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "INIT" | "BOOT" | "PROLOG" | "PENDING" | "HOLD" => Some(VMStatus::Starting),
        "RUNNING" | "ACTIVE" | "STOPPED" | "SUSPENDED" => Some(VMStatus::Running),
        "DONE" | "EPILOG" => Some(VMStatus::Shutdown),
        "FAILED" | "FAILURE" | "UNKNOWN" => Some(VMStatus::Error),
        _ => None,
    }
}

#[async_trait]
impl CloudBackend for ApiBackend {
    fn cloud_type(&self) -> &str {
        &self.cloud_type
    }

    async fn create(&self, request: &VMRequest) -> Result<String, BackendError> {
        debug!(image = %request.image_location, "Running new instance through provisioning API");
        let runner = self
            .registry
            .lock()
            .await
            .runner_for(&request.image_location, self.factory.as_ref());

        let ids = runner.run_instance().await?;
        let newest = ids
            .last()
            .ok_or_else(|| BackendError::Rejected("API started no instances".into()))?
            .to_string();
        debug!(instances = ?ids, "Created instances");

        self.registry
            .lock()
            .await
            .bind(&newest, &request.image_location);
        Ok(newest)
    }

    async fn shutdown(&self, backend_id: &str) -> Result<Termination, BackendError> {
        let (runner, id) = self.lookup(backend_id).await?;
        runner.shutdown_instances(&[id]).await?;
        Ok(Termination::Pending)
    }

    async fn kill(&self, backend_id: &str) -> Result<(), BackendError> {
        let (runner, id) = self.lookup(backend_id).await?;
        runner.kill_instances(&[id]).await
    }

    async fn status(&self, backend_id: &str) -> Result<String, BackendError> {
        let (runner, id) = self.lookup(backend_id).await?;
        runner.vm_state(id).await
    }

    fn map_status(&self, raw: &str) -> Option<VMStatus> {
        map_api_status(raw)
    }

    async fn forget(&self, backend_id: &str) {
        if self.registry.lock().await.forget(backend_id) {
            debug!(backend_id, "Cleaned registry entries for instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    struct FakeRunner {
        next_id: AtomicU64,
        kills: AtomicU32,
    }

    #[async_trait]
    impl InstanceRunner for FakeRunner {
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
            Ok("running".into())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        built: AtomicU32,
    }

    impl RunnerFactory for FakeFactory {
        fn runner(&self, _image_location: &str) -> Arc<dyn InstanceRunner> {
            let n = self.built.fetch_add(1, Ordering::SeqCst);
            Arc::new(FakeRunner {
                next_id: AtomicU64::new(100 * (u64::from(n) + 1)),
                kills: AtomicU32::new(0),
            })
        }
    }

    fn request(image: &str) -> VMRequest {
        VMRequest::new("api-vm", "public", "x86", image, 256)
    }

    #[tokio::test]
    async fn runners_are_cached_per_image() {
        let factory = Arc::new(FakeFactory::default());
        let backend = ApiBackend::new("StratusLab", factory.clone());

        let a = backend.create(&request("img-a")).await.unwrap();
        let b = backend.create(&request("img-a")).await.unwrap();
        backend.create(&request("img-b")).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        assert_eq!(backend.tracked_instances().await, 3);
    }

    #[tokio::test]
    async fn shutdown_is_pending_and_status_is_mapped() {
        let backend = ApiBackend::new("StratusLab", Arc::new(FakeFactory::default()));
        let id = backend.create(&request("img")).await.unwrap();

        assert_eq!(backend.shutdown(&id).await.unwrap(), Termination::Pending);
        let raw = backend.status(&id).await.unwrap();
        assert_eq!(backend.map_status(&raw), Some(VMStatus::Running));
    }

    #[tokio::test]
    async fn forgotten_instances_are_not_found() {
        let backend = ApiBackend::new("StratusLab", Arc::new(FakeFactory::default()));
        let id = backend.create(&request("img")).await.unwrap();

        backend.forget(&id).await;
        assert_eq!(backend.tracked_instances().await, 0);
        assert_eq!(backend.cached_runners().await, 0);
        assert!(backend.kill(&id).await.unwrap_err().is_not_found());
        assert!(backend.status("not-a-number").await.unwrap_err().is_not_found());
    }

    #[test]
    fn api_vocabulary() {
        assert_eq!(map_api_status("prolog"), Some(VMStatus::Starting));
        assert_eq!(map_api_status("SUSPENDED"), Some(VMStatus::Running));
        assert_eq!(map_api_status("Epilog"), Some(VMStatus::Shutdown));
        assert_eq!(map_api_status("FAILURE"), Some(VMStatus::Error));
        assert_eq!(map_api_status("MIGRATING"), None);
    }
}
