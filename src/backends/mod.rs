pub mod api;
pub mod nimbus;
pub mod simulated;

use async_trait::async_trait;

use crate::core::vm::{VMRequest, VMStatus};
use crate::errors::BackendError;

// exports so callers don't have to spell out the full paths
pub use api::{ApiBackend, InstanceRunner, RunnerFactory, RunnerRegistry};
pub use nimbus::NimbusBackend;
pub use simulated::SimulatedBackend;

/// How a backend answered a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The instance is gone.
    Confirmed,
    /// Shutdown was requested but not acknowledged; the cluster follows up
    /// with a forceful kill after the grace period.
    Pending,
}

/// The seam a concrete IaaS plugs into.
///
/// Adapters only talk to their backend. Capacity bookkeeping, retries,
/// deferred kills and status bookkeeping all live in `Cluster`, so every
/// adapter gets the same lifecycle guarantees.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    fn cloud_type(&self) -> &str;

    /// Starts provisioning and returns the backend's handle for the new
    /// instance. Returns once the request is accepted, not once it runs.
    async fn create(&self, request: &VMRequest) -> Result<String, BackendError>;

    async fn shutdown(&self, backend_id: &str) -> Result<Termination, BackendError>;

    async fn kill(&self, backend_id: &str) -> Result<(), BackendError>;

    /// Raw, backend-specific status string.
    async fn status(&self, backend_id: &str) -> Result<String, BackendError>;

    /// Translates a raw status into the canonical vocabulary. `None` means
    /// the string is not one this backend knows about.
    fn map_status(&self, raw: &str) -> Option<VMStatus>;

    /// Drops any per-instance state the adapter keeps once the instance is
    /// known to be gone.
    async fn forget(&self, _backend_id: &str) {}
}
