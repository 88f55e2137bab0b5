pub mod backends;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod monitoring;
pub mod scheduler;

// Re-exports
pub use backends::{CloudBackend, Termination};
pub use crate::core::{Cluster, ClusterSpec, LifecyclePolicy, ResourcePool, VMRequest, VMStatus, VM};
pub use errors::{BackendError, CloudError, CloudResult, ClusterError};
pub use scheduler::{Placement, Scheduler};
