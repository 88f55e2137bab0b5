pub mod cluster;
pub mod ledger;
pub mod pool;
pub mod reaper;
pub mod vm;

// exports for lazy devs like us
pub use cluster::{Cluster, ClusterSpec, LifecyclePolicy, PollOutcome};
pub use ledger::CapacityLedger;
pub use pool::ResourcePool;
pub use vm::{VMRequest, VMStatus, VM};
