pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod timers;
pub mod transaction;

// Re-export common types
pub use cluster::{
    ClusterEvent, ClusterNodeAddress, ClusteredOwnershipRecord, DefaultCluster, FailOverListener,
    MembershipView,
};
pub use config::Config;
pub use error::{Result, SchedError};
pub use store::{ReplicatedStore, StorePath};
pub use timers::{FaultTolerantScheduler, TaskId, TimerTask, TimerTaskData};
pub use transaction::{Transaction, TransactionManager, TransactionalGate};
