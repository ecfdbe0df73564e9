//! Cluster ownership and failover.
//!
//! Resource groups register a [`FailOverListener`] with a [`DefaultCluster`];
//! when members leave the view the surviving members elect who inherits
//! each group's orphaned entries and reassign their ownership records
//! under a transaction.

pub mod election;
pub mod group;
pub mod listener;
pub mod manager;
pub mod ownership;
pub mod types;

pub use election::{
    ClientLocalListenerElector, EntryHashElector, FailoverElector, ShiftElector,
    DEFAULT_ELECTOR_SHIFT,
};
pub use group::GroupMembership;
pub use listener::{DataRemovalListener, FailOverListener};
pub use manager::DefaultCluster;
pub use ownership::{ClusteredOwnershipRecord, OWNER_ATTRIBUTE};
pub use types::{ClusterEvent, ClusterNodeAddress, MembershipView};
