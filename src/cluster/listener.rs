use crate::cluster::election::ClientLocalListenerElector;
use crate::cluster::ownership::ClusteredOwnershipRecord;
use crate::cluster::types::ClusterNodeAddress;
use crate::error::Result;
use crate::store::StorePath;
use crate::transaction::Transaction;

/// A resource group: a namespace of ownership records failed over together.
///
/// Identity is the base path; at most one group per base path may be
/// registered with a cluster.
pub trait FailOverListener: Send + Sync {
    fn base_path(&self) -> &StorePath;

    /// Groups are taken over in ascending priority order
    fn priority(&self) -> i32;

    /// Per-entry elector; when present it replaces the cluster-wide elector for this group
    fn elector(&self) -> Option<&dyn ClientLocalListenerElector> {
        None
    }

    /// Bulk pre-processing before the group's entries owned by `lost` are examined
    fn fail_over_cluster_member(
        &self,
        lost: &ClusterNodeAddress,
        tx: Option<&dyn Transaction>,
    ) -> Result<()>;

    /// The local member is taking `record` over; its owner is reassigned right after
    fn won_ownership(
        &self,
        record: &ClusteredOwnershipRecord,
        tx: Option<&dyn Transaction>,
    ) -> Result<()>;
}

/// Notified when another member removes a node directly below `base_path`
pub trait DataRemovalListener: Send + Sync {
    fn base_path(&self) -> &StorePath;

    fn data_removed(&self, path: &StorePath);
}
