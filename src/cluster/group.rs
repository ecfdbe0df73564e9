use tokio::sync::mpsc;

use crate::cluster::types::{ClusterEvent, ClusterNodeAddress, MembershipView};

/// Group-communication layer beneath the replicated store
pub trait GroupMembership: Send + Sync {
    /// This process's own address, if the layer has assigned one
    fn local_address(&self) -> Option<ClusterNodeAddress>;

    fn current_view(&self) -> MembershipView;

    /// False when the store runs in local (non-replicated) mode
    fn is_clustered(&self) -> bool {
        true
    }

    /// Registers for view-change and node-removed notifications.
    ///
    /// Senders must never block: events are pushed and the notification
    /// thread returns immediately.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent>;
}
