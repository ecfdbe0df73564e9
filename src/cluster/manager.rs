//! Cluster Controller Implementation
//!
//! Handles:
//! - Tracking the agreed membership view
//! - Resource-group and data-removal listener registries
//! - Ownership takeover when members leave the view

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::election::FailoverElector;
use super::group::GroupMembership;
use super::listener::{DataRemovalListener, FailOverListener};
use super::ownership::ClusteredOwnershipRecord;
use super::types::{ClusterEvent, ClusterNodeAddress, MembershipView};
use crate::config::ClusterConfig;
use crate::error::{Result, SchedError};
use crate::store::{ReplicatedStore, StorePath};
use crate::transaction::{Transaction, TransactionManager};

/// Work queued for the reconciliation worker
#[derive(Debug)]
enum ClusterTask {
    Reconcile {
        old_view: MembershipView,
        new_view: MembershipView,
    },
    Shutdown,
}

struct RegisteredListener {
    order: u64,
    listener: Arc<dyn FailOverListener>,
}

/// Owns the membership view and the listener registries, and runs
/// ownership takeover for members that leave the cluster.
///
/// View changes are handed to a single worker so passes never overlap; a
/// change arriving mid-pass queues behind it.
pub struct DefaultCluster {
    store: Arc<dyn ReplicatedStore>,
    membership: Arc<dyn GroupMembership>,
    tx_manager: Option<Arc<dyn TransactionManager>>,
    elector: Arc<dyn FailoverElector>,
    buddy_backup_root: StorePath,
    current_view: RwLock<Option<MembershipView>>,
    fail_over_listeners: RwLock<Vec<RegisteredListener>>,
    registrations: AtomicU64,
    data_removal_listeners: DashMap<StorePath, Arc<dyn DataRemovalListener>>,
    task_tx: mpsc::UnboundedSender<ClusterTask>,
    // View changes received but not yet reconciled
    pending_passes: watch::Sender<usize>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for DefaultCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultCluster")
            .field("local_address", &self.local_address())
            .field("current_view", &*self.current_view.read())
            .field("pending_passes", &self.pending_reconciliations())
            .finish()
    }
}

impl DefaultCluster {
    /// Creates the controller and starts its event pump and reconciliation
    /// worker. Must be called from within a Tokio runtime.
    pub fn new(
        config: &ClusterConfig,
        store: Arc<dyn ReplicatedStore>,
        membership: Arc<dyn GroupMembership>,
        tx_manager: Option<Arc<dyn TransactionManager>>,
        elector: Arc<dyn FailoverElector>,
    ) -> Result<Arc<Self>> {
        let buddy_backup_root: StorePath = config
            .buddy_backup_root
            .parse()
            .map_err(|e| SchedError::Config(format!("Invalid buddy backup root: {}", e)))?;

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        // Subscribe before reading the view so no change slips in between
        let clustered = membership.is_clustered();
        let events = if clustered { Some(membership.subscribe()) } else { None };
        let current_view = if clustered { Some(membership.current_view()) } else { None };

        let cluster = Arc::new(Self {
            store,
            membership,
            tx_manager,
            elector,
            buddy_backup_root,
            current_view: RwLock::new(current_view),
            fail_over_listeners: RwLock::new(Vec::new()),
            registrations: AtomicU64::new(0),
            data_removal_listeners: DashMap::new(),
            task_tx,
            pending_passes: watch::channel(0).0,
            stop_tx,
        });

        tokio::spawn(Self::process_tasks(Arc::downgrade(&cluster), task_rx));
        if let Some(events) = events {
            tokio::spawn(Self::pump_events(Arc::downgrade(&cluster), events, stop_rx));
        }

        info!(
            "Cluster controller started at {:?}, view {}",
            cluster.local_address(),
            cluster.cluster_members()
        );
        Ok(cluster)
    }

    /// Forwards notifications from the group layer into [`Self::on_event`]
    async fn pump_events(
        cluster: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match cluster.upgrade() {
                        Some(cluster) => cluster.on_event(event),
                        None => break,
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
        debug!("Cluster event pump stopped");
    }

    /// Runs queued reconciliation passes one at a time, off the async workers
    async fn process_tasks(cluster: Weak<Self>, mut task_rx: mpsc::UnboundedReceiver<ClusterTask>) {
        while let Some(task) = task_rx.recv().await {
            match task {
                ClusterTask::Reconcile { old_view, new_view } => {
                    let Some(cluster) = cluster.upgrade() else { break };
                    let worker = cluster.clone();
                    let pass = tokio::task::spawn_blocking(move || {
                        worker.reconcile(&old_view, &new_view);
                    })
                    .await;
                    if let Err(e) = pass {
                        error!("Reconciliation pass aborted: {}", e);
                    }
                    cluster.pass_finished();
                }
                ClusterTask::Shutdown => break,
            }
        }
        debug!("Cluster task processor stopped");
    }

    /// Single dispatch point for group-layer notifications. Returns promptly;
    /// takeover work is queued for the reconciliation worker.
    pub fn on_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::ViewChanged { view } => self.on_view_changed(view),
            ClusterEvent::NodeRemoved { path, origin_local } => {
                self.on_node_removed(&path, origin_local)
            }
        }
    }

    fn on_view_changed(&self, view: MembershipView) {
        debug!("View changed at {:?}: {}", self.local_address(), view);
        // Counted before the view swap so observers never see the new view with no pass pending
        self.pending_passes.send_modify(|pending| *pending += 1);
        let old_view = self.current_view.write().replace(view.clone());
        let Some(old_view) = old_view else {
            self.pass_finished();
            return;
        };

        let task = ClusterTask::Reconcile {
            old_view,
            new_view: view,
        };
        if self.task_tx.send(task).is_err() {
            self.pass_finished();
            warn!("Cluster controller stopped, dropping view change");
        }
    }

    fn pass_finished(&self) {
        self.pending_passes
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    fn on_node_removed(&self, path: &StorePath, origin_local: bool) {
        if origin_local {
            return;
        }
        let Some(parent) = path.parent() else {
            return;
        };
        let listener = self
            .data_removal_listeners
            .get(&parent)
            .map(|entry| entry.value().clone());
        if let Some(listener) = listener {
            listener.data_removed(path);
        }
    }

    /// Runs one reconciliation pass on the calling thread: every member of
    /// `old_view` missing from `new_view` has its entries taken over, group
    /// by group in priority order.
    pub fn reconcile(&self, old_view: &MembershipView, new_view: &MembershipView) {
        let Some(local) = self.local_address() else {
            warn!("No local address, skipping reconciliation");
            return;
        };
        let lost = new_view.lost_since(old_view);
        if lost.is_empty() {
            debug!("No members lost between {} and {}", old_view, new_view);
            return;
        }

        let listeners = self.listeners_snapshot();
        for lost_member in &lost {
            info!("Processing lost member {}", lost_member);
            for listener in &listeners {
                let base = listener.base_path();
                let use_local_elector = listener.elector().is_some();
                if !use_local_elector {
                    match self.elector.elect(new_view) {
                        Ok(elected) if elected == local => {}
                        Ok(elected) => {
                            debug!("{} elected to take over {} from {}", elected, base, lost_member);
                            continue;
                        }
                        Err(e) => {
                            error!("Election for {} failed: {}", base, e);
                            continue;
                        }
                    }
                }

                match self.perform_take_over(
                    listener.as_ref(),
                    lost_member,
                    &local,
                    new_view,
                    use_local_elector,
                ) {
                    Ok(won) => info!(
                        "Took over {} entries of {} from lost member {}",
                        won, base, lost_member
                    ),
                    Err(e) => error!(
                        "Takeover of {} from lost member {} rolled back: {}",
                        base, lost_member, e
                    ),
                }
            }
        }
    }

    fn perform_take_over(
        &self,
        listener: &dyn FailOverListener,
        lost: &ClusterNodeAddress,
        local: &ClusterNodeAddress,
        view: &MembershipView,
        use_local_elector: bool,
    ) -> Result<usize> {
        debug!("Failing over {} of lost member {}", listener.base_path(), lost);

        let tx = match &self.tx_manager {
            Some(tm) => Some(tm.begin()?),
            None => None,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.take_over_entries(listener, lost, local, view, use_local_elector, tx.as_deref())
        }))
        .unwrap_or_else(|_| {
            Err(SchedError::cluster(format!(
                "Resource group {} panicked during takeover",
                listener.base_path()
            )))
        });

        match (tx, outcome) {
            (Some(tx), Ok(won)) => {
                tx.commit()?;
                Ok(won)
            }
            (Some(tx), Err(e)) => {
                if let Err(rollback) = tx.rollback() {
                    error!("Rollback of transaction {} failed: {}", tx.id(), rollback);
                }
                Err(e)
            }
            (None, outcome) => outcome,
        }
    }

    fn take_over_entries(
        &self,
        listener: &dyn FailOverListener,
        lost: &ClusterNodeAddress,
        local: &ClusterNodeAddress,
        view: &MembershipView,
        use_local_elector: bool,
        tx: Option<&dyn Transaction>,
    ) -> Result<usize> {
        let base = listener.base_path();
        if self.store.buddy_replication_enabled() {
            self.gravitate_backup(lost, base)?;
        }

        listener.fail_over_cluster_member(lost, tx)?;

        let local_elector = if use_local_elector { listener.elector() } else { None };
        let mut won = 0;
        for child in self.store.children_names(base)? {
            let record = ClusteredOwnershipRecord::new(base.child(child), self.store.clone());
            if !record.exists()? {
                debug!("Entry {} vanished during takeover", record.path());
                continue;
            }
            if record.owner()?.as_ref() != Some(lost) {
                continue;
            }
            if let Some(elector) = local_elector {
                if elector.elect(view, &record)? != *local {
                    continue;
                }
            }
            listener.won_ownership(&record, tx)?;
            record.set_owner(local, tx)?;
            won += 1;
        }
        Ok(won)
    }

    /// Materializes locally every entry the lost member's buddy held for `base`
    fn gravitate_backup(&self, lost: &ClusterNodeAddress, base: &StorePath) -> Result<usize> {
        let backup = self
            .buddy_backup_root
            .child(lost.path_element())
            .join(base);
        let children = self.store.children_names(&backup)?;
        debug!("Backup {} holds {} entries", backup, children.len());
        for child in &children {
            let path = base.child(child.clone());
            debug!("Forcing fetch of {}", path);
            self.store.force_fetch(&path)?;
        }
        Ok(children.len())
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn FailOverListener>> {
        self.fail_over_listeners
            .read()
            .iter()
            .map(|registered| registered.listener.clone())
            .collect()
    }

    pub fn local_address(&self) -> Option<ClusterNodeAddress> {
        self.membership.local_address()
    }

    pub fn cluster_members(&self) -> MembershipView {
        if let Some(view) = self.current_view.read().clone() {
            return view;
        }
        match self.local_address() {
            Some(local) => MembershipView::new(vec![local]),
            None => MembershipView::default(),
        }
    }

    pub fn is_head_member(&self) -> bool {
        match self.local_address() {
            Some(local) => self.cluster_members().head() == Some(&local),
            None => true,
        }
    }

    pub fn is_single_member(&self) -> bool {
        match self.local_address() {
            Some(_) => self.cluster_members().len() == 1,
            None => true,
        }
    }

    /// Registers a resource group; false if one is already registered for its base path
    pub fn add_fail_over_listener(&self, listener: Arc<dyn FailOverListener>) -> bool {
        debug!("Adding fail over listener for {}", listener.base_path());
        let mut listeners = self.fail_over_listeners.write();
        if listeners
            .iter()
            .any(|registered| registered.listener.base_path() == listener.base_path())
        {
            return false;
        }
        let order = self.registrations.fetch_add(1, Ordering::SeqCst);
        listeners.push(RegisteredListener { order, listener });
        listeners.sort_by_key(|registered| (registered.listener.priority(), registered.order));
        true
    }

    pub fn remove_fail_over_listener(&self, base_path: &StorePath) -> bool {
        debug!("Removing fail over listener for {}", base_path);
        let mut listeners = self.fail_over_listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| registered.listener.base_path() != base_path);
        listeners.len() != before
    }

    /// Base paths of the registered resource groups, in takeover order
    pub fn fail_over_listener_paths(&self) -> Vec<StorePath> {
        self.fail_over_listeners
            .read()
            .iter()
            .map(|registered| registered.listener.base_path().clone())
            .collect()
    }

    pub fn add_data_removal_listener(&self, listener: Arc<dyn DataRemovalListener>) -> bool {
        match self.data_removal_listeners.entry(listener.base_path().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(listener);
                true
            }
        }
    }

    pub fn remove_data_removal_listener(&self, base_path: &StorePath) -> bool {
        self.data_removal_listeners.remove(base_path).is_some()
    }

    pub fn store(&self) -> &Arc<dyn ReplicatedStore> {
        &self.store
    }

    pub fn tx_manager(&self) -> Option<&Arc<dyn TransactionManager>> {
        self.tx_manager.as_ref()
    }

    /// View changes received but not yet fully reconciled
    pub fn pending_reconciliations(&self) -> usize {
        *self.pending_passes.borrow()
    }

    /// Waits until every queued reconciliation pass has completed
    pub async fn wait_for_reconciliation(&self) {
        let mut pending = self.pending_passes.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }

    /// Stops the event pump and the reconciliation worker
    pub fn stop(&self) {
        info!("Stopping cluster controller");
        let _ = self.stop_tx.send(true);
        let _ = self.task_tx.send(ClusterTask::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::election::ShiftElector;
    use crate::store::{LocalGroup, LocalMember};
    use parking_lot::Mutex;
    use tokio::time::Duration;

    struct NamedGroup {
        base: StorePath,
        priority: i32,
    }

    impl FailOverListener for NamedGroup {
        fn base_path(&self) -> &StorePath {
            &self.base
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn fail_over_cluster_member(
            &self,
            _lost: &ClusterNodeAddress,
            _tx: Option<&dyn Transaction>,
        ) -> Result<()> {
            Ok(())
        }

        fn won_ownership(
            &self,
            _record: &ClusteredOwnershipRecord,
            _tx: Option<&dyn Transaction>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Removals {
        base: StorePath,
        seen: Mutex<Vec<StorePath>>,
    }

    impl DataRemovalListener for Removals {
        fn base_path(&self) -> &StorePath {
            &self.base
        }

        fn data_removed(&self, path: &StorePath) {
            self.seen.lock().push(path.clone());
        }
    }

    fn group(name: &str, priority: i32) -> Arc<NamedGroup> {
        Arc::new(NamedGroup {
            base: StorePath::new([name]),
            priority,
        })
    }

    fn controller(member: &LocalMember) -> Arc<DefaultCluster> {
        DefaultCluster::new(
            &ClusterConfig::default(),
            Arc::new(member.clone()),
            Arc::new(member.clone()),
            None,
            Arc::new(ShiftElector::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_base_path_rejected() {
        let local = LocalGroup::new();
        let cluster = controller(&local.join("a:1".into()));

        assert!(cluster.add_fail_over_listener(group("timers", 0)));
        assert!(!cluster.add_fail_over_listener(group("timers", 9)));
        assert!(cluster.remove_fail_over_listener(&StorePath::new(["timers"])));
        assert!(!cluster.remove_fail_over_listener(&StorePath::new(["timers"])));
        assert!(cluster.add_fail_over_listener(group("timers", 9)));
    }

    #[tokio::test]
    async fn test_listeners_ordered_by_priority_then_registration() {
        let local = LocalGroup::new();
        let cluster = controller(&local.join("a:1".into()));

        cluster.add_fail_over_listener(group("late", 5));
        cluster.add_fail_over_listener(group("first-b", 1));
        cluster.add_fail_over_listener(group("first-a", 1));
        cluster.add_fail_over_listener(group("early", -3));

        let order: Vec<String> = cluster
            .fail_over_listener_paths()
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(order, vec!["/early", "/first-b", "/first-a", "/late"]);
    }

    #[tokio::test]
    async fn test_head_and_single_member() {
        let local = LocalGroup::new();
        let a = local.join("a:1".into());
        let cluster = controller(&a);
        assert!(cluster.is_head_member());
        assert!(cluster.is_single_member());

        let b = local.join("b:1".into());
        let other = controller(&b);
        assert!(!other.is_head_member());
        assert!(!other.is_single_member());
        assert_eq!(other.cluster_members().len(), 2);

        // the first member learns about b through its event stream
        tokio::time::timeout(Duration::from_secs(2), async {
            while cluster.cluster_members().len() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!cluster.is_single_member());
    }

    #[tokio::test]
    async fn test_remote_node_removal_dispatched_to_parent_listener() {
        let local = LocalGroup::new();
        let cluster = controller(&local.join("a:1".into()));
        let removals = Arc::new(Removals {
            base: StorePath::new(["timers"]),
            seen: Mutex::new(Vec::new()),
        });
        assert!(cluster.add_data_removal_listener(removals.clone()));
        assert!(!cluster.add_data_removal_listener(removals.clone()));

        let removed = StorePath::new(["timers", "t1"]);
        cluster.on_event(ClusterEvent::NodeRemoved {
            path: removed.clone(),
            origin_local: false,
        });
        cluster.on_event(ClusterEvent::NodeRemoved {
            path: StorePath::new(["timers", "t2"]),
            origin_local: true,
        });
        cluster.on_event(ClusterEvent::NodeRemoved {
            path: StorePath::new(["other", "t3"]),
            origin_local: false,
        });
        assert_eq!(*removals.seen.lock(), vec![removed]);

        assert!(cluster.remove_data_removal_listener(&StorePath::new(["timers"])));
        assert!(!cluster.remove_data_removal_listener(&StorePath::new(["timers"])));
    }

    #[tokio::test]
    async fn test_invalid_backup_root_rejected() {
        let local = LocalGroup::new();
        let member = local.join("a:1".into());
        let config = ClusterConfig {
            buddy_backup_root: "no-slash".to_string(),
            ..Default::default()
        };
        let result = DefaultCluster::new(
            &config,
            Arc::new(member.clone()),
            Arc::new(member),
            None,
            Arc::new(ShiftElector::default()),
        );
        assert!(matches!(result, Err(SchedError::Config(_))));
    }
}
