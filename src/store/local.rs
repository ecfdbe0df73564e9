//! In-process replicated store and group membership.
//!
//! Every member joined to a [`LocalGroup`] shares one tree, so a write is
//! visible cluster-wide as soon as it returns. With buddy replication
//! enabled each write is mirrored under the writer's backup subtree, and
//! the primaries a member wrote disappear with it when it leaves.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{NodeData, ReplicatedStore, StorePath};
use crate::cluster::group::GroupMembership;
use crate::cluster::types::{ClusterEvent, ClusterNodeAddress, MembershipView};
use crate::error::Result;

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<StorePath, NodeData>,
    writers: HashMap<StorePath, ClusterNodeAddress>,
}

type Subscriber = (Option<ClusterNodeAddress>, mpsc::UnboundedSender<ClusterEvent>);

struct GroupState {
    tree: RwLock<Tree>,
    view: RwLock<MembershipView>,
    subscribers: Mutex<Vec<Subscriber>>,
    backup_root: Option<StorePath>,
}

impl GroupState {
    fn new(backup_root: Option<StorePath>) -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            view: RwLock::new(MembershipView::default()),
            subscribers: Mutex::new(Vec::new()),
            backup_root,
        }
    }

    /// Primary path a backup node mirrors, if `key` lives in the backup subtree
    fn backup_target(&self, key: &StorePath) -> Option<StorePath> {
        let relative = key.strip_prefix(self.backup_root.as_ref()?)?;
        if relative.len() < 2 {
            return None;
        }
        Some(StorePath::new(relative.elements()[1..].iter().cloned()))
    }

    fn is_backup(&self, key: &StorePath) -> bool {
        match &self.backup_root {
            Some(root) => key.starts_with(root),
            None => false,
        }
    }

    fn drop_backups(&self, tree: &mut Tree, path: &StorePath) {
        if self.backup_root.is_none() {
            return;
        }
        let stale: Vec<StorePath> = tree
            .nodes
            .keys()
            .filter(|key| self.backup_target(key).as_ref() == Some(path))
            .cloned()
            .collect();
        for key in stale {
            tree.nodes.remove(&key);
        }
    }

    fn broadcast(&self, event: impl Fn(&Option<ClusterNodeAddress>) -> ClusterEvent) {
        self.subscribers
            .lock()
            .retain(|(address, tx)| tx.send(event(address)).is_ok());
    }
}

/// A simulated group: shared tree plus an ordered membership view
#[derive(Clone)]
pub struct LocalGroup {
    state: Arc<GroupState>,
}

impl Default for LocalGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGroup {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GroupState::new(None)),
        }
    }

    /// Group whose members mirror every write under `<backup_root>/<writer>/`
    pub fn with_buddy_replication(backup_root: StorePath) -> Self {
        Self {
            state: Arc::new(GroupState::new(Some(backup_root))),
        }
    }

    /// Adds `address` to the end of the view and notifies existing members
    pub fn join(&self, address: ClusterNodeAddress) -> LocalMember {
        let view = {
            let mut view = self.state.view.write();
            if !view.contains(&address) {
                *view = view.iter().cloned().chain([address.clone()]).collect();
            }
            view.clone()
        };
        info!("Member {} joined, view {}", address, view);
        self.state
            .broadcast(|_| ClusterEvent::ViewChanged { view: view.clone() });

        LocalMember {
            address: Some(address),
            state: self.state.clone(),
            clustered: true,
        }
    }

    /// Removes `address` from the view as if it crashed
    pub fn leave(&self, address: &ClusterNodeAddress) {
        let view = {
            let mut view = self.state.view.write();
            if !view.contains(address) {
                return;
            }
            *view = view.iter().filter(|m| *m != address).cloned().collect();
            view.clone()
        };
        self.state
            .subscribers
            .lock()
            .retain(|(subscriber, _)| subscriber.as_ref() != Some(address));

        if self.state.backup_root.is_some() {
            let mut tree = self.state.tree.write();
            let held: Vec<StorePath> = tree
                .writers
                .iter()
                .filter(|(_, writer)| *writer == address)
                .map(|(path, _)| path.clone())
                .collect();
            debug!("Dropping {} primaries held by {}", held.len(), address);
            for path in held {
                tree.nodes.remove(&path);
                tree.writers.remove(&path);
            }
        }

        info!("Member {} left, view {}", address, view);
        self.state
            .broadcast(|_| ClusterEvent::ViewChanged { view: view.clone() });
    }

    pub fn view(&self) -> MembershipView {
        self.state.view.read().clone()
    }
}

/// One member's handle onto a [`LocalGroup`]
#[derive(Clone)]
pub struct LocalMember {
    address: Option<ClusterNodeAddress>,
    state: Arc<GroupState>,
    clustered: bool,
}

impl std::fmt::Debug for LocalMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMember")
            .field("address", &self.address)
            .field("clustered", &self.clustered)
            .finish()
    }
}

impl LocalMember {
    /// A private, non-replicated store running in local mode
    pub fn standalone(address: Option<ClusterNodeAddress>) -> Self {
        Self {
            address,
            state: Arc::new(GroupState::new(None)),
            clustered: false,
        }
    }

    fn record_write(&self, tree: &mut Tree, path: &StorePath, data: NodeData) {
        let (Some(root), Some(address)) = (&self.state.backup_root, &self.address) else {
            return;
        };
        if path.starts_with(root) {
            return;
        }
        tree.writers.insert(path.clone(), address.clone());
        self.state.drop_backups(tree, path);
        tree.nodes
            .insert(root.child(address.path_element()).join(path), data);
    }
}

impl ReplicatedStore for LocalMember {
    fn get_node(&self, path: &StorePath) -> Result<Option<NodeData>> {
        Ok(self.state.tree.read().nodes.get(path).cloned())
    }

    fn put_node(&self, path: &StorePath, data: NodeData) -> Result<Option<NodeData>> {
        let mut tree = self.state.tree.write();
        let previous = tree.nodes.insert(path.clone(), data.clone());
        self.record_write(&mut tree, path, data);
        Ok(previous)
    }

    fn remove_node(&self, path: &StorePath) -> Result<Option<NodeData>> {
        let (removed, paths) = {
            let mut tree = self.state.tree.write();
            let paths: Vec<StorePath> = tree
                .nodes
                .range(path.clone()..)
                .take_while(|(key, _)| key.starts_with(path))
                .map(|(key, _)| key.clone())
                .collect();
            let mut removed = None;
            for key in &paths {
                let data = tree.nodes.remove(key);
                tree.writers.remove(key);
                self.state.drop_backups(&mut tree, key);
                if key == path {
                    removed = data;
                }
            }
            (removed, paths)
        };

        for key in paths.into_iter().filter(|key| !self.state.is_backup(key)) {
            let remover = self.address.clone();
            self.state.broadcast(|subscriber| ClusterEvent::NodeRemoved {
                path: key.clone(),
                origin_local: remover.is_some() && *subscriber == remover,
            });
        }
        Ok(removed)
    }

    fn children_names(&self, path: &StorePath) -> Result<Vec<String>> {
        let tree = self.state.tree.read();
        let depth = path.len();
        let names: BTreeSet<String> = tree
            .nodes
            .range(path.clone()..)
            .take_while(|(key, _)| key.starts_with(path))
            .filter_map(|(key, _)| key.elements().get(depth).cloned())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn put_attribute(&self, path: &StorePath, key: &str, value: Value) -> Result<Option<Value>> {
        let mut tree = self.state.tree.write();
        let node = tree.nodes.entry(path.clone()).or_default();
        let previous = node.insert(key.to_string(), value);
        let data = node.clone();
        self.record_write(&mut tree, path, data);
        Ok(previous)
    }

    fn remove_attribute(&self, path: &StorePath, key: &str) -> Result<Option<Value>> {
        let mut tree = self.state.tree.write();
        let Some(node) = tree.nodes.get_mut(path) else {
            return Ok(None);
        };
        let previous = node.remove(key);
        let data = node.clone();
        if previous.is_some() {
            self.record_write(&mut tree, path, data);
        }
        Ok(previous)
    }

    fn buddy_replication_enabled(&self) -> bool {
        self.state.backup_root.is_some()
    }

    fn force_fetch(&self, path: &StorePath) -> Result<Option<NodeData>> {
        if let Some(data) = self.get_node(path)? {
            return Ok(Some(data));
        }
        if self.state.backup_root.is_none() {
            return Ok(None);
        }

        let mut tree = self.state.tree.write();
        let backup = tree
            .nodes
            .iter()
            .find(|(key, _)| self.state.backup_target(key).as_ref() == Some(path))
            .map(|(_, data)| data.clone());
        let Some(data) = backup else {
            return Ok(None);
        };
        debug!("Gravitating {} from backup", path);
        tree.nodes.insert(path.clone(), data.clone());
        self.record_write(&mut tree, path, data.clone());
        Ok(Some(data))
    }
}

impl GroupMembership for LocalMember {
    fn local_address(&self) -> Option<ClusterNodeAddress> {
        self.address.clone()
    }

    fn current_view(&self) -> MembershipView {
        if self.clustered {
            self.state.view.read().clone()
        } else {
            self.address.iter().cloned().collect()
        }
    }

    fn is_clustered(&self) -> bool {
        self.clustered
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().push((self.address.clone(), tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(key: &str, value: i64) -> NodeData {
        let mut data = NodeData::new();
        data.insert(key.to_string(), Value::from(value));
        data
    }

    #[test]
    fn test_children_and_subtree_removal() {
        let group = LocalGroup::new();
        let a = group.join("a:1".into());
        let base = StorePath::new(["timers"]);

        a.put_node(&base.child("t1"), data("n", 1)).unwrap();
        a.put_node(&base.child("t2"), data("n", 2)).unwrap();
        a.put_node(&base.child("t2").child("inner"), data("n", 3)).unwrap();
        a.put_node(&StorePath::new(["timersx", "t9"]), data("n", 9)).unwrap();

        assert_eq!(a.children_names(&base).unwrap(), vec!["t1", "t2"]);
        assert_eq!(a.children_names(&StorePath::root()).unwrap(), vec!["timers", "timersx"]);

        let removed = a.remove_node(&base.child("t2")).unwrap();
        assert_eq!(removed, Some(data("n", 2)));
        assert!(!a.exists(&base.child("t2").child("inner")).unwrap());
        assert_eq!(a.children_names(&base).unwrap(), vec!["t1"]);
    }

    #[test]
    fn test_attributes_create_nodes() {
        let group = LocalGroup::new();
        let a = group.join("a:1".into());
        let path = StorePath::new(["s", "1"]);

        assert_eq!(a.put_attribute(&path, "k", Value::from(1)).unwrap(), None);
        assert_eq!(a.put_attribute(&path, "k", Value::from(2)).unwrap(), Some(Value::from(1)));
        assert_eq!(a.get_attribute(&path, "k").unwrap(), Some(Value::from(2)));
        assert_eq!(a.remove_attribute(&path, "k").unwrap(), Some(Value::from(2)));
        assert!(a.exists(&path).unwrap());
        assert_eq!(a.remove_attribute(&StorePath::new(["none"]), "k").unwrap(), None);
    }

    #[test]
    fn test_view_changes_and_removal_events() {
        let group = LocalGroup::new();
        let a = group.join("a:1".into());
        let mut events_a = a.subscribe();
        let b = group.join("b:1".into());
        let mut events_b = b.subscribe();

        assert_eq!(
            events_a.try_recv().unwrap(),
            ClusterEvent::ViewChanged { view: group.view() }
        );

        let path = StorePath::new(["timers", "t1"]);
        a.put_node(&path, data("n", 1)).unwrap();
        a.remove_node(&path).unwrap();
        assert_eq!(
            events_a.try_recv().unwrap(),
            ClusterEvent::NodeRemoved { path: path.clone(), origin_local: true }
        );
        assert_eq!(
            events_b.try_recv().unwrap(),
            ClusterEvent::NodeRemoved { path, origin_local: false }
        );

        group.leave(&"a:1".into());
        assert_eq!(
            events_b.try_recv().unwrap(),
            ClusterEvent::ViewChanged { view: MembershipView::new(vec!["b:1".into()]) }
        );
        assert!(events_a.try_recv().is_err());
    }

    #[test]
    fn test_buddy_backup_survives_leave_and_gravitates() {
        let root = StorePath::new(["_BUDDY_BACKUP_"]);
        let group = LocalGroup::with_buddy_replication(root.clone());
        let a = group.join("10.0.0.1:7800".into());
        let b = group.join("10.0.0.2:7800".into());
        assert!(b.buddy_replication_enabled());

        let path = StorePath::new(["timers", "t1"]);
        a.put_node(&path, data("n", 1)).unwrap();
        let backup = root.child("10.0.0.1_7800").join(&path);
        assert!(b.exists(&backup).unwrap());

        group.leave(&"10.0.0.1:7800".into());
        assert!(!b.exists(&path).unwrap());
        assert_eq!(
            b.children_names(&root.child("10.0.0.1_7800").child("timers")).unwrap(),
            vec!["t1"]
        );

        assert_eq!(b.force_fetch(&path).unwrap(), Some(data("n", 1)));
        assert!(b.exists(&path).unwrap());
        assert!(!b.exists(&backup).unwrap());
        assert!(b.exists(&root.child("10.0.0.2_7800").join(&path)).unwrap());
        assert_eq!(b.force_fetch(&StorePath::new(["timers", "missing"])).unwrap(), None);
    }

    #[test]
    fn test_standalone_member_is_local_mode() {
        let member = LocalMember::standalone(Some("solo:1".into()));
        assert!(!member.is_clustered());
        assert_eq!(member.current_view(), MembershipView::new(vec!["solo:1".into()]));
        assert!(!member.buddy_replication_enabled());

        let anonymous = LocalMember::standalone(None);
        assert!(anonymous.current_view().is_empty());
        assert_eq!(anonymous.local_address(), None);
    }
}
