//! Clustered Ownership Records
//!
//! Handles:
//! - Reading and writing the owner of a replicated entry
//! - Rollback compensation for speculative record writes

use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use crate::cluster::types::ClusterNodeAddress;
use crate::error::{Result, SchedError};
use crate::store::{NodeData, ReplicatedStore, StorePath};
use crate::transaction::{Transaction, TransactionalGate};

/// Attribute holding the owning member's address
pub const OWNER_ATTRIBUTE: &str = "cluster_node_address";

/// A replicated entry of a resource group, paired with the member that owns it
#[derive(Clone)]
pub struct ClusteredOwnershipRecord {
    path: StorePath,
    store: Arc<dyn ReplicatedStore>,
}

impl std::fmt::Debug for ClusteredOwnershipRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredOwnershipRecord")
            .field("path", &self.path)
            .finish()
    }
}

impl ClusteredOwnershipRecord {
    pub fn new(path: StorePath, store: Arc<dyn ReplicatedStore>) -> Self {
        Self { path, store }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Last element of the path, the id of the entry within its namespace
    pub fn entry_id(&self) -> Option<String> {
        self.path.last().map(str::to_string)
    }

    pub fn exists(&self) -> Result<bool> {
        self.store.exists(&self.path)
    }

    /// Creates the record owned by `owner`; returns false if it already existed
    pub fn create(&self, owner: &ClusterNodeAddress) -> Result<bool> {
        if self.exists()? {
            return Ok(false);
        }
        let mut data = NodeData::new();
        data.insert(OWNER_ATTRIBUTE.to_string(), Value::String(owner.to_string()));
        self.store.put_node(&self.path, data)?;
        Ok(true)
    }

    pub fn owner(&self) -> Result<Option<ClusterNodeAddress>> {
        match self.store.get_attribute(&self.path, OWNER_ATTRIBUTE)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(address)) => Ok(Some(ClusterNodeAddress::new(address))),
            Some(other) => Err(SchedError::store(format!(
                "Malformed owner attribute at {}: {}",
                self.path, other
            ))),
        }
    }

    /// Reassigns ownership; rolled back with `tx` if it does not commit
    pub fn set_owner(&self, owner: &ClusterNodeAddress, tx: Option<&dyn Transaction>) -> Result<()> {
        let previous = self.store.put_attribute(
            &self.path,
            OWNER_ATTRIBUTE,
            Value::String(owner.to_string()),
        )?;
        let store = self.store.clone();
        let path = self.path.clone();
        TransactionalGate::new()
            .on_rollback(move || {
                let restored = match previous {
                    Some(value) => store.put_attribute(&path, OWNER_ATTRIBUTE, value).map(|_| ()),
                    None => store.remove_attribute(&path, OWNER_ATTRIBUTE).map(|_| ()),
                };
                if let Err(e) = restored {
                    error!("Failed to restore owner of {}: {}", path, e);
                }
            })
            .submit(tx)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get_attribute(&self.path, key)
    }

    pub fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.store.put_attribute(&self.path, key, value)
    }

    pub fn snapshot(&self) -> Result<Option<NodeData>> {
        self.store.get_node(&self.path)
    }

    /// Replaces the whole record; the prior state is restored if `tx` rolls back
    pub fn replace(&self, data: NodeData, tx: Option<&dyn Transaction>) -> Result<Option<NodeData>> {
        let previous = self.store.put_node(&self.path, data)?;
        restore_on_rollback(self.store.clone(), self.path.clone(), previous.clone(), tx)?;
        Ok(previous)
    }

    /// Removes the record; it is put back if `tx` rolls back
    pub fn remove(&self, tx: Option<&dyn Transaction>) -> Result<Option<NodeData>> {
        let removed = self.store.remove_node(&self.path)?;
        if removed.is_some() {
            restore_on_rollback(self.store.clone(), self.path.clone(), removed.clone(), tx)?;
        }
        Ok(removed)
    }
}

/// Puts `path` back to `previous` (or removes it) when the transaction rolls back
pub(crate) fn restore_on_rollback(
    store: Arc<dyn ReplicatedStore>,
    path: StorePath,
    previous: Option<NodeData>,
    tx: Option<&dyn Transaction>,
) -> Result<()> {
    if tx.is_none() {
        return Ok(());
    }
    TransactionalGate::new()
        .on_rollback(move || restore_node(store.as_ref(), &path, previous))
        .submit(tx)
}

pub(crate) fn restore_node(store: &dyn ReplicatedStore, path: &StorePath, previous: Option<NodeData>) {
    let restored = match previous {
        Some(data) => store.put_node(path, data).map(|_| ()),
        None => store.remove_node(path).map(|_| ()),
    };
    if let Err(e) = restored {
        error!("Failed to restore {}: {}", path, e);
    }
}
