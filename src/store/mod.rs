//! Replicated Store Interface
//!
//! The hierarchical, replicated key-value store the cluster layer sits on:
//! - Path-addressed nodes holding attribute maps
//! - Child enumeration under a namespace
//! - Buddy backup layout and forced fetch (data gravitation)

pub mod local;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SchedError};

pub use local::{LocalGroup, LocalMember};

const SEPARATOR: char = '/';

/// Attributes stored on a single node of the tree
pub type NodeData = BTreeMap<String, Value>;

/// Absolute path of a node in the replicated tree, e.g. `/timers/42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(elements.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(name.into());
        Self(elements)
    }

    /// Appends every element of `other` below this path
    pub fn join(&self, other: &StorePath) -> Self {
        let mut elements = self.0.clone();
        elements.extend(other.0.iter().cloned());
        Self(elements)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn elements(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn is_child_of(&self, parent: &StorePath) -> bool {
        self.0.len() == parent.0.len() + 1 && self.starts_with(parent)
    }

    /// Path relative to `prefix`, if this path lives below it
    pub fn strip_prefix(&self, prefix: &StorePath) -> Option<Self> {
        if self.starts_with(prefix) {
            Some(Self(self.0[prefix.0.len()..].to_vec()))
        } else {
            None
        }
    }
}

impl FromStr for StorePath {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with(SEPARATOR) {
            return Err(SchedError::store(format!("Path must be absolute: {}", s)));
        }
        Ok(Self(
            s.split(SEPARATOR)
                .filter(|element| !element.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for element in &self.0 {
            write!(f, "{}{}", SEPARATOR, element)?;
        }
        Ok(())
    }
}

/// Replicated hierarchical store shared by every cluster member.
///
/// Implementations are expected to bound each call with their own
/// timeout discipline and surface failures as [`SchedError::Store`].
pub trait ReplicatedStore: Send + Sync {
    fn get_node(&self, path: &StorePath) -> Result<Option<NodeData>>;

    /// Replaces the node's attributes, returning the previous ones
    fn put_node(&self, path: &StorePath, data: NodeData) -> Result<Option<NodeData>>;

    /// Removes the node and its subtree, returning the removed node's attributes
    fn remove_node(&self, path: &StorePath) -> Result<Option<NodeData>>;

    fn children_names(&self, path: &StorePath) -> Result<Vec<String>>;

    /// Sets one attribute, creating the node if needed, and returns the previous value
    fn put_attribute(&self, path: &StorePath, key: &str, value: Value) -> Result<Option<Value>>;

    fn remove_attribute(&self, path: &StorePath, key: &str) -> Result<Option<Value>>;

    fn get_attribute(&self, path: &StorePath, key: &str) -> Result<Option<Value>> {
        Ok(self.get_node(path)?.and_then(|mut data| data.remove(key)))
    }

    fn exists(&self, path: &StorePath) -> Result<bool> {
        Ok(self.get_node(path)?.is_some())
    }

    /// Whether entries are backed by a buddy replica that may need fetching
    fn buddy_replication_enabled(&self) -> bool {
        false
    }

    /// Reads a node, forcing any backup replica to be materialized locally
    fn force_fetch(&self, path: &StorePath) -> Result<Option<NodeData>> {
        self.get_node(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parsing_and_display() {
        let path: StorePath = "/timers/task-1".parse().unwrap();
        assert_eq!(path.elements(), &["timers".to_string(), "task-1".to_string()]);
        assert_eq!(path.to_string(), "/timers/task-1");
        assert_eq!(StorePath::root().to_string(), "/");
        assert_eq!("//a//b/".parse::<StorePath>().unwrap(), StorePath::new(["a", "b"]));
        assert!("relative/path".parse::<StorePath>().is_err());
    }

    #[test]
    fn test_path_relations() {
        let base = StorePath::new(["timers"]);
        let entry = base.child("7");
        assert!(entry.is_child_of(&base));
        assert!(!entry.child("x").is_child_of(&base));
        assert_eq!(entry.parent(), Some(base.clone()));
        assert_eq!(entry.last(), Some("7"));
        assert_eq!(StorePath::root().parent(), None);

        let backup = StorePath::new(["_BUDDY_BACKUP_", "10.0.0.1_7800"]).join(&entry);
        assert_eq!(backup.to_string(), "/_BUDDY_BACKUP_/10.0.0.1_7800/timers/7");
        assert_eq!(
            backup.strip_prefix(&StorePath::new(["_BUDDY_BACKUP_", "10.0.0.1_7800"])),
            Some(entry)
        );
    }
}
