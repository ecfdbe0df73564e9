//! Cluster Membership Types
//!
//! Core types shared by the cluster layer:
//! - Node identification
//! - Ordered membership views
//! - Events delivered by the group-communication layer

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::StorePath;

/// Identity of a cluster member, as handed out by the group-communication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterNodeAddress(String);

impl ClusterNodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address rendered as a single store path element (`host:port` -> `host_port`)
    pub fn path_element(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for ClusterNodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterNodeAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Agreed, ordered snapshot of the live members.
///
/// Ordering comes from the group-communication layer and is assumed to be
/// identical on every member observing the same view. The first member is
/// the head.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipView(Vec<ClusterNodeAddress>);

impl MembershipView {
    pub fn new(members: Vec<ClusterNodeAddress>) -> Self {
        Self(members)
    }

    pub fn members(&self) -> &[ClusterNodeAddress] {
        &self.0
    }

    pub fn head(&self) -> Option<&ClusterNodeAddress> {
        self.0.first()
    }

    pub fn get(&self, index: usize) -> Option<&ClusterNodeAddress> {
        self.0.get(index)
    }

    pub fn contains(&self, address: &ClusterNodeAddress) -> bool {
        self.0.contains(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterNodeAddress> {
        self.0.iter()
    }

    /// Members of `previous` that are no longer part of this view, in `previous` order
    pub fn lost_since(&self, previous: &MembershipView) -> Vec<ClusterNodeAddress> {
        previous
            .iter()
            .filter(|member| !self.contains(member))
            .cloned()
            .collect()
    }
}

impl FromIterator<ClusterNodeAddress> for MembershipView {
    fn from_iter<T: IntoIterator<Item = ClusterNodeAddress>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, member) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, "]")
    }
}

/// Notifications delivered by the group-communication layer and the store
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// A new membership view was installed
    ViewChanged { view: MembershipView },
    /// A node was removed from the replicated store
    NodeRemoved { path: StorePath, origin_local: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(members: &[&str]) -> MembershipView {
        members.iter().map(|m| ClusterNodeAddress::from(*m)).collect()
    }

    #[test]
    fn test_lost_members() {
        let old = view(&["a", "b", "c", "d"]);
        let new = view(&["a", "c", "e"]);
        assert_eq!(
            new.lost_since(&old),
            vec![ClusterNodeAddress::from("b"), ClusterNodeAddress::from("d")]
        );
        assert!(old.lost_since(&old).is_empty());
    }

    #[test]
    fn test_head_and_path_element() {
        let v = view(&["10.0.0.1:7800", "10.0.0.2:7800"]);
        assert_eq!(v.head().map(|a| a.as_str()), Some("10.0.0.1:7800"));
        assert_eq!(v.members()[1].path_element(), "10.0.0.2_7800");
        assert_eq!(v.to_string(), "[10.0.0.1:7800, 10.0.0.2:7800]");
        assert!(MembershipView::default().head().is_none());
    }
}
