//! Failover election.
//!
//! Election is a deterministic pick over an already-agreed view: every
//! member that observes the same view computes the same winner without
//! exchanging messages.

use fnv::FnvHasher;
use std::hash::Hasher;

use crate::cluster::ownership::ClusteredOwnershipRecord;
use crate::cluster::types::{ClusterNodeAddress, MembershipView};
use crate::error::{Result, SchedError};

pub const DEFAULT_ELECTOR_SHIFT: i64 = 5;

/// Picks the member that inherits work carrying no entry-specific data
pub trait FailoverElector: Send + Sync {
    fn elect(&self, view: &MembershipView) -> Result<ClusterNodeAddress>;
}

/// Per-entry elector a resource group may supply to spread recovered
/// entries across the survivors, weighting the decision by record content.
pub trait ClientLocalListenerElector: Send + Sync {
    fn elect(
        &self,
        view: &MembershipView,
        record: &ClusteredOwnershipRecord,
    ) -> Result<ClusterNodeAddress>;
}

/// Picks `view[(shift mod n + n) mod n]`, a stable rotation away from the head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftElector {
    shift: i64,
}

impl ShiftElector {
    pub fn new(shift: i64) -> Self {
        Self { shift }
    }

    pub fn shift(&self) -> i64 {
        self.shift
    }
}

impl Default for ShiftElector {
    fn default() -> Self {
        Self::new(DEFAULT_ELECTOR_SHIFT)
    }
}

impl FailoverElector for ShiftElector {
    fn elect(&self, view: &MembershipView) -> Result<ClusterNodeAddress> {
        if view.is_empty() {
            return Err(SchedError::EmptyView);
        }
        let size = view.len() as i64;
        let index = ((self.shift % size) + size) % size;
        view.get(index as usize).cloned().ok_or(SchedError::EmptyView)
    }
}

/// Spreads entries by hashing the entry id over the view.
///
/// Uses FNV so every member, whatever its build, maps an id to the same index.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryHashElector;

impl EntryHashElector {
    fn hash(key: &str) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        hasher.finish()
    }
}

impl ClientLocalListenerElector for EntryHashElector {
    fn elect(
        &self,
        view: &MembershipView,
        record: &ClusteredOwnershipRecord,
    ) -> Result<ClusterNodeAddress> {
        if view.is_empty() {
            return Err(SchedError::EmptyView);
        }
        let key = record.entry_id().unwrap_or_default();
        let index = Self::hash(&key) % view.len() as u64;
        view.get(index as usize).cloned().ok_or(SchedError::EmptyView)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn view(members: &[&str]) -> MembershipView {
        members.iter().map(|m| ClusterNodeAddress::from(*m)).collect()
    }

    #[test]
    fn test_default_shift_picks_third_of_three() {
        let elector = ShiftElector::default();
        assert_eq!(elector.elect(&view(&["A", "B", "C"])).unwrap(), "C".into());
    }

    #[test]
    fn test_negative_shift_wraps() {
        let elector = ShiftElector::new(-1);
        assert_eq!(elector.elect(&view(&["A", "B", "C"])).unwrap(), "C".into());
        let elector = ShiftElector::new(-7);
        assert_eq!(elector.elect(&view(&["A", "B", "C"])).unwrap(), "C".into());
    }

    #[test]
    fn test_single_member_always_elected() {
        let elector = ShiftElector::default();
        assert_eq!(elector.elect(&view(&["solo"])).unwrap(), "solo".into());
    }

    #[test]
    fn test_empty_view_fails_fast() {
        assert_eq!(
            ShiftElector::default().elect(&MembershipView::default()),
            Err(SchedError::EmptyView)
        );
    }

    #[test]
    fn test_entry_hash_is_stable_fnv() {
        // FNV-1a 64 of "a"
        assert_eq!(EntryHashElector::hash("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(EntryHashElector::hash(""), 0xcbf29ce484222325);
    }

    proptest! {
        #[test]
        fn prop_election_is_deterministic(
            shift in any::<i64>(),
            members in prop::collection::vec("[a-z]{1,8}:[0-9]{2,5}", 1..12),
        ) {
            let v: MembershipView = members.iter().map(|m| ClusterNodeAddress::new(m.clone())).collect();
            let first = ShiftElector::new(shift).elect(&v).unwrap();
            let again = ShiftElector::new(shift).elect(&v).unwrap();
            prop_assert_eq!(&first, &again);
            prop_assert!(v.contains(&first));
        }
    }
}
