//! Scheduler Cluster Listeners
//!
//! Handles:
//! - Recovering timers won through failover
//! - Disarming timers whose record was removed on another member

use std::sync::{Arc, Weak};
use tracing::debug;

use super::data::TaskId;
use super::scheduler::SchedulerInner;
use crate::cluster::{
    ClientLocalListenerElector, ClusterNodeAddress, ClusteredOwnershipRecord, DataRemovalListener,
    FailOverListener,
};
use crate::error::{Result, SchedError};
use crate::store::StorePath;
use crate::transaction::Transaction;

/// Resource group covering a scheduler's timer namespace
pub(crate) struct TimerFailOverListener {
    base_path: StorePath,
    priority: i32,
    elector: Option<Arc<dyn ClientLocalListenerElector>>,
    scheduler: Weak<SchedulerInner>,
}

impl TimerFailOverListener {
    pub(crate) fn new(
        base_path: StorePath,
        priority: i32,
        elector: Option<Arc<dyn ClientLocalListenerElector>>,
        scheduler: Weak<SchedulerInner>,
    ) -> Self {
        Self {
            base_path,
            priority,
            elector,
            scheduler,
        }
    }
}

impl FailOverListener for TimerFailOverListener {
    fn base_path(&self) -> &StorePath {
        &self.base_path
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn elector(&self) -> Option<&dyn ClientLocalListenerElector> {
        self.elector.as_deref()
    }

    fn fail_over_cluster_member(
        &self,
        lost: &ClusterNodeAddress,
        _tx: Option<&dyn Transaction>,
    ) -> Result<()> {
        debug!("Taking over timers of {} under {}", lost, self.base_path);
        Ok(())
    }

    fn won_ownership(
        &self,
        record: &ClusteredOwnershipRecord,
        tx: Option<&dyn Transaction>,
    ) -> Result<()> {
        let scheduler = self.scheduler.upgrade().ok_or_else(|| {
            SchedError::cluster(format!("Scheduler for {} was dropped", self.base_path))
        })?;
        scheduler.won_ownership(record, tx)
    }
}

/// Disarms local timers whose records another member removed
pub(crate) struct TimerDataRemovalListener {
    base_path: StorePath,
    scheduler: Weak<SchedulerInner>,
}

impl TimerDataRemovalListener {
    pub(crate) fn new(base_path: StorePath, scheduler: Weak<SchedulerInner>) -> Self {
        Self {
            base_path,
            scheduler,
        }
    }
}

impl DataRemovalListener for TimerDataRemovalListener {
    fn base_path(&self) -> &StorePath {
        &self.base_path
    }

    fn data_removed(&self, path: &StorePath) {
        let (Some(scheduler), Some(id)) = (self.scheduler.upgrade(), path.last()) else {
            return;
        };
        if scheduler.disarm(&TaskId::new(id), None) {
            debug!("Task {} canceled remotely", id);
        }
    }
}
