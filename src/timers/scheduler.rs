//! Fault-Tolerant Scheduler Implementation
//!
//! Handles:
//! - Transactionally gated schedule and cancel
//! - Local arming of one-shot, fixed-rate and fixed-delay timers
//! - Recovery of timers inherited through failover

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::data::{now_millis, PeriodicScheduleStrategy, TaskId, TimerTaskData, TASK_DATA_ATTRIBUTE};
use super::listener::{TimerDataRemovalListener, TimerFailOverListener};
use super::task::{ActionState, PendingAction, RunningTask, TimerTask, TimerTaskFactory};
use crate::cluster::ownership::{restore_node, restore_on_rollback, OWNER_ATTRIBUTE};
use crate::cluster::{ClientLocalListenerElector, ClusteredOwnershipRecord, DefaultCluster};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::store::{NodeData, ReplicatedStore, StorePath};
use crate::transaction::{Transaction, TransactionalGate};

pub(crate) struct SchedulerInner {
    name: String,
    base_path: StorePath,
    config: SchedulerConfig,
    cluster: Arc<DefaultCluster>,
    store: Arc<dyn ReplicatedStore>,
    factory: Arc<dyn TimerTaskFactory>,
    runtime: Handle,
    local_running_tasks: DashMap<TaskId, RunningTask>,
    generations: AtomicU64,
    shut_down: AtomicBool,
}

/// Schedules timers whose state lives in the replicated store, so they
/// survive the loss of the member running them.
///
/// Cheap to clone; clones share the same local task table.
#[derive(Clone)]
pub struct FaultTolerantScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for FaultTolerantScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultTolerantScheduler")
            .field("name", &self.inner.name)
            .field("local_tasks", &self.inner.local_running_tasks.len())
            .finish()
    }
}

impl FaultTolerantScheduler {
    /// Creates the scheduler and registers its failover and data-removal
    /// listeners on `/<name>` with `cluster`.
    pub fn new(
        config: SchedulerConfig,
        cluster: Arc<DefaultCluster>,
        factory: Arc<dyn TimerTaskFactory>,
        elector: Option<Arc<dyn ClientLocalListenerElector>>,
        runtime: Handle,
    ) -> Result<Self> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(SchedError::Config(format!(
                "Invalid scheduler name: {:?}",
                config.name
            )));
        }

        let base_path = StorePath::new([config.name.clone()]);
        let inner = Arc::new(SchedulerInner {
            name: config.name.clone(),
            base_path: base_path.clone(),
            store: cluster.store().clone(),
            cluster: cluster.clone(),
            factory,
            runtime,
            local_running_tasks: DashMap::new(),
            generations: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config,
        });

        let fail_over = TimerFailOverListener::new(
            base_path.clone(),
            inner.config.priority,
            elector,
            Arc::downgrade(&inner),
        );
        if !cluster.add_fail_over_listener(Arc::new(fail_over)) {
            return Err(SchedError::cluster(format!(
                "A resource group is already registered on {}",
                base_path
            )));
        }
        let removal = TimerDataRemovalListener::new(base_path.clone(), Arc::downgrade(&inner));
        if !cluster.add_data_removal_listener(Arc::new(removal)) {
            cluster.remove_fail_over_listener(&base_path);
            return Err(SchedError::cluster(format!(
                "A data removal listener is already registered on {}",
                base_path
            )));
        }

        info!("Fault tolerant scheduler {} started", inner.name);
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn base_path(&self) -> &StorePath {
        &self.inner.base_path
    }

    pub fn cluster(&self) -> &Arc<DefaultCluster> {
        &self.inner.cluster
    }

    /// Stores the timer's data and arms it once `tx` commits, or right away
    /// without a transaction. Rolling back undoes the store write.
    pub fn schedule(
        &self,
        data: TimerTaskData,
        task: Arc<dyn TimerTask>,
        tx: Option<&dyn Transaction>,
    ) -> Result<()> {
        if data.period == 0 {
            return Err(SchedError::InvalidTask(format!(
                "Task {} has a zero period",
                data.task_id
            )));
        }
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedError::scheduling(format!(
                "Scheduler {} is shut down",
                self.inner.name
            )));
        }

        let task_id = data.task_id.clone();
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let pending = tx.map(|tx| Arc::new(PendingAction::new(tx.id())));

        match self.inner.local_running_tasks.entry(task_id.clone()) {
            Entry::Occupied(_) => return Err(SchedError::AlreadyScheduled(task_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(RunningTask {
                    generation,
                    data: data.clone(),
                    task,
                    pending: pending.clone(),
                    handle: None,
                });
            }
        }

        let path = self.inner.task_path(&task_id);
        let previous = match self.inner.write_record(&path, &data) {
            Ok(previous) => previous,
            Err(e) => {
                self.inner.forget(&task_id, generation);
                return Err(e);
            }
        };
        debug!("Scheduling task {} (tx: {:?})", task_id, tx.map(|tx| tx.id()));

        let on_commit = {
            let inner = Arc::downgrade(&self.inner);
            let pending = pending.clone();
            let task_id = task_id.clone();
            move || {
                if let Some(pending) = &pending {
                    if !pending.transition(ActionState::Committed) {
                        debug!("Schedule of {} was {:?} before commit", task_id, pending.state());
                        return;
                    }
                }
                if let Some(inner) = inner.upgrade() {
                    inner.arm(&task_id, generation);
                }
            }
        };
        let on_rollback = {
            let inner = Arc::downgrade(&self.inner);
            let store = self.inner.store.clone();
            let path = path.clone();
            let previous = previous.clone();
            let task_id = task_id.clone();
            move || {
                if let Some(pending) = &pending {
                    pending.transition(ActionState::RolledBack);
                }
                if let Some(inner) = inner.upgrade() {
                    inner.forget(&task_id, generation);
                }
                restore_node(store.as_ref(), &path, previous);
            }
        };

        let submitted = TransactionalGate::new()
            .on_commit(on_commit)
            .on_rollback(on_rollback)
            .submit(tx);
        if let Err(e) = submitted {
            self.inner.forget(&task_id, generation);
            restore_node(self.inner.store.as_ref(), &path, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Cancels a timer cluster-wide.
    ///
    /// A schedule still waiting on its transaction is canceled in place and
    /// never arms. An armed task is disarmed when `tx` commits. On a member
    /// not running the task only the replicated record is removed, once
    /// `tx` commits; the owner disarms when it sees the removal. Returns false if the task
    /// is unknown both locally and in the store.
    pub fn cancel(&self, task_id: &TaskId, tx: Option<&dyn Transaction>) -> Result<bool> {
        let path = self.inner.task_path(task_id);
        let local = self
            .inner
            .local_running_tasks
            .get(task_id)
            .map(|running| (running.generation, running.pending.clone()));

        let Some((generation, pending)) = local else {
            if !self.inner.store.exists(&path)? {
                return Ok(false);
            }
            debug!("Canceling task {} owned elsewhere", task_id);
            // The owner disarms as soon as it sees the removal, so it must not
            // become visible before the transaction commits
            let store = self.inner.store.clone();
            let task_id = task_id.clone();
            TransactionalGate::new()
                .on_commit(move || {
                    if let Err(e) = store.remove_node(&path) {
                        error!("Failed to remove record of canceled task {}: {}", task_id, e);
                    }
                })
                .submit(tx)?;
            return Ok(true);
        };

        if let Some(pending) = pending.filter(|p| p.transition(ActionState::Canceled)) {
            debug!("Canceling task {} before its schedule committed", task_id);
            self.inner.forget(task_id, generation);
            let removed = self.inner.store.remove_node(&path)?;
            // Within the scheduling transaction its own rollback restores the record
            if tx.map(|tx| tx.id()) != Some(pending.tx_id()) {
                restore_on_rollback(self.inner.store.clone(), path, removed, tx)?;
            }
            return Ok(true);
        }

        debug!("Canceling armed task {}", task_id);
        let removed = self.inner.store.remove_node(&path)?;
        restore_on_rollback(self.inner.store.clone(), path, removed, tx)?;
        let inner = Arc::downgrade(&self.inner);
        let task_id = task_id.clone();
        TransactionalGate::new()
            .on_commit(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.disarm(&task_id, Some(generation));
                }
            })
            .submit(tx)?;
        Ok(true)
    }

    /// Re-arms a timer inherited from a lost member
    pub fn recover(&self, data: TimerTaskData, tx: Option<&dyn Transaction>) -> Result<()> {
        let Some(task) = self.inner.factory.new_task(&data) else {
            return Err(SchedError::InvalidTask(format!(
                "No task could be built for {}",
                data.task_id
            )));
        };
        let mut data = data;
        task.before_recover(&mut data);
        info!("Recovering task {} starting at {}", data.task_id, data.start_time);
        self.schedule(data, task, tx)
    }

    /// Re-arms timers the store says this member owns but that are not
    /// running locally, e.g. after a restart under the same address.
    pub fn recover_local(&self) -> Result<usize> {
        let Some(local) = self.inner.cluster.local_address() else {
            return Ok(0);
        };

        let mut recovered = 0;
        for child in self.inner.store.children_names(&self.inner.base_path)? {
            let task_id = TaskId::new(child.clone());
            if self.inner.local_running_tasks.contains_key(&task_id) {
                continue;
            }
            let record = ClusteredOwnershipRecord::new(
                self.inner.base_path.child(child),
                self.inner.store.clone(),
            );
            if record.owner()?.as_ref() != Some(&local) {
                continue;
            }
            let Some(data) = read_task_data(&record)? else {
                warn!("Record {} has no task data", record.path());
                continue;
            };
            match self.recover(data, None) {
                Ok(()) => recovered += 1,
                Err(e) => error!("Failed to recover task {}: {}", task_id, e),
            }
        }
        info!("Recovered {} local tasks for {}", recovered, self.inner.name);
        Ok(recovered)
    }

    /// Ids of every task held locally, armed or awaiting commit
    pub fn local_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .inner
            .local_running_tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_local(&self, task_id: &TaskId) -> bool {
        self.inner.local_running_tasks.contains_key(task_id)
    }

    /// Whether the task is armed in the local pool
    pub fn is_armed(&self, task_id: &TaskId) -> bool {
        self.inner
            .local_running_tasks
            .get(task_id)
            .is_some_and(|running| running.handle.is_some())
    }

    pub fn local_task_data(&self, task_id: &TaskId) -> Option<TimerTaskData> {
        self.inner
            .local_running_tasks
            .get(task_id)
            .map(|running| running.data.clone())
    }

    /// Disarms every local task and unregisters from the cluster. Replicated
    /// records stay untouched so another member can inherit them.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = self.local_task_ids();
        for task_id in &ids {
            self.inner.disarm(task_id, None);
        }
        self.inner.cluster.remove_fail_over_listener(&self.inner.base_path);
        self.inner.cluster.remove_data_removal_listener(&self.inner.base_path);
        info!("Scheduler {} shut down, disarmed {} tasks", self.inner.name, ids.len());
    }
}

impl SchedulerInner {
    fn task_path(&self, task_id: &TaskId) -> StorePath {
        self.base_path.child(task_id.as_str())
    }

    fn write_record(&self, path: &StorePath, data: &TimerTaskData) -> Result<Option<NodeData>> {
        let owner = match self.cluster.local_address() {
            Some(local) => Value::String(local.to_string()),
            None => Value::Null,
        };
        let mut node = NodeData::new();
        node.insert(OWNER_ATTRIBUTE.to_string(), owner);
        node.insert(TASK_DATA_ATTRIBUTE.to_string(), serde_json::to_value(data)?);
        self.store.put_node(path, node)
    }

    /// Drops the local entry if it still belongs to `generation`
    fn forget(&self, task_id: &TaskId, generation: u64) -> bool {
        self.local_running_tasks
            .remove_if(task_id, |_, running| running.generation == generation)
            .is_some()
    }

    /// Removes the local entry and stops its timer without touching the store
    pub(crate) fn disarm(&self, task_id: &TaskId, generation: Option<u64>) -> bool {
        let removed = match generation {
            Some(generation) => self
                .local_running_tasks
                .remove_if(task_id, |_, running| running.generation == generation),
            None => self.local_running_tasks.remove(task_id),
        };
        match removed {
            Some((_, running)) => {
                running.disarm();
                debug!("Disarmed task {}", task_id);
                true
            }
            None => false,
        }
    }

    fn arm(self: &Arc<Self>, task_id: &TaskId, generation: u64) {
        if let Err(e) = self.try_arm(task_id, generation) {
            error!("Failed to arm task {}: {}", task_id, e);
            if self.forget(task_id, generation) {
                if let Err(e) = self.store.remove_node(&self.task_path(task_id)) {
                    error!("Failed to remove record of task {}: {}", task_id, e);
                }
            }
        }
    }

    fn try_arm(self: &Arc<Self>, task_id: &TaskId, generation: u64) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedError::scheduling(format!("Scheduler {} is shut down", self.name)));
        }
        let limit = self.config.max_armed_tasks;
        if limit > 0 {
            let armed = self
                .local_running_tasks
                .iter()
                .filter(|entry| entry.handle.is_some())
                .count();
            if armed >= limit {
                return Err(SchedError::scheduling(format!(
                    "{} tasks already armed, limit is {}",
                    armed, limit
                )));
            }
        }

        let Some(mut running) = self.local_running_tasks.get_mut(task_id) else {
            debug!("Task {} vanished before arming", task_id);
            return Ok(());
        };
        if running.generation != generation {
            return Ok(());
        }

        let timer = Self::run_timer(
            Arc::downgrade(self),
            task_id.clone(),
            generation,
            running.data.clone(),
            running.task.clone(),
        );
        let handle = self.runtime.spawn(timer);
        running.handle = Some(handle.abort_handle());
        running.pending = None;
        debug!("Armed task {}", task_id);
        Ok(())
    }

    async fn run_timer(
        inner: Weak<Self>,
        task_id: TaskId,
        generation: u64,
        data: TimerTaskData,
        task: Arc<dyn TimerTask>,
    ) {
        let delay = data.delay_from(now_millis());
        let Some(period) = data.period_duration() else {
            tokio::time::sleep(delay).await;
            if Self::execute(&inner, &task, &data).await {
                if let Some(inner) = inner.upgrade() {
                    inner.complete_one_shot(&task_id, generation);
                }
            }
            return;
        };

        match data.periodic_schedule_strategy {
            PeriodicScheduleStrategy::FixedRate => {
                let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
                loop {
                    ticker.tick().await;
                    if !Self::execute(&inner, &task, &data).await {
                        break;
                    }
                }
            }
            PeriodicScheduleStrategy::FixedDelay => {
                tokio::time::sleep(delay).await;
                while Self::execute(&inner, &task, &data).await {
                    tokio::time::sleep(period).await;
                }
            }
        }
    }

    /// Runs one execution on the blocking pool; false once the scheduler is gone
    async fn execute(inner: &Weak<Self>, task: &Arc<dyn TimerTask>, data: &TimerTaskData) -> bool {
        let Some(inner) = inner.upgrade() else {
            return false;
        };
        let scheduler = FaultTolerantScheduler { inner };
        let task = task.clone();
        let data = data.clone();
        let task_id = data.task_id.clone();

        match tokio::task::spawn_blocking(move || task.run(&data, &scheduler)).await {
            Ok(()) => true,
            Err(e) if e.is_panic() => {
                error!("Task {} panicked: {}", task_id, e);
                true
            }
            Err(e) => {
                debug!("Execution of task {} aborted: {}", task_id, e);
                false
            }
        }
    }

    fn complete_one_shot(&self, task_id: &TaskId, generation: u64) {
        if !self.forget(task_id, generation) {
            return;
        }
        if let Err(e) = self.store.remove_node(&self.task_path(task_id)) {
            error!("Failed to remove record of fired task {}: {}", task_id, e);
        }
    }

    pub(crate) fn won_ownership(
        self: &Arc<Self>,
        record: &ClusteredOwnershipRecord,
        tx: Option<&dyn Transaction>,
    ) -> Result<()> {
        let Some(data) = read_task_data(record)? else {
            warn!("Won ownership of {} but it holds no task data", record.path());
            return Ok(());
        };
        let scheduler = FaultTolerantScheduler { inner: self.clone() };
        match scheduler.recover(data, tx) {
            Err(SchedError::AlreadyScheduled(task_id)) => {
                debug!("Task {} is already running locally", task_id);
                Ok(())
            }
            other => other,
        }
    }
}

fn read_task_data(record: &ClusteredOwnershipRecord) -> Result<Option<TimerTaskData>> {
    match record.get(TASK_DATA_ATTRIBUTE)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
