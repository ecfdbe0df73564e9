//! Timer Task Behavior
//!
//! Handles:
//! - The application-supplied task contract and its factory
//! - Pending schedule state, settled by the transaction outcome
//! - Locally armed task bookkeeping

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::AbortHandle;

use super::data::{now_millis, TimerTaskData};
use super::scheduler::FaultTolerantScheduler;

/// Application behavior of a timer.
///
/// A task never holds on to its scheduler; the scheduler running it is
/// passed in on every invocation.
pub trait TimerTask: Send + Sync + 'static {
    fn run(&self, data: &TimerTaskData, scheduler: &FaultTolerantScheduler);

    /// Adjusts replicated data before a new owner re-arms the timer
    fn before_recover(&self, data: &mut TimerTaskData) {
        data.correct_start_time(now_millis());
    }
}

/// Rebuilds task behavior from replicated data on the member that inherits it
pub trait TimerTaskFactory: Send + Sync {
    fn new_task(&self, data: &TimerTaskData) -> Option<Arc<dyn TimerTask>>;
}

/// A [`TimerTask`] backed by a closure
pub struct FnTask<F>(F);

impl<F> TimerTask for FnTask<F>
where
    F: Fn(&TimerTaskData, &FaultTolerantScheduler) + Send + Sync + 'static,
{
    fn run(&self, data: &TimerTaskData, scheduler: &FaultTolerantScheduler) {
        (self.0)(data, scheduler)
    }
}

pub fn task_fn<F>(f: F) -> Arc<dyn TimerTask>
where
    F: Fn(&TimerTaskData, &FaultTolerantScheduler) + Send + Sync + 'static,
{
    Arc::new(FnTask(f))
}

impl<F> TimerTaskFactory for F
where
    F: Fn(&TimerTaskData) -> Option<Arc<dyn TimerTask>> + Send + Sync,
{
    fn new_task(&self, data: &TimerTaskData) -> Option<Arc<dyn TimerTask>> {
        self(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Committed,
    RolledBack,
    Canceled,
}

/// Deferred arming of a schedule made inside a transaction
#[derive(Debug)]
pub(crate) struct PendingAction {
    tx_id: u64,
    state: Mutex<ActionState>,
}

impl PendingAction {
    pub(crate) fn new(tx_id: u64) -> Self {
        Self {
            tx_id,
            state: Mutex::new(ActionState::Pending),
        }
    }

    pub(crate) fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub(crate) fn state(&self) -> ActionState {
        *self.state.lock()
    }

    /// Moves out of `Pending`; any other transition is refused
    pub(crate) fn transition(&self, to: ActionState) -> bool {
        let mut state = self.state.lock();
        if *state != ActionState::Pending || to == ActionState::Pending {
            return false;
        }
        *state = to;
        true
    }
}

/// Local bookkeeping for a task this member owns
pub(crate) struct RunningTask {
    pub(crate) generation: u64,
    pub(crate) data: TimerTaskData,
    pub(crate) task: Arc<dyn TimerTask>,
    pub(crate) pending: Option<Arc<PendingAction>>,
    pub(crate) handle: Option<AbortHandle>,
}

impl RunningTask {
    pub(crate) fn disarm(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
