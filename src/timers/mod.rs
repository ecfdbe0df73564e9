//! Fault-tolerant timers.
//!
//! A timer's [`TimerTaskData`] is stored under `/<scheduler-name>/<task-id>`
//! together with the address of the member running it. When that member
//! leaves, the elected survivor rebuilds the task through its
//! [`TimerTaskFactory`] and re-arms it.

pub mod data;
mod listener;
pub mod scheduler;
pub mod task;

pub use data::{now_millis, PeriodicScheduleStrategy, TaskId, TimerTaskData, TASK_DATA_ATTRIBUTE};
pub use scheduler::FaultTolerantScheduler;
pub use task::{task_fn, ActionState, FnTask, TimerTask, TimerTaskFactory};
