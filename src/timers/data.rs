//! Timer Task Data
//!
//! Handles:
//! - Task identifiers
//! - The replicated description of a scheduled timer
//! - Start-time correction on recovery

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::time::Duration;
use uuid::Uuid;

/// Attribute of a timer record holding its serialized [`TimerTaskData`]
pub const TASK_DATA_ATTRIBUTE: &str = "task_data";

/// Cluster-unique timer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeriodicScheduleStrategy {
    /// Next run at `start + k * period`, whatever each run took
    #[default]
    FixedRate,
    /// Next run `period` after the previous run finished
    FixedDelay,
}

/// Replicated description of a timer.
///
/// A negative period marks a one-shot timer. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTaskData {
    pub task_id: TaskId,
    pub start_time: i64,
    pub period: i64,
    #[serde(default)]
    pub periodic_schedule_strategy: PeriodicScheduleStrategy,
    #[serde(default)]
    pub payload: Value,
}

impl TimerTaskData {
    pub fn one_shot(task_id: TaskId, start_time: i64) -> Self {
        Self {
            task_id,
            start_time,
            period: -1,
            periodic_schedule_strategy: PeriodicScheduleStrategy::default(),
            payload: Value::Null,
        }
    }

    pub fn periodic(
        task_id: TaskId,
        start_time: i64,
        period: i64,
        strategy: PeriodicScheduleStrategy,
    ) -> Self {
        Self {
            task_id,
            start_time,
            period,
            periodic_schedule_strategy: strategy,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.period > 0
    }

    /// Time left until the first run, clamped at zero
    pub fn delay_from(&self, now: i64) -> Duration {
        Duration::from_millis(self.start_time.saturating_sub(now).max(0) as u64)
    }

    pub fn period_duration(&self) -> Option<Duration> {
        self.is_periodic()
            .then(|| Duration::from_millis(self.period as u64))
    }

    /// Moves a start time that already passed up to `now`
    pub fn correct_start_time(&mut self, now: i64) {
        if self.start_time < now {
            self.start_time = now;
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_never_negative() {
        let data = TimerTaskData::one_shot("t".into(), 1_000);
        assert_eq!(data.delay_from(400), Duration::from_millis(600));
        assert_eq!(data.delay_from(5_000), Duration::ZERO);
    }

    #[test]
    fn test_start_time_correction_only_moves_forward() {
        let mut past = TimerTaskData::one_shot("t".into(), 1_000);
        past.correct_start_time(2_000);
        assert_eq!(past.start_time, 2_000);

        let mut future = TimerTaskData::one_shot("t".into(), 9_000);
        future.correct_start_time(2_000);
        assert_eq!(future.start_time, 9_000);
    }

    #[test]
    fn test_wire_format() {
        let data = TimerTaskData::periodic("t-1".into(), 10, 250, PeriodicScheduleStrategy::FixedDelay)
            .with_payload(serde_json::json!({"dialog": "d1"}));
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["periodic_schedule_strategy"], "fixed-delay");
        assert_eq!(json["payload"]["dialog"], "d1");

        let minimal: TimerTaskData =
            serde_json::from_str(r#"{"task_id":"x","start_time":5,"period":-1}"#).unwrap();
        assert!(!minimal.is_periodic());
        assert_eq!(minimal.periodic_schedule_strategy, PeriodicScheduleStrategy::FixedRate);
        assert_eq!(minimal.period_duration(), None);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(TaskId::random(), TaskId::random());
    }
}
