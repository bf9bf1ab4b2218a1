use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Channel, TaskId, TransitionError};

pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Lifecycle of a delivery task.
///
/// ```text
/// Pending/Scheduled -> Running -> Success | Failed | Skipped
/// Pending/Scheduled -> Skipped | Cancelled
/// Pending <-> Scheduled, Pending <-> Paused
/// Failed -> Pending | Scheduled   (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }

    /// Whether a task in this status may sit in a channel queue.
    pub fn is_queueable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending | Scheduled, Running | Skipped | Cancelled)
                | (Pending, Pending | Scheduled | Paused)
                | (Scheduled, Scheduled | Pending)
                | (Paused, Pending | Cancelled)
                | (Running, Success | Failed | Skipped)
                | (Failed, Pending | Scheduled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single piece of content to deliver to one channel (and optionally one
/// named target inside it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub content_code: String,
    pub channel: Channel,
    /// Group or recipient name inside the channel.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Skip or cancel reason.
    #[serde(default)]
    pub note: Option<String>,
    /// Opaque executor input (text, image paths, links).
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

impl Task {
    pub fn new(
        id: TaskId,
        content_code: impl Into<String>,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            content_code: content_code.into(),
            channel,
            target: None,
            scheduled_time: None,
            priority: 0,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retry: DEFAULT_MAX_RETRY,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error_message: None,
            note: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Moves the task to `next`, stamping `updated_at`.
    pub fn transition(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Scheduled at or before `now`. Unscheduled tasks are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at <= now)
    }

    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at > now)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuiltinChannel;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn task() -> Task {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            "C-001",
            BuiltinChannel::Feed.into(),
            now,
        )
    }

    #[rstest]
    #[case(TaskStatus::Pending, TaskStatus::Running, true)]
    #[case(TaskStatus::Scheduled, TaskStatus::Running, true)]
    #[case(TaskStatus::Running, TaskStatus::Success, true)]
    #[case(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case(TaskStatus::Running, TaskStatus::Skipped, true)]
    #[case(TaskStatus::Scheduled, TaskStatus::Skipped, true)]
    #[case(TaskStatus::Failed, TaskStatus::Scheduled, true)]
    #[case(TaskStatus::Success, TaskStatus::Running, false)]
    #[case(TaskStatus::Cancelled, TaskStatus::Pending, false)]
    #[case(TaskStatus::Running, TaskStatus::Cancelled, false)]
    #[case(TaskStatus::Paused, TaskStatus::Running, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn illegal_transition_is_rejected_without_mutation() {
        let mut t = task();
        let later = t.created_at + Duration::seconds(5);
        let err = t.transition(TaskStatus::Success, later).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Success);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.updated_at, t.created_at);
    }

    #[test]
    fn legal_transition_stamps_updated_at() {
        let mut t = task();
        let later = t.created_at + Duration::seconds(5);
        t.transition(TaskStatus::Running, later).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.updated_at, later);
    }

    #[test]
    fn due_and_future_are_relative_to_now() {
        let t = task();
        let now = t.created_at;
        assert!(!t.is_due(now));
        assert!(!t.is_future(now));

        let due = t.clone().with_scheduled_time(now - Duration::seconds(1));
        assert!(due.is_due(now));

        let future = t.with_scheduled_time(now + Duration::minutes(5));
        assert!(future.is_future(now));
        assert!(!future.is_due(now));
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&TaskStatus::Scheduled).unwrap();
        assert_eq!(s, "\"scheduled\"");
    }
}
