//! Retry policy and handler.
//!
//! Backoff is exponential: `base * 2^retry_count`, capped at `max_delay`.
//! With the defaults (600s / 3600s) three retries land 10, 20 and 40 minutes
//! after the failure.
//!
//! A retried task is not pushed back into a queue here. It is persisted as
//! Scheduled with a future `scheduled_time`, and the due-task sweep picks it
//! up once that time has passed.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::domain::{Task, TaskStatus, TransitionError};
use crate::guard::RateLimiter;
use crate::ports::{Clock, StoreError, TaskStore};

/// Pure backoff computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry_count + 1`.
    ///
    /// `retry_count` is the number of retries already made (0 for the first
    /// failure).
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.base_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduleEntry {
    pub retry_number: u32,
    pub delay_secs: u64,
    pub delay_human: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatus {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub remaining_quota: u32,
    pub retryable_errors: Vec<String>,
}

struct HandlerState {
    policy: RetryPolicy,
    retryable_errors: Vec<String>,
}

pub struct RetryHandler {
    state: RwLock<HandlerState>,
    store: Arc<dyn TaskStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl RetryHandler {
    pub fn new(
        config: &RetryConfig,
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            base_delay_secs = config.base_delay_secs,
            max_delay_secs = config.max_delay_secs,
            "retry handler initialised"
        );
        Self {
            state: RwLock::new(HandlerState {
                policy: RetryPolicy::from(config),
                retryable_errors: config.retryable_errors.clone(),
            }),
            store,
            limiter,
            clock,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HandlerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HandlerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Case-insensitive substring match against the allow-list. An empty
    /// error counts as retryable.
    pub fn is_retryable_error(&self, error: &str) -> bool {
        if error.is_empty() {
            return true;
        }
        let lowered = error.to_lowercase();
        self.read()
            .retryable_errors
            .iter()
            .any(|e| lowered.contains(&e.to_lowercase()))
    }

    pub fn should_retry(&self, task: &Task, error: &str) -> bool {
        if !task.can_retry() {
            debug!(task_id = %task.id, retry_count = task.retry_count, max_retry = task.max_retry, "retry budget exhausted");
            return false;
        }
        if !self.limiter.can_send_today() {
            warn!(task_id = %task.id, "not retrying: daily quota exhausted");
            return false;
        }
        if !self.is_retryable_error(error) {
            debug!(task_id = %task.id, error, "error is not retryable");
            return false;
        }
        true
    }

    pub fn delay(&self, task: &Task) -> Duration {
        self.read().policy.next_delay(task.retry_count)
    }

    /// Re-schedules a Failed task. Returns the new scheduled time, or `None`
    /// when the task is not retried (it then stays Failed).
    pub async fn schedule_retry(
        &self,
        task: &mut Task,
        error: &str,
    ) -> Result<Option<DateTime<Utc>>, RetryError> {
        if !self.should_retry(task, error) {
            return Ok(None);
        }
        let delay = self.delay(task);
        let now = self.clock.now();
        let retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

        task.transition(TaskStatus::Scheduled, now)?;
        task.retry_count += 1;
        task.scheduled_time = Some(retry_at);
        task.error_message = Some(format!(
            "retry {}/{}: {}",
            task.retry_count, task.max_retry, error
        ));
        self.store.update_task(task).await?;

        info!(
            task_id = %task.id,
            retry = task.retry_count,
            delay_secs = delay.as_secs(),
            "retry scheduled"
        );
        Ok(Some(retry_at))
    }

    /// Delays of the first `retries` retries.
    pub fn retry_schedule(&self, retries: u32) -> Vec<RetryScheduleEntry> {
        let policy = self.read().policy.clone();
        (0..retries)
            .map(|i| {
                let delay = policy.next_delay(i).as_secs();
                RetryScheduleEntry {
                    retry_number: i + 1,
                    delay_secs: delay,
                    delay_human: format_duration(delay),
                }
            })
            .collect()
    }

    pub fn retryable_errors(&self) -> Vec<String> {
        self.read().retryable_errors.clone()
    }

    pub fn add_retryable_error(&self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        let mut s = self.write();
        if !s.retryable_errors.contains(&pattern) {
            info!(pattern = %pattern, "retryable error added");
            s.retryable_errors.push(pattern);
        }
    }

    pub fn remove_retryable_error(&self, pattern: &str) -> bool {
        let mut s = self.write();
        let before = s.retryable_errors.len();
        s.retryable_errors.retain(|e| e != pattern);
        before != s.retryable_errors.len()
    }

    pub fn reconfigure(&self, config: &RetryConfig) {
        let mut s = self.write();
        s.policy = RetryPolicy::from(config);
        s.retryable_errors = config.retryable_errors.clone();
    }

    pub fn status(&self) -> RetryStatus {
        let s = self.read();
        RetryStatus {
            base_delay_secs: s.policy.base_delay.as_secs(),
            max_delay_secs: s.policy.max_delay.as_secs(),
            remaining_quota: self.limiter.remaining_quota(),
            retryable_errors: s.retryable_errors.clone(),
        }
    }
}

pub fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{} min", s / 60),
        s => {
            let (h, m) = (s / 3600, (s % 3600) / 60);
            if m == 0 {
                format!("{h} h")
            } else {
                format!("{h} h {m} min")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::domain::{BuiltinChannel, TaskId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn policy() -> RetryPolicy {
        RetryPolicy::from(&RetryConfig::default())
    }

    #[rstest]
    #[case(0, 600)]
    #[case(1, 1200)]
    #[case(2, 2400)]
    #[case(3, 3600)]
    #[case(40, 3600)]
    fn backoff_doubles_and_caps(#[case] retry_count: u32, #[case] secs: u64) {
        assert_eq!(policy().next_delay(retry_count), Duration::from_secs(secs));
    }

    struct Fixture {
        handler: RetryHandler,
        store: Arc<InMemoryTaskStore>,
        limiter: Arc<RateLimiter>,
        clock: FixedClock,
    }

    fn fixture() -> Fixture {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 2, 0, 0).unwrap());
        let store = Arc::new(InMemoryTaskStore::new());
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                daily_limit: 5,
                ..RateLimitConfig::default()
            },
            chrono_tz::Asia::Shanghai,
            Arc::new(clock.clone()),
        ));
        let handler = RetryHandler::new(
            &RetryConfig::default(),
            store.clone(),
            limiter.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            handler,
            store,
            limiter,
            clock,
        }
    }

    async fn failed_task(f: &Fixture) -> Task {
        let now = f.clock.now();
        let mut task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            "C-9",
            BuiltinChannel::Feed.into(),
            now,
        );
        f.store.create_task(&task).await.unwrap();
        task.transition(TaskStatus::Running, now).unwrap();
        task.transition(TaskStatus::Failed, now).unwrap();
        f.store.update_task(&task).await.unwrap();
        task
    }

    #[rstest]
    #[case("network timeout: page did not load", true)]
    #[case("NETWORK TIMEOUT", true)]
    #[case("ElementNotFoundError: send button", true)]
    #[case("", true)]
    #[case("account banned", false)]
    fn allow_list_matching(#[case] error: &str, #[case] expected: bool) {
        assert_eq!(fixture().handler.is_retryable_error(error), expected);
    }

    #[tokio::test]
    async fn schedule_retry_persists_scheduled_task() {
        let f = fixture();
        let mut task = failed_task(&f).await;

        let at = f
            .handler
            .schedule_retry(&mut task, "network timeout")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(at, f.clock.now() + chrono::Duration::seconds(600));
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.retry_count, 1);

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.scheduled_time, Some(at));
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_message.unwrap().starts_with("retry 1/3"));
    }

    #[tokio::test]
    async fn terminal_errors_and_exhausted_budgets_are_not_retried() {
        let f = fixture();
        let mut task = failed_task(&f).await;
        assert_eq!(
            f.handler.schedule_retry(&mut task, "account banned").await.unwrap(),
            None
        );
        assert_eq!(task.status, TaskStatus::Failed);

        task.retry_count = task.max_retry;
        assert!(!f.handler.should_retry(&task, "network timeout"));
    }

    #[tokio::test]
    async fn quota_exhaustion_blocks_retry() {
        let f = fixture();
        let task = failed_task(&f).await;
        f.limiter.seed_today_count(5);
        assert!(!f.handler.should_retry(&task, "network timeout"));
    }

    #[test]
    fn allow_list_is_editable() {
        let f = fixture();
        assert!(!f.handler.is_retryable_error("rate limited by server"));
        f.handler.add_retryable_error("rate limited");
        assert!(f.handler.is_retryable_error("rate limited by server"));
        assert!(f.handler.remove_retryable_error("rate limited"));
        assert!(!f.handler.remove_retryable_error("rate limited"));
    }

    #[test]
    fn schedule_preview_formats_durations() {
        let schedule = fixture().handler.retry_schedule(4);
        let human: Vec<_> = schedule.iter().map(|e| e.delay_human.as_str()).collect();
        assert_eq!(human, ["10 min", "20 min", "40 min", "1 h"]);
        assert_eq!(schedule[3].retry_number, 4);
    }

    #[rstest]
    #[case(45, "45s")]
    #[case(5400, "1 h 30 min")]
    fn durations(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(format_duration(secs), expected);
    }
}
