//! TaskStore port: durable tasks and idempotency keys.
//!
//! The store is the source of truth. Every status change the scheduler makes
//! is written here before the in-memory transition counts as done, which is
//! what lets the startup sweep recover from a crash mid-delivery.
//!
//! Implementations must give row-level consistency: in particular
//! `create_idempotency_key` has to be an atomic insert-if-absent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Overwrites the stored row. Fails with `NotFound` for unknown ids.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Pending or Scheduled tasks whose `scheduled_time <= before`.
    async fn get_due_tasks(&self, before: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Every Pending or Scheduled task, scheduled or not.
    async fn get_pending_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Tasks that reached Success at or after `day_start`.
    async fn get_today_completed_count(&self, day_start: DateTime<Utc>)
    -> Result<u32, StoreError>;

    /// True when a key exists and has not expired at `now`.
    async fn check_idempotency_key(&self, key: &str, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Insert-if-absent. Returns false when a key still live at `now` holds
    /// the slot; an expired key is replaced.
    async fn create_idempotency_key(
        &self,
        key: &str,
        task_id: TaskId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn remove_idempotency_key(&self, key: &str) -> Result<bool, StoreError>;

    async fn cleanup_expired_keys(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Crash recovery: every Running task becomes Failed with `reason`.
    async fn mark_running_tasks_failed(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
