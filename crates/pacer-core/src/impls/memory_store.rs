//! InMemoryTaskStore: TaskStore backed by process memory.
//!
//! Used by tests and the `pacer run` demo. Nothing survives a restart, so the
//! startup recovery sweep only has something to do when the store is shared
//! across scheduler instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskId, TaskStatus};
use crate::ports::{StoreError, TaskStore};

#[derive(Debug, Clone)]
struct KeyEntry {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    keys: HashMap<String, KeyEntry>,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    key_writes: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of successful idempotency key inserts and removals so far.
    pub fn key_write_count(&self) -> usize {
        self.key_writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored task, oldest first.
    pub fn all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<_> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id.as_ulid()));
        tasks
    }

    /// Task currently holding `key`, live or not.
    pub fn key_owner(&self, key: &str) -> Option<TaskId> {
        self.lock().keys.get(key).map(|entry| entry.task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut s = self.lock();
        if s.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        s.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut s = self.lock();
        match s.tasks.get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id)),
        }
    }

    async fn get_due_tasks(&self, before: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let mut due: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status.is_queueable() && t.is_due(before))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.scheduled_time, t.created_at));
        Ok(due)
    }

    async fn get_pending_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status.is_queueable())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    async fn get_today_completed_count(
        &self,
        day_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let count = self
            .lock()
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Success
                    && t.executed_at.unwrap_or(t.updated_at) >= day_start
            })
            .count();
        Ok(count as u32)
    }

    async fn check_idempotency_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .keys
            .get(key)
            .is_some_and(|entry| entry.expires_at > now))
    }

    async fn create_idempotency_key(
        &self,
        key: &str,
        task_id: TaskId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut s = self.lock();
        if let Some(existing) = s.keys.get(key)
            && existing.expires_at > now
        {
            return Ok(false);
        }
        s.keys.insert(key.to_string(), KeyEntry { task_id, expires_at });
        self.key_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn remove_idempotency_key(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.lock().keys.remove(key).is_some();
        if removed {
            self.key_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn cleanup_expired_keys(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut s = self.lock();
        let before = s.keys.len();
        s.keys.retain(|_, entry| entry.expires_at > now);
        Ok(before - s.keys.len())
    }

    async fn mark_running_tasks_failed(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut s = self.lock();
        let mut n = 0;
        for task in s.tasks.values_mut().filter(|t| t.status == TaskStatus::Running) {
            task.status = TaskStatus::Failed;
            task.error_message = Some(reason.to_string());
            task.updated_at = now;
            n += 1;
        }
        Ok(n)
    }
}
