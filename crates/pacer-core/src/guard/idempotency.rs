//! At-most-once delivery per (content, channel, target, day).
//!
//! The key is the SHA-256 hex digest of
//! `content_code|channel|target|YYYY-MM-DD`, where the day is the task's
//! scheduled day, or today when unscheduled, both taken in the configured
//! timezone. Keys live in the store with a TTL of at least 24h.
//!
//! `check_and_record` must only be called while holding the channel's
//! execution permit; that is what closes the race between two dispatchers
//! picking the same task.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{IdempotencyConfig, MAX_KEY_TTL_HOURS};
use crate::domain::Task;
use crate::ports::{Clock, StoreError, TaskStore};

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The key is now held by this task; the caller may deliver.
    Reserved,
    /// A live key already exists; the caller must skip.
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    timezone: Tz,
    ttl: Duration,
}

pub struct IdempotencyManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    settings: RwLock<Settings>,
}

impl IdempotencyManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        config: &IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            settings: RwLock::new(Settings {
                timezone,
                ttl: Duration::hours(config.key_ttl_hours.clamp(24, MAX_KEY_TTL_HOURS)),
            }),
        }
    }

    fn settings(&self) -> Settings {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reconfigure(&self, timezone: Tz, config: &IdempotencyConfig) {
        let mut s = self.settings.write().unwrap_or_else(|e| e.into_inner());
        s.timezone = timezone;
        s.ttl = Duration::hours(config.key_ttl_hours.clamp(24, MAX_KEY_TTL_HOURS));
    }

    /// Calendar day the key of `task` belongs to.
    pub fn key_day(&self, task: &Task) -> NaiveDate {
        let at = task.scheduled_time.unwrap_or_else(|| self.clock.now());
        at.with_timezone(&self.settings().timezone).date_naive()
    }

    pub fn key(&self, task: &Task) -> String {
        Self::key_for_day(task, self.key_day(task))
    }

    pub fn key_for_day(task: &Task, day: NaiveDate) -> String {
        let raw = format!(
            "{}|{}|{}|{}",
            task.content_code,
            task.channel,
            task.target.as_deref().unwrap_or(""),
            day.format("%Y-%m-%d")
        );
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Read-only check.
    pub async fn is_duplicate(&self, task: &Task) -> Result<bool, StoreError> {
        let key = self.key(task);
        let exists = self
            .store
            .check_idempotency_key(&key, self.clock.now())
            .await?;
        if exists {
            debug!(task_id = %task.id, key = &key[..8], "idempotency key already held");
        }
        Ok(exists)
    }

    /// Reserve-or-reject. A key that is already present leaves the store
    /// untouched.
    pub async fn check_and_record(&self, task: &Task) -> Result<ReserveOutcome, StoreError> {
        let key = self.key(task);
        let now = self.clock.now();
        if self.store.check_idempotency_key(&key, now).await? {
            info!(task_id = %task.id, "idempotency check blocked duplicate delivery");
            return Ok(ReserveOutcome::Duplicate);
        }
        let expires_at = now + self.settings().ttl;
        if self
            .store
            .create_idempotency_key(&key, task.id, now, expires_at)
            .await?
        {
            debug!(task_id = %task.id, key = &key[..8], "idempotency key reserved");
            Ok(ReserveOutcome::Reserved)
        } else {
            info!(task_id = %task.id, "idempotency key taken concurrently");
            Ok(ReserveOutcome::Duplicate)
        }
    }

    /// Rolls back a reservation after a failed delivery so the retry is not
    /// blocked by its own key.
    pub async fn remove(&self, task: &Task) -> Result<bool, StoreError> {
        let key = self.key(task);
        let removed = self.store.remove_idempotency_key(&key).await?;
        if removed {
            info!(task_id = %task.id, "idempotency key released");
        } else {
            warn!(task_id = %task.id, "no idempotency key to release");
        }
        Ok(removed)
    }

    pub async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        self.store.cleanup_expired_keys(self.clock.now()).await
    }

    pub fn expires_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + self.settings().ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuiltinChannel, TaskId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn setup() -> (IdempotencyManager, Arc<InMemoryTaskStore>, FixedClock) {
        // 2025-03-03 17:00 UTC is 2025-03-04 01:00 in Shanghai.
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 17, 0, 0).unwrap());
        let store = Arc::new(InMemoryTaskStore::new());
        let manager = IdempotencyManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            chrono_tz::Asia::Shanghai,
            &IdempotencyConfig::default(),
        );
        (manager, store, clock)
    }

    fn task(content: &str, target: &str, now: DateTime<Utc>) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            content,
            BuiltinChannel::AgentGroup.into(),
            now,
        )
        .with_target(target)
    }

    #[test]
    fn key_is_stable_hex_sha256() {
        let (manager, _, clock) = setup();
        let a = task("C-1", "group-a", clock.now());
        let b = task("C-1", "group-a", clock.now());
        let key = manager.key(&a);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, manager.key(&b), "different ids, same delivery");
        assert_ne!(key, manager.key(&task("C-1", "group-b", clock.now())));
    }

    #[test]
    fn day_comes_from_the_configured_timezone() {
        let (manager, _, clock) = setup();
        let t = task("C-1", "g", clock.now());
        assert_eq!(manager.key_day(&t), NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());

        let scheduled = t.with_scheduled_time(Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap());
        assert_eq!(manager.key_day(&scheduled), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[tokio::test]
    async fn second_reservation_is_a_duplicate_without_store_mutation() {
        let (manager, store, clock) = setup();
        let first = task("C-1", "g", clock.now());
        let second = task("C-1", "g", clock.now());

        assert_eq!(
            manager.check_and_record(&first).await.unwrap(),
            ReserveOutcome::Reserved
        );
        let writes = store.key_write_count();

        assert_eq!(
            manager.check_and_record(&second).await.unwrap(),
            ReserveOutcome::Duplicate
        );
        assert_eq!(store.key_write_count(), writes);
        assert!(manager.is_duplicate(&second).await.unwrap());
    }

    #[tokio::test]
    async fn remove_permits_a_new_reservation() {
        let (manager, _, clock) = setup();
        let t = task("C-1", "g", clock.now());
        manager.check_and_record(&t).await.unwrap();
        assert!(manager.remove(&t).await.unwrap());
        assert!(!manager.is_duplicate(&t).await.unwrap());
        assert_eq!(
            manager.check_and_record(&t).await.unwrap(),
            ReserveOutcome::Reserved
        );
    }

    #[tokio::test]
    async fn expired_keys_stop_blocking_and_get_cleaned() {
        let (manager, _, clock) = setup();
        let t = task("C-1", "g", clock.now()).with_scheduled_time(clock.now());
        manager.check_and_record(&t).await.unwrap();

        clock.advance(Duration::hours(24));
        assert!(!manager.is_duplicate(&t).await.unwrap());
        assert_eq!(manager.cleanup_expired().await.unwrap(), 1);
    }
}
