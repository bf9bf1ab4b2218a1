//! Status - serializable snapshots of the scheduler.
//!
//! Everything here is plain data; the CLI prints it as JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, TaskId};
use crate::guard::{CircuitStatus, RateLimiterStatus};
use crate::queue::{QueueManagerStatus, RetryStatus};

/// Why a tick stopped before dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSkip {
    NotRunning,
    OutsideWorkTime,
    DailyLimitReached,
    /// Adaptive pacing: the previous attempt's not-before time is in the future.
    Pacing,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub skipped: Option<TickSkip>,
    /// Due tasks newly placed in a queue.
    pub enqueued: usize,
    /// Due tasks marked Skipped by the idempotency check.
    pub duplicates: usize,
    /// Tasks handed to the executor.
    pub dispatched: Vec<TaskId>,
}

impl TickReport {
    pub(crate) fn skipped(reason: TickSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub now: DateTime<Utc>,
    pub timezone: Tz,
    pub within_work_time: bool,
    pub daily_limit: u32,
    pub today_completed: u32,
    pub in_flight: usize,
    pub not_before: Option<DateTime<Utc>>,
    pub fire_times: BTreeMap<Channel, DateTime<Utc>>,
    pub queues: QueueManagerStatus,
    pub circuit: CircuitStatus,
    pub rate_limiter: RateLimiterStatus,
    pub retry: RetryStatus,
}
