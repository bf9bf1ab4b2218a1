//! Per-channel priority queue with pacing and a single execution slot.
//!
//! Ordering is a min-heap on `(-priority, scheduled_time or +inf, created_at,
//! insertion seq)`, built on `BinaryHeap` with a reversed `Ord`.
//!
//! `next()` decides, in this order:
//! 1. paused, or now outside the daily window: nothing.
//! 2. any queued task already due bypasses pacing. Otherwise the channel's
//!    pacing must allow a send (fixed minute once per hour, or the interval
//!    since the last execution), and only then may unscheduled tasks go.
//! 3. pop in heap order, setting aside future tasks (and unscheduled ones
//!    when they are not allowed yet); everything set aside is restored.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ScheduleMode, TimeWindow, delta_secs};
use crate::domain::{Channel, Task, TaskId, TaskStatus, TransitionError};
use crate::ports::{Clock, StoreError, TaskStore};

/// How many hours ahead a fixed-minute fire time is searched for a slot inside
/// the daily window.
const FIRE_SEARCH_HOURS: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Only Pending and Scheduled tasks may be queued.
    Status(TaskStatus),
    WrongChannel,
}

/// Result of `add`. None of these are faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    /// The id is already queued.
    Duplicate,
    Rejected(RejectReason),
}

impl AddOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AddOutcome::Accepted)
    }
}

/// Why the preview candidate would not run right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Paused,
    NotStarted,
    OutOfWindow,
    ScheduledTimeNotReached,
    IntervalNotElapsed,
    AlreadyRanThisHour,
    FixedMinuteNotReached,
    QueueEmpty,
    NoRunnableTask,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Paused => "paused",
            BlockReason::NotStarted => "not started",
            BlockReason::OutOfWindow => "out of window",
            BlockReason::ScheduledTimeNotReached => "scheduled time not reached",
            BlockReason::IntervalNotElapsed => "interval not elapsed",
            BlockReason::AlreadyRanThisHour => "already ran this hour",
            BlockReason::FixedMinuteNotReached => "fixed minute not reached",
            BlockReason::QueueEmpty => "queue empty",
            BlockReason::NoRunnableTask => "no runnable task",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-mutating look at what `next()` would pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreview {
    pub channel: Channel,
    pub task: Option<Task>,
    /// `None` when the candidate is runnable now.
    pub reason: Option<BlockReason>,
    pub next_time: Option<DateTime<Utc>>,
}

impl ChannelPreview {
    pub fn is_ready(&self) -> bool {
        self.task.is_some() && self.reason.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub queue_size: usize,
    pub is_running: bool,
    pub is_paused: bool,
    pub is_executing: bool,
    pub mode: ScheduleMode,
    pub interval_secs: u64,
    pub minute_of_hour: u32,
    pub daily_window: String,
    pub within_daily_window: bool,
    pub current_task_id: Option<TaskId>,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Heap entry.
#[derive(Debug, Clone)]
struct QueuedTask {
    seq: u64,
    task: Task,
}

impl QueuedTask {
    fn sort_key(&self) -> (Reverse<i32>, DateTime<Utc>, DateTime<Utc>, u64) {
        (
            Reverse(self.task.priority),
            self.task.scheduled_time.unwrap_or(DateTime::<Utc>::MAX_UTC),
            self.task.created_at,
            self.seq,
        )
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the smallest key sits on top of the max-heap.
        other.sort_key().cmp(&self.sort_key())
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    ids: HashSet<TaskId>,
    next_seq: u64,
    config: ChannelConfig,
    timezone: Tz,
    paused: bool,
    running: bool,
    last_execution: Option<DateTime<Utc>>,
    current: Option<TaskId>,
}

impl QueueState {
    fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(task.id);
        self.heap.push(QueuedTask { seq, task });
    }

    fn restore(&mut self, entries: Vec<QueuedTask>) {
        for entry in entries {
            self.ids.insert(entry.task.id);
            self.heap.push(entry);
        }
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.timezone).time()
    }

    fn within_window(&self, now: DateTime<Utc>) -> bool {
        self.config.daily_window.contains(self.local_time(now))
    }

    fn ran_this_hour(&self, now: DateTime<Utc>) -> bool {
        self.last_execution.is_some_and(|last| {
            local_hour_start(last, self.timezone) >= local_hour_start(now, self.timezone)
        })
    }

    fn interval_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_execution {
            Some(last) if self.config.interval_secs > 0 => {
                now - last >= delta_secs(self.config.interval_secs)
            }
            _ => true,
        }
    }

    fn next_interval_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_execution {
            Some(last) if self.config.interval_secs > 0 => {
                last.checked_add_signed(delta_secs(self.config.interval_secs))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
                    .max(now)
            }
            _ => now,
        }
    }

    /// Next instant strictly after `now` at the configured minute, in an hour
    /// that has not run yet and that lies inside the daily window.
    fn next_fixed_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour_start = local_hour_start(now, self.timezone);
        let mut candidate = hour_start + ChronoDuration::minutes(self.config.minute_of_hour as i64);
        if candidate <= now {
            candidate += ChronoDuration::hours(1);
        }
        if let Some(last) = self.last_execution
            && local_hour_start(last, self.timezone) >= local_hour_start(candidate, self.timezone)
        {
            candidate += ChronoDuration::hours(1);
        }
        for _ in 0..FIRE_SEARCH_HOURS {
            if self.config.daily_window.contains(self.local_time(candidate)) {
                break;
            }
            candidate += ChronoDuration::hours(1);
        }
        candidate
    }

    fn task_next_time(&self, task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = task.scheduled_time {
            return at;
        }
        match self.config.mode {
            ScheduleMode::Interval => self.next_interval_time(now),
            ScheduleMode::FixedMinute => self.next_fixed_time(now),
        }
    }
}

/// Start of the local clock hour containing `at`, as a UTC instant.
fn local_hour_start(at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = at.with_timezone(&tz);
    at - ChronoDuration::minutes(local.minute() as i64)
        - ChronoDuration::seconds(local.second() as i64)
        - ChronoDuration::nanoseconds(local.nanosecond() as i64)
}

pub struct ChannelQueue {
    channel: Channel,
    state: Mutex<QueueState>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl ChannelQueue {
    pub fn new(
        channel: Channel,
        config: ChannelConfig,
        timezone: Tz,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!(%channel, "channel queue created");
        Self {
            channel,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                ids: HashSet::new(),
                next_seq: 0,
                config: config.clamped(),
                timezone,
                paused: false,
                running: false,
                last_execution: None,
                current: None,
            }),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            store,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn add(&self, task: Task) -> AddOutcome {
        if task.channel != self.channel {
            warn!(channel = %self.channel, task_id = %task.id, task_channel = %task.channel, "task routed to wrong channel");
            return AddOutcome::Rejected(RejectReason::WrongChannel);
        }
        let mut s = self.lock();
        if s.ids.contains(&task.id) {
            debug!(channel = %self.channel, task_id = %task.id, "task already queued");
            return AddOutcome::Duplicate;
        }
        if !task.status.is_queueable() {
            debug!(channel = %self.channel, task_id = %task.id, status = %task.status, "task status not queueable");
            return AddOutcome::Rejected(RejectReason::Status(task.status));
        }
        debug!(channel = %self.channel, task_id = %task.id, priority = task.priority, "task queued");
        s.push(task);
        AddOutcome::Accepted
    }

    /// Takes the next runnable task out of the queue, or `None` when paused,
    /// out of window, paced out, or nothing is eligible.
    pub fn next(&self) -> Option<Task> {
        let now = self.clock.now();
        let mut s = self.lock();
        let channel = &self.channel;

        if s.paused {
            debug!(%channel, "next: paused");
            return None;
        }
        if !s.within_window(now) {
            debug!(%channel, "next: outside daily window");
            return None;
        }

        let has_due = s.heap.iter().any(|e| e.task.is_due(now));
        let mut allow_unscheduled = false;
        if !has_due {
            match s.config.mode {
                ScheduleMode::FixedMinute => {
                    let minute = now.with_timezone(&s.timezone).minute();
                    if minute != s.config.minute_of_hour {
                        debug!(%channel, minute, expected = s.config.minute_of_hour, "next: not the fixed minute");
                        return None;
                    }
                    if s.ran_this_hour(now) {
                        debug!(%channel, "next: already ran this hour");
                        return None;
                    }
                }
                ScheduleMode::Interval => {
                    if !s.interval_elapsed(now) {
                        debug!(%channel, "next: interval not elapsed");
                        return None;
                    }
                }
            }
            allow_unscheduled = true;
        }

        let mut set_aside = Vec::new();
        while let Some(entry) = s.heap.pop() {
            s.ids.remove(&entry.task.id);
            if !entry.task.status.is_queueable() {
                debug!(%channel, task_id = %entry.task.id, status = %entry.task.status, "dropping non-runnable task");
                continue;
            }
            let eligible = match entry.task.scheduled_time {
                Some(at) => at <= now,
                None => allow_unscheduled,
            };
            if !eligible {
                set_aside.push(entry);
                continue;
            }
            s.restore(set_aside);
            info!(%channel, task_id = %entry.task.id, "next task selected");
            return Some(entry.task);
        }
        s.restore(set_aside);
        debug!(%channel, "next: no runnable task");
        None
    }

    pub fn remove(&self, id: TaskId) -> bool {
        let mut s = self.lock();
        if !s.ids.remove(&id) {
            return false;
        }
        s.heap.retain(|e| e.task.id != id);
        debug!(channel = %self.channel, task_id = %id, "task removed from queue");
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().ids.contains(&id)
    }

    pub fn clear(&self) -> usize {
        let mut s = self.lock();
        let n = s.heap.len();
        s.heap.clear();
        s.ids.clear();
        info!(channel = %self.channel, removed = n, "queue cleared");
        n
    }

    /// Preview candidate without removing it.
    pub fn peek(&self) -> Option<Task> {
        self.preview().task
    }

    pub fn preview(&self) -> ChannelPreview {
        let now = self.clock.now();
        let s = self.lock();
        let empty = |reason| ChannelPreview {
            channel: self.channel.clone(),
            task: None,
            reason: Some(reason),
            next_time: None,
        };
        if s.heap.is_empty() {
            return empty(BlockReason::QueueEmpty);
        }

        let candidate = s
            .heap
            .iter()
            .filter(|e| e.task.status.is_queueable())
            .map(|e| (s.task_next_time(&e.task, now), &e.task))
            .min_by(|(ta, a), (tb, b)| {
                ta.cmp(tb)
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
        let Some((next_time, task)) = candidate else {
            return empty(BlockReason::NoRunnableTask);
        };

        let reason = if s.paused {
            Some(BlockReason::Paused)
        } else if !s.running {
            Some(BlockReason::NotStarted)
        } else if !s.within_window(now) {
            Some(BlockReason::OutOfWindow)
        } else if task.is_future(now) {
            Some(BlockReason::ScheduledTimeNotReached)
        } else if task.scheduled_time.is_none() && next_time > now {
            Some(match s.config.mode {
                ScheduleMode::Interval => BlockReason::IntervalNotElapsed,
                ScheduleMode::FixedMinute if s.ran_this_hour(now) => BlockReason::AlreadyRanThisHour,
                ScheduleMode::FixedMinute => BlockReason::FixedMinuteNotReached,
            })
        } else {
            None
        };

        ChannelPreview {
            channel: self.channel.clone(),
            task: Some(task.clone()),
            reason,
            next_time: Some(next_time),
        }
    }

    /// Next fixed-minute fire instant after `now`; `None` in interval mode.
    pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let s = self.lock();
        (s.config.mode == ScheduleMode::FixedMinute).then(|| s.next_fixed_time(now))
    }

    /// Takes the channel's execution slot for `task`, waiting at most
    /// `timeout`. On success the task is Running and persisted.
    ///
    /// `Ok(None)` means the slot stayed busy for the whole timeout.
    pub async fn acquire_lock(
        self: &Arc<Self>,
        task: &mut Task,
        timeout: Duration,
    ) -> Result<Option<ExecutionPermit>, QueueError> {
        let guard = match tokio::time::timeout(timeout, self.exec_lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(channel = %self.channel, task_id = %task.id, "execution lock timed out");
                return Ok(None);
            }
        };
        let mut permit = ExecutionPermit {
            queue: Arc::clone(self),
            task_id: task.id,
            released: false,
            _guard: guard,
        };

        let now = self.clock.now();
        let previous = task.clone();
        task.transition(TaskStatus::Running, now)?;
        if let Err(e) = self.store.update_task(task).await {
            *task = previous;
            permit.release_inner(false);
            return Err(e.into());
        }
        self.lock().current = Some(task.id);
        debug!(channel = %self.channel, task_id = %task.id, "execution lock acquired");
        Ok(Some(permit))
    }

    fn on_release(&self, task_id: TaskId, update_timestamp: bool) {
        let now = self.clock.now();
        let mut s = self.lock();
        if s.current == Some(task_id) {
            s.current = None;
        }
        if update_timestamp {
            s.last_execution = Some(now);
        }
        debug!(channel = %self.channel, task_id = %task_id, update_timestamp, "execution lock released");
    }

    pub fn is_executing(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.lock().current
    }

    pub fn last_execution(&self) -> Option<DateTime<Utc>> {
        self.lock().last_execution
    }

    pub fn set_last_execution(&self, at: Option<DateTime<Utc>>) {
        self.lock().last_execution = at;
    }

    pub fn pause(&self) {
        let mut s = self.lock();
        s.paused = true;
        s.running = false;
        info!(channel = %self.channel, "queue paused");
    }

    pub fn resume(&self) {
        let mut s = self.lock();
        s.paused = false;
        s.running = true;
        info!(channel = %self.channel, "queue resumed");
    }

    pub fn start(&self) {
        let mut s = self.lock();
        s.running = true;
        s.paused = false;
        info!(channel = %self.channel, "queue started");
    }

    pub fn stop(&self) {
        self.lock().running = false;
        info!(channel = %self.channel, "queue stopped");
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Queued tasks in dispatch order.
    pub fn tasks(&self) -> Vec<Task> {
        let s = self.lock();
        let mut entries: Vec<_> = s.heap.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.task).collect()
    }

    pub fn config(&self) -> ChannelConfig {
        self.lock().config.clone()
    }

    pub fn reconfigure(&self, config: ChannelConfig) {
        let config = config.clamped();
        info!(
            channel = %self.channel,
            mode = ?config.mode,
            interval_secs = config.interval_secs,
            minute_of_hour = config.minute_of_hour,
            window = %config.daily_window,
            "channel reconfigured"
        );
        self.lock().config = config;
    }

    pub fn set_schedule_mode(&self, mode: ScheduleMode) {
        let mut config = self.config();
        config.mode = mode;
        self.reconfigure(config);
    }

    pub fn set_interval(&self, interval_secs: u64) {
        let mut config = self.config();
        config.interval_secs = interval_secs;
        self.reconfigure(config);
    }

    pub fn set_minute_of_hour(&self, minute: u32) {
        let mut config = self.config();
        config.minute_of_hour = minute;
        self.reconfigure(config);
    }

    pub fn set_daily_window(&self, window: TimeWindow) {
        let mut config = self.config();
        config.daily_window = window;
        self.reconfigure(config);
    }

    pub fn set_timezone(&self, timezone: Tz) {
        self.lock().timezone = timezone;
    }

    pub fn within_daily_window(&self) -> bool {
        self.lock().within_window(self.clock.now())
    }

    pub fn status(&self) -> ChannelStatus {
        let now = self.clock.now();
        let s = self.lock();
        ChannelStatus {
            channel: self.channel.clone(),
            queue_size: s.heap.len(),
            is_running: s.running,
            is_paused: s.paused,
            is_executing: s.current.is_some(),
            mode: s.config.mode,
            interval_secs: s.config.interval_secs,
            minute_of_hour: s.config.minute_of_hour,
            daily_window: s.config.daily_window.to_string(),
            within_daily_window: s.within_window(now),
            current_task_id: s.current,
            last_execution: s.last_execution,
        }
    }
}

/// Exclusive right to execute on one channel.
///
/// `release(true)` stamps the channel's last execution time, which drives
/// interval and fixed-minute pacing. Dropping the permit releases it without
/// the stamp.
#[must_use = "dropping the permit releases the channel immediately"]
pub struct ExecutionPermit {
    queue: Arc<ChannelQueue>,
    task_id: TaskId,
    released: bool,
    _guard: OwnedMutexGuard<()>,
}

impl ExecutionPermit {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn channel(&self) -> &Channel {
        self.queue.channel()
    }

    pub fn release(mut self, update_timestamp: bool) {
        self.release_inner(update_timestamp);
    }

    fn release_inner(&mut self, update_timestamp: bool) {
        if !self.released {
            self.released = true;
            self.queue.on_release(self.task_id, update_timestamp);
        }
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.release_inner(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuiltinChannel;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    const TZ: Tz = chrono_tz::Asia::Shanghai;

    struct Fixture {
        queue: Arc<ChannelQueue>,
        store: Arc<InMemoryTaskStore>,
        clock: FixedClock,
    }

    /// 10:30 local on a Monday.
    fn fixture(config: ChannelConfig) -> Fixture {
        let clock = FixedClock::new(TZ.with_ymd_and_hms(2025, 3, 3, 10, 30, 0).unwrap().with_timezone(&Utc));
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(ChannelQueue::new(
            BuiltinChannel::Feed.into(),
            config,
            TZ,
            store.clone(),
            Arc::new(clock.clone()),
        ));
        queue.start();
        Fixture { queue, store, clock }
    }

    fn task(f: &Fixture, priority: i32) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            format!("C-{priority}"),
            BuiltinChannel::Feed.into(),
            f.clock.now(),
        )
        .with_priority(priority)
    }

    fn local(h: u32, m: u32) -> DateTime<Utc> {
        TZ.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn due_tasks_come_out_by_priority() {
        let f = fixture(ChannelConfig::default());
        let past = f.clock.now() - ChronoDuration::seconds(1);
        let low = task(&f, 1).with_scheduled_time(past);
        let high = task(&f, 9).with_scheduled_time(past);
        f.queue.add(low.clone());
        f.queue.add(high.clone());

        assert_eq!(f.queue.next().unwrap().id, high.id);
        assert_eq!(f.queue.next().unwrap().id, low.id);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn future_task_is_withheld_regardless_of_priority() {
        let f = fixture(ChannelConfig::default());
        let future = task(&f, 100).with_scheduled_time(f.clock.now() + ChronoDuration::minutes(5));
        let plain = task(&f, 1);
        f.queue.add(future.clone());
        f.queue.add(plain.clone());

        assert_eq!(f.queue.next().unwrap().id, plain.id);
        assert!(f.queue.next().is_none());
        assert!(f.queue.contains(future.id), "future task restored");

        f.clock.advance(ChronoDuration::minutes(5));
        assert_eq!(f.queue.next().unwrap().id, future.id);
    }

    #[test]
    fn adding_the_same_id_twice_is_a_duplicate() {
        let f = fixture(ChannelConfig::default());
        let t = task(&f, 5);
        assert_eq!(f.queue.add(t.clone()), AddOutcome::Accepted);
        assert_eq!(f.queue.add(t), AddOutcome::Duplicate);
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn rejects_wrong_status_and_channel() {
        let f = fixture(ChannelConfig::default());
        let mut done = task(&f, 1);
        done.status = TaskStatus::Success;
        assert_eq!(
            f.queue.add(done),
            AddOutcome::Rejected(RejectReason::Status(TaskStatus::Success))
        );

        let mut other = task(&f, 1);
        other.channel = BuiltinChannel::AgentGroup.into();
        assert_eq!(f.queue.add(other), AddOutcome::Rejected(RejectReason::WrongChannel));
        assert!(f.queue.is_empty());
    }

    #[test]
    fn paused_or_out_of_window_returns_nothing() {
        let f = fixture(ChannelConfig::default());
        f.queue.add(task(&f, 1));

        f.queue.pause();
        assert!(f.queue.next().is_none());
        f.queue.resume();

        f.clock.set(local(23, 0));
        assert!(f.queue.next().is_none());
        f.clock.set(local(21, 0));
        assert!(f.queue.next().is_some());
    }

    #[tokio::test]
    async fn interval_pacing_blocks_unscheduled_but_not_due_tasks() {
        let f = fixture(ChannelConfig::default());
        let first = task(&f, 1);
        f.store.create_task(&first).await.unwrap();
        f.queue.add(first);
        let mut picked = f.queue.next().unwrap();
        let permit = f
            .queue
            .acquire_lock(&mut picked, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        permit.release(true);

        let unscheduled = task(&f, 5);
        f.queue.add(unscheduled.clone());
        f.clock.advance(ChronoDuration::seconds(60));
        assert!(f.queue.next().is_none(), "interval of 180s not elapsed");

        let due = task(&f, 0).with_scheduled_time(f.clock.now() - ChronoDuration::seconds(1));
        f.queue.add(due.clone());
        assert_eq!(f.queue.next().unwrap().id, due.id, "due task bypasses pacing");
        assert!(f.queue.next().is_none(), "unscheduled still paced");

        f.clock.advance(ChronoDuration::seconds(120));
        assert_eq!(f.queue.next().unwrap().id, unscheduled.id);
    }

    #[tokio::test]
    async fn oversized_interval_is_clamped() {
        let f = fixture(ChannelConfig::default());
        f.queue.set_interval(u64::MAX);
        assert_eq!(f.queue.config().interval_secs, crate::config::MAX_INTERVAL_SECS);

        let first = task(&f, 1);
        f.store.create_task(&first).await.unwrap();
        f.queue.add(first);
        let mut picked = f.queue.next().unwrap();
        let permit = f
            .queue
            .acquire_lock(&mut picked, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        permit.release(true);

        f.queue.add(task(&f, 2));
        f.clock.advance(ChronoDuration::days(1));
        assert!(f.queue.next().is_none());
        let p = f.queue.preview();
        assert_eq!(p.reason, Some(BlockReason::IntervalNotElapsed));
        assert_eq!(
            p.next_time,
            Some(local(10, 30) + ChronoDuration::seconds(crate::config::MAX_INTERVAL_SECS as i64))
        );
    }

    #[test]
    fn fixed_minute_fires_once_per_hour() {
        let f = fixture(ChannelConfig {
            mode: ScheduleMode::FixedMinute,
            minute_of_hour: 15,
            ..ChannelConfig::default()
        });
        f.queue.add(task(&f, 1));
        f.queue.add(task(&f, 2));

        f.clock.set(local(11, 14));
        assert!(f.queue.next().is_none());

        f.clock.set(local(11, 15));
        assert!(f.queue.next().is_some());
        f.queue.set_last_execution(Some(f.clock.now()));
        assert!(f.queue.next().is_none(), "already ran this hour");
        assert_eq!(f.queue.preview().reason, Some(BlockReason::AlreadyRanThisHour));

        f.clock.set(local(12, 15));
        assert!(f.queue.next().is_some());
    }

    #[test]
    fn next_fire_time_skips_hours_outside_the_window() {
        let f = fixture(ChannelConfig {
            mode: ScheduleMode::FixedMinute,
            minute_of_hour: 15,
            ..ChannelConfig::default()
        });
        assert_eq!(f.queue.next_fire_time(local(10, 30)), Some(local(11, 15)));
        assert_eq!(f.queue.next_fire_time(local(10, 10)), Some(local(10, 15)));
        assert_eq!(
            f.queue.next_fire_time(local(21, 20)),
            Some(TZ.with_ymd_and_hms(2025, 3, 4, 8, 15, 0).unwrap().with_timezone(&Utc))
        );

        f.queue.set_schedule_mode(ScheduleMode::Interval);
        assert_eq!(f.queue.next_fire_time(local(10, 30)), None);
    }

    #[test]
    fn preview_explains_blocking() {
        let f = fixture(ChannelConfig::default());
        assert_eq!(f.queue.preview().reason, Some(BlockReason::QueueEmpty));

        let future = task(&f, 1).with_scheduled_time(f.clock.now() + ChronoDuration::hours(1));
        f.queue.add(future.clone());
        let p = f.queue.preview();
        assert_eq!(p.task.as_ref().map(|t| t.id), Some(future.id));
        assert_eq!(p.reason, Some(BlockReason::ScheduledTimeNotReached));

        let ready = task(&f, 1);
        f.queue.add(ready.clone());
        let p = f.queue.preview();
        assert!(p.is_ready());
        assert_eq!(p.task.unwrap().id, ready.id);
        assert_eq!(f.queue.len(), 2, "preview does not mutate");

        f.queue.stop();
        assert_eq!(f.queue.preview().reason, Some(BlockReason::NotStarted));
        f.queue.pause();
        assert_eq!(f.queue.preview().reason, Some(BlockReason::Paused));
    }

    #[test]
    fn remove_and_clear() {
        let f = fixture(ChannelConfig::default());
        let a = task(&f, 1);
        let b = task(&f, 2);
        f.queue.add(a.clone());
        f.queue.add(b.clone());
        assert!(f.queue.remove(a.id));
        assert!(!f.queue.remove(a.id));
        assert_eq!(f.queue.tasks().len(), 1);
        assert_eq!(f.queue.clear(), 1);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn tasks_snapshot_is_in_dispatch_order() {
        let f = fixture(ChannelConfig::default());
        let mid = task(&f, 5);
        let top = task(&f, 9);
        let low = task(&f, 1);
        for t in [&mid, &top, &low] {
            f.queue.add(t.clone());
        }
        let order: Vec<_> = f.queue.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec![top.id, mid.id, low.id]);
    }

    #[tokio::test]
    async fn lock_marks_running_and_is_exclusive() {
        let f = fixture(ChannelConfig::default());
        let mut a = task(&f, 1);
        let mut b = task(&f, 2);
        f.store.create_task(&a).await.unwrap();
        f.store.create_task(&b).await.unwrap();

        let permit = f
            .queue
            .acquire_lock(&mut a, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.status, TaskStatus::Running);
        assert_eq!(f.store.get_task(a.id).await.unwrap().unwrap().status, TaskStatus::Running);
        assert!(f.queue.is_executing());
        assert_eq!(f.queue.current_task(), Some(a.id));

        let second = f
            .queue
            .acquire_lock(&mut b, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(b.status, TaskStatus::Pending);

        drop(permit);
        assert!(!f.queue.is_executing());
        assert_eq!(f.queue.last_execution(), None, "drop does not stamp");

        let permit = f
            .queue
            .acquire_lock(&mut b, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        permit.release(true);
        assert_eq!(f.queue.last_execution(), Some(f.clock.now()));
    }

    #[test]
    fn overnight_window() {
        let f = fixture(ChannelConfig {
            daily_window: TimeWindow::parse("22:00", "02:00").unwrap(),
            ..ChannelConfig::default()
        });
        f.queue.add(task(&f, 1));
        assert!(f.queue.next().is_none());
        f.clock.set(local(23, 30));
        assert!(f.queue.next().is_some());
    }
}
