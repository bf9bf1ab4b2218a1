//! Scheduler: the orchestrator.
//!
//! A tick runs these gates in order and stops at the first that fails:
//!
//! 1. global work time (active hours and work days, canonical timezone)
//! 2. daily cap (store count of today's successes, and the limiter's quota)
//! 3. due sweep: due tasks from the store go to their queues, except those
//!    whose idempotency key is already held, which become Skipped
//! 4. per running, idle channel: next -> daily quota (counting executions
//!    still in flight) -> breaker -> lock -> reserve key -> executor on a
//!    spawned task
//!
//! The executor outcome is routed to the store, breaker, limiter and retry
//! handler; the channel's permit is released with a timestamp either way.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::fire_table::FireTable;
use super::status::{SchedulerStatus, TickReport, TickSkip};
use crate::config::{ConfigError, MAX_MISSED_WINDOW_MINS, PacerConfig};
use crate::domain::{Channel, ExecutionReport, Task, TaskId, TaskStatus, TransitionError};
use crate::guard::{
    CircuitBreaker, CircuitStatus, IdempotencyManager, RateLimiter, RateLimiterStatus,
    ReserveOutcome,
};
use crate::ports::{Clock, Executor, IdGenerator, StoreError, TaskStore};
use crate::queue::{
    AddOutcome, ChannelPreview, ChannelQueue, ExecutionPermit, QueueError, QueueManager,
    QueueManagerStatus, RetryError, RetryHandler, RetryStatus,
};

const INTERRUPTED: &str = "interrupted";
const DUPLICATE_NOTE: &str = "duplicate: already delivered today";

/// Start of the local calendar day containing `now`, as a UTC instant.
///
/// Goes through the local date so DST days (23h or 25h long) start at their
/// real midnight. A midnight skipped by a DST jump falls back to the first
/// local instant after it.
pub(crate) fn local_day_start(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let date = now.with_timezone(&tz).date_naive();
    (0..=2)
        .find_map(|hour| {
            let local = date.and_time(NaiveTime::MIN) + ChronoDuration::hours(hour);
            tz.from_local_datetime(&local).earliest()
        })
        .map_or(now, |start| start.with_timezone(&Utc))
}

/// One execution counted against today's quota until it finishes.
struct QuotaSlot(Arc<AtomicUsize>);

impl QuotaSlot {
    fn take(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task {0} is running and cannot be changed")]
    TaskRunning(TaskId),
}

impl From<QueueError> for SchedulerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Store(e) => SchedulerError::Store(e),
            QueueError::Transition(e) => SchedulerError::Transition(e),
        }
    }
}

/// Input of `schedule_task`.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub content_code: String,
    pub channel: Channel,
    pub target: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_retry: Option<u32>,
    pub payload: serde_json::Value,
}

impl TaskRequest {
    pub fn new(content_code: impl Into<String>, channel: Channel) -> Self {
        Self {
            content_code: content_code.into(),
            channel,
            target: None,
            scheduled_time: None,
            priority: 0,
            max_retry: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// What the startup recovery sweep found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub reloaded: usize,
    pub missed: usize,
}

pub(crate) struct Components {
    pub config: PacerConfig,
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<dyn Executor>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub queues: Arc<QueueManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub idempotency: Arc<IdempotencyManager>,
    pub limiter: Arc<RateLimiter>,
    pub retry: Arc<RetryHandler>,
}

pub struct Scheduler {
    config: RwLock<PacerConfig>,
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    queues: Arc<QueueManager>,
    breaker: Arc<CircuitBreaker>,
    idempotency: Arc<IdempotencyManager>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryHandler>,
    fire_table: Mutex<FireTable>,
    in_flight: AsyncMutex<JoinSet<()>>,
    not_before: Mutex<Option<DateTime<Utc>>>,
    /// Spawned executions whose outcome is not recorded yet.
    reserved: Arc<AtomicUsize>,
    running: AtomicBool,
}

impl Scheduler {
    pub(crate) fn from_components(c: Components) -> Self {
        Self {
            config: RwLock::new(c.config),
            store: c.store,
            executor: c.executor,
            clock: c.clock,
            ids: c.ids,
            queues: c.queues,
            breaker: c.breaker,
            idempotency: c.idempotency,
            limiter: c.limiter,
            retry: c.retry,
            fire_table: Mutex::new(FireTable::new()),
            in_flight: AsyncMutex::new(JoinSet::new()),
            not_before: Mutex::new(None),
            reserved: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> PacerConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn timezone(&self) -> Tz {
        self.config.read().unwrap_or_else(|e| e.into_inner()).timezone
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn retry_handler(&self) -> &Arc<RetryHandler> {
        &self.retry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        local_day_start(now, self.timezone())
    }

    /// True once today's successes plus executions still in flight reach
    /// either daily cap.
    fn quota_exhausted(&self, completed: u32) -> bool {
        let limit = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .schedule
            .daily_limit;
        let in_flight = u32::try_from(self.reserved.load(Ordering::SeqCst)).unwrap_or(u32::MAX);
        let used = completed
            .max(self.limiter.today_count())
            .saturating_add(in_flight);
        used >= limit || self.limiter.remaining_quota() <= in_flight
    }

    // ----- lifecycle -----

    /// Runs the recovery sweep and starts every queue.
    pub async fn start(&self) -> Result<RecoveryReport, SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return Ok(RecoveryReport::default());
        }
        let report = match self.recover().await {
            Ok(report) => report,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.queues.start_all();
        self.recompute_fire_table();
        info!(
            interrupted = report.interrupted,
            reloaded = report.reloaded,
            missed = report.missed,
            "scheduler started"
        );
        Ok(report)
    }

    async fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        let now = self.clock.now();
        let interrupted = self.store.mark_running_tasks_failed(INTERRUPTED, now).await?;
        if interrupted > 0 {
            warn!(count = interrupted, "running tasks from a previous run marked failed");
        }

        let completed = self.store.get_today_completed_count(self.day_start(now)).await?;
        self.limiter.seed_today_count(completed);

        let purged = self.idempotency.cleanup_expired().await?;
        if purged > 0 {
            debug!(count = purged, "expired idempotency keys purged");
        }

        let mut reloaded = 0;
        for task in self.store.get_pending_tasks().await? {
            if self.queues.add(task).is_accepted() {
                reloaded += 1;
            }
        }

        let missed = if self.config().schedule.enable_missed_recovery {
            self.check_missed_tasks().await?
        } else {
            0
        };
        Ok(RecoveryReport {
            interrupted,
            reloaded,
            missed,
        })
    }

    /// Stops dispatching. In-flight executions keep running; see `shutdown`.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.queues.stop_all();
            info!("scheduler stopped");
        }
    }

    /// Stops dispatching and waits for every in-flight execution.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait_idle().await;
        info!("scheduler shut down");
    }

    /// Waits until every spawned execution has finished.
    pub async fn wait_idle(&self) {
        let mut set = self.in_flight.lock().await;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "execution task panicked or was cancelled");
            }
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    // ----- ticking -----

    pub async fn tick(self: &Arc<Self>) -> Result<TickReport, SchedulerError> {
        let fired = self
            .fire_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_due(&self.queues, self.clock.now());
        if !fired.is_empty() {
            debug!(channels = ?fired, "fixed-minute fire");
        }
        if !self.is_running() {
            return Ok(TickReport::skipped(TickSkip::NotRunning));
        }
        self.breaker.refresh();
        self.reap_finished().await;

        let now = self.clock.now();
        let config = self.config();
        let local = now.with_timezone(&config.timezone);
        if !config.schedule.is_work_time(&local) {
            debug!(local = %local, "outside work time");
            return Ok(TickReport::skipped(TickSkip::OutsideWorkTime));
        }

        let completed = self.store.get_today_completed_count(self.day_start(now)).await?;
        if completed >= config.schedule.daily_limit || !self.limiter.can_send_today() {
            info!(completed, limit = config.schedule.daily_limit, "daily limit reached");
            return Ok(TickReport::skipped(TickSkip::DailyLimitReached));
        }

        let mut report = TickReport::default();
        let (enqueued, duplicates) = self.sweep_due(now).await?;
        report.enqueued = enqueued;
        report.duplicates = duplicates;

        let not_before = *self.not_before.lock().unwrap_or_else(|e| e.into_inner());
        if self.limiter.adaptive_pacing()
            && let Some(at) = not_before
            && now < at
        {
            debug!(not_before = %at, "adaptive pacing holds dispatch");
            report.skipped = Some(TickSkip::Pacing);
            return Ok(report);
        }

        for channel in self.queues.channels() {
            let Some(queue) = self.queues.get(&channel) else {
                continue;
            };
            if !queue.is_running() || queue.is_paused() || queue.is_executing() {
                continue;
            }
            match self.dispatch_channel(&queue, completed).await {
                Ok(Some(id)) => report.dispatched.push(id),
                Ok(None) => {}
                Err(e) => error!(%channel, error = %e, "dispatch failed"),
            }
        }

        Ok(report)
    }

    /// Dispatches on one channel right away, outside the tick gates.
    pub async fn run_channel_once(
        self: &Arc<Self>,
        channel: &Channel,
    ) -> Result<Option<TaskId>, SchedulerError> {
        let Some(queue) = self.queues.get(channel) else {
            return Ok(None);
        };
        if queue.is_executing() {
            debug!(%channel, "channel busy");
            return Ok(None);
        }
        let completed = self
            .store
            .get_today_completed_count(self.day_start(self.clock.now()))
            .await?;
        self.dispatch_channel(&queue, completed).await
    }

    async fn reap_finished(&self) {
        let mut set = self.in_flight.lock().await;
        while let Some(joined) = set.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "execution task panicked or was cancelled");
            }
        }
    }

    /// Due tasks from the store into their queues.
    async fn sweep_due(&self, now: DateTime<Utc>) -> Result<(usize, usize), SchedulerError> {
        let mut enqueued = 0;
        let mut duplicates = 0;
        for mut task in self.store.get_due_tasks(now).await? {
            if self.queues.contains(task.id) {
                continue;
            }
            if self.idempotency.is_duplicate(&task).await? {
                task.transition(TaskStatus::Skipped, now)?;
                task.note = Some(DUPLICATE_NOTE.to_string());
                self.store.update_task(&task).await?;
                info!(task_id = %task.id, channel = %task.channel, "due task skipped as duplicate");
                duplicates += 1;
                continue;
            }
            match self.queues.add(task) {
                AddOutcome::Accepted => enqueued += 1,
                outcome => debug!(?outcome, "due task not enqueued"),
            }
        }
        if enqueued > 0 || duplicates > 0 {
            debug!(enqueued, duplicates, "due sweep");
        }
        Ok((enqueued, duplicates))
    }

    /// Due tasks whose scheduled time falls inside the look-back window,
    /// typically ticks missed while the process was down. They are queued
    /// (a task already queued stays where it is) and counted.
    pub async fn check_missed_tasks(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let window_start =
            now - ChronoDuration::minutes(
                self.config()
                    .schedule
                    .missed_task_window_mins
                    .clamp(0, MAX_MISSED_WINDOW_MINS),
            );
        let missed: Vec<Task> = self
            .store
            .get_due_tasks(now)
            .await?
            .into_iter()
            .filter(|t| t.scheduled_time.is_some_and(|at| at >= window_start))
            .collect();
        for task in &missed {
            warn!(task_id = %task.id, scheduled_time = ?task.scheduled_time, "missed task detected");
            self.queues.add(task.clone());
        }
        if !missed.is_empty() {
            info!(count = missed.len(), "missed tasks queued");
        }
        Ok(missed.len())
    }

    /// One channel: pull candidates until one reaches the executor, the
    /// channel runs dry, a gate refuses, or too many duplicates were skipped.
    async fn dispatch_channel(
        self: &Arc<Self>,
        queue: &Arc<ChannelQueue>,
        completed: u32,
    ) -> Result<Option<TaskId>, SchedulerError> {
        let (max_skip, lock_timeout) = {
            let c = self.config.read().unwrap_or_else(|e| e.into_inner());
            (
                c.schedule.max_skip_per_dispatch,
                Duration::from_millis(c.schedule.lock_timeout_ms),
            )
        };
        let channel = queue.channel().clone();
        let mut skipped = 0;

        while let Some(mut task) = queue.next() {
            if self.quota_exhausted(completed) {
                info!(%channel, task_id = %task.id, "daily quota used up, task stays queued");
                queue.add(task);
                return Ok(None);
            }

            // circuit が開いていればタスクはキューに戻すだけ
            if !self.breaker.can_execute() {
                info!(%channel, task_id = %task.id, "circuit open, task stays queued");
                queue.add(task);
                return Ok(None);
            }

            let permit = match queue.acquire_lock(&mut task, lock_timeout).await {
                Ok(Some(permit)) => permit,
                Ok(None) => {
                    queue.add(task);
                    self.breaker.release_probe();
                    return Ok(None);
                }
                Err(e) => {
                    queue.add(task);
                    self.breaker.release_probe();
                    return Err(e.into());
                }
            };

            match self.idempotency.check_and_record(&task).await {
                Ok(ReserveOutcome::Reserved) => {
                    let id = task.id;
                    self.spawn_execution(task, permit).await;
                    return Ok(Some(id));
                }
                Ok(ReserveOutcome::Duplicate) => {
                    let persisted = self.skip_running_duplicate(&mut task).await;
                    permit.release(false);
                    self.breaker.release_probe();
                    persisted?;
                    skipped += 1;
                    if skipped >= max_skip {
                        warn!(%channel, skipped, "too many duplicates in one dispatch");
                        return Ok(None);
                    }
                }
                Err(e) => {
                    error!(%channel, task_id = %task.id, error = %e, "idempotency check failed");
                    self.fail_without_execution(&mut task, &e.to_string()).await;
                    permit.release(false);
                    self.breaker.release_probe();
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    async fn skip_running_duplicate(&self, task: &mut Task) -> Result<(), SchedulerError> {
        task.transition(TaskStatus::Skipped, self.clock.now())?;
        task.note = Some(DUPLICATE_NOTE.to_string());
        self.store.update_task(task).await?;
        info!(task_id = %task.id, channel = %task.channel, "task skipped as duplicate");
        Ok(())
    }

    /// A task that reached Running but could not be attempted goes back
    /// through the retry path.
    async fn fail_without_execution(&self, task: &mut Task, error: &str) {
        let now = self.clock.now();
        if let Err(e) = task.transition(TaskStatus::Failed, now) {
            error!(task_id = %task.id, error = %e, "cannot mark task failed");
            return;
        }
        task.error_message = Some(error.to_string());
        if let Err(e) = self.store.update_task(task).await {
            error!(task_id = %task.id, error = %e, "failed to persist failure");
        }
        if let Err(e) = self.retry.schedule_retry(task, error).await {
            error!(task_id = %task.id, error = %e, "failed to schedule retry");
        }
    }

    async fn spawn_execution(self: &Arc<Self>, task: Task, permit: ExecutionPermit) {
        let this = Arc::clone(self);
        let slot = QuotaSlot::take(&self.reserved);
        let mut set = self.in_flight.lock().await;
        set.spawn(async move {
            this.execute(task, permit).await;
            drop(slot);
        });
    }

    async fn execute(&self, mut task: Task, permit: ExecutionPermit) {
        info!(task_id = %task.id, channel = %task.channel, content = %task.content_code, "executing task");
        let outcome = match self.executor.execute(&task).await {
            Ok(report) if report.is_success() => Ok(report),
            Ok(report) => Err(report
                .message
                .unwrap_or_else(|| "executor reported failure".to_string())),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(report) => self.record_success(&mut task, report).await,
            Err(error) => self.record_failure(&mut task, &error).await,
        }
        permit.release(true);

        if self.limiter.adaptive_pacing() {
            let at = self.limiter.next_send_time();
            *self.not_before.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
            debug!(not_before = %at, "next attempt not before");
        }
    }

    async fn record_success(&self, task: &mut Task, report: ExecutionReport) {
        let now = self.clock.now();
        task.executed_at = Some(now);
        task.error_message = None;
        if let Err(e) = task.transition(TaskStatus::Success, now) {
            error!(task_id = %task.id, error = %e, "cannot mark task successful");
        } else if let Err(e) = self.store.update_task(task).await {
            error!(task_id = %task.id, error = %e, "failed to persist success");
        }
        self.breaker.record_success();
        self.limiter.record_result(true);
        info!(
            task_id = %task.id,
            channel = %task.channel,
            artifacts = report.artifacts.len(),
            message = report.message.as_deref().unwrap_or(""),
            "task succeeded"
        );
    }

    async fn record_failure(&self, task: &mut Task, error: &str) {
        warn!(task_id = %task.id, channel = %task.channel, error, "task failed");
        let now = self.clock.now();
        task.executed_at = Some(now);
        if let Err(e) = task.transition(TaskStatus::Failed, now) {
            error!(task_id = %task.id, error = %e, "cannot mark task failed");
        } else {
            task.error_message = Some(error.to_string());
            if let Err(e) = self.store.update_task(task).await {
                error!(task_id = %task.id, error = %e, "failed to persist failure");
            }
        }

        if let Err(e) = self.idempotency.remove(task).await {
            error!(task_id = %task.id, error = %e, "failed to release idempotency key");
        }
        match self.retry.schedule_retry(task, error).await {
            Ok(Some(at)) => debug!(task_id = %task.id, retry_at = %at, "task will be retried"),
            Ok(None) => info!(task_id = %task.id, "task failed permanently"),
            Err(e) => error!(task_id = %task.id, error = %e, "failed to schedule retry"),
        }
        self.breaker.record_failure(error);
        self.limiter.record_result(false);
    }

    // ----- task operations -----

    /// Creates a task. Unscheduled tasks are Pending, scheduled ones
    /// Scheduled; either way it is persisted and queued.
    pub async fn schedule_task(&self, request: TaskRequest) -> Result<Task, SchedulerError> {
        let now = self.clock.now();
        let mut task = Task::new(
            self.ids.generate_task_id(),
            request.content_code,
            request.channel,
            now,
        )
        .with_priority(request.priority)
        .with_payload(request.payload);
        if let Some(target) = request.target {
            task = task.with_target(target);
        }
        if let Some(max_retry) = request.max_retry {
            task = task.with_max_retry(max_retry);
        }
        if let Some(at) = request.scheduled_time {
            task = task.with_scheduled_time(at);
            task.transition(TaskStatus::Scheduled, now)?;
        }

        self.store.create_task(&task).await?;
        let outcome = self.queues.add(task.clone());
        info!(
            task_id = %task.id,
            channel = %task.channel,
            scheduled_time = ?task.scheduled_time,
            priority = task.priority,
            ?outcome,
            "task scheduled"
        );
        Ok(task)
    }

    async fn load(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(SchedulerError::Store(StoreError::NotFound(id)))
    }

    /// Cancels a task that has not started. Returns false for tasks that
    /// already finished.
    pub async fn cancel_task(&self, id: TaskId, reason: Option<&str>) -> Result<bool, SchedulerError> {
        let mut task = self.load(id).await?;
        if task.status == TaskStatus::Running {
            return Err(SchedulerError::TaskRunning(id));
        }
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            debug!(task_id = %id, status = %task.status, "task not cancellable");
            return Ok(false);
        }
        self.queues.remove_anywhere(id);
        task.transition(TaskStatus::Cancelled, self.clock.now())?;
        task.note = reason.map(str::to_string);
        self.store.update_task(&task).await?;
        info!(task_id = %id, "task cancelled");
        Ok(true)
    }

    /// Moves a queued task to a new time and re-queues it.
    pub async fn reschedule_task(
        &self,
        id: TaskId,
        at: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        let mut task = self.load(id).await?;
        if task.status == TaskStatus::Running {
            return Err(SchedulerError::TaskRunning(id));
        }
        let now = self.clock.now();
        task.transition(TaskStatus::Scheduled, now)?;
        task.scheduled_time = Some(at);
        self.store.update_task(&task).await?;
        self.queues.remove_anywhere(id);
        self.queues.add(task.clone());
        info!(task_id = %id, scheduled_time = %at, "task rescheduled");
        Ok(task)
    }

    /// Holds a Pending task out of dispatch until `resume_task`.
    pub async fn pause_task(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let mut task = self.load(id).await?;
        task.transition(TaskStatus::Paused, self.clock.now())?;
        self.store.update_task(&task).await?;
        self.queues.remove_anywhere(id);
        info!(task_id = %id, "task paused");
        Ok(task)
    }

    pub async fn resume_task(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let mut task = self.load(id).await?;
        task.transition(TaskStatus::Pending, self.clock.now())?;
        self.store.update_task(&task).await?;
        self.queues.add(task.clone());
        info!(task_id = %id, "task resumed");
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>, SchedulerError> {
        Ok(self.store.get_task(id).await?)
    }

    // ----- configuration -----

    /// Validates `config` and pushes it into every component.
    pub fn apply_config(&self, config: PacerConfig) -> Result<(), SchedulerError> {
        config.validate()?;
        self.queues.reconfigure(config.clone());
        self.breaker.reconfigure(config.circuit_breaker.clone());
        self.limiter.reconfigure(config.rate_limit.clone(), config.timezone);
        self.retry.reconfigure(&config.retry);
        self.idempotency.reconfigure(config.timezone, &config.idempotency);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        self.recompute_fire_table();
        info!("configuration applied");
        Ok(())
    }

    fn recompute_fire_table(&self) {
        let now = self.clock.now();
        self.fire_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recompute(&self.queues, now);
    }

    /// Earliest fixed-minute fire time across channels.
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.fire_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .earliest()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.config().schedule.tick_interval_secs)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ----- status -----

    pub async fn scheduler_status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let now = self.clock.now();
        let config = self.config();
        let today_completed = self.store.get_today_completed_count(self.day_start(now)).await?;
        let fire_times = self
            .fire_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries()
            .clone();
        let not_before = *self.not_before.lock().unwrap_or_else(|e| e.into_inner());
        let in_flight = self.in_flight().await;
        Ok(SchedulerStatus {
            running: self.is_running(),
            now,
            timezone: config.timezone,
            within_work_time: config
                .schedule
                .is_work_time(&now.with_timezone(&config.timezone)),
            daily_limit: config.schedule.daily_limit,
            today_completed,
            in_flight,
            not_before,
            fire_times,
            queues: self.queues.status(),
            circuit: self.breaker.status(),
            rate_limiter: self.limiter.status(),
            retry: self.retry.status(),
        })
    }

    pub fn queue_status(&self) -> QueueManagerStatus {
        self.queues.status()
    }

    pub fn next_task_preview(&self) -> ChannelPreview {
        self.queues.preview()
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        self.breaker.status()
    }

    pub fn rate_limiter_status(&self) -> RateLimiterStatus {
        self.limiter.status()
    }

    pub fn retry_status(&self) -> RetryStatus {
        self.retry.status()
    }
}
