//! Routes tasks to per-channel queues.
//!
//! The three builtin channels exist from construction. A custom channel's
//! queue is created on first use with the channel config from `PacerConfig`
//! (or the defaults), and is started if the manager is running.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::channel_queue::{AddOutcome, BlockReason, ChannelPreview, ChannelQueue, ChannelStatus};
use crate::config::{ChannelConfig, PacerConfig, ScheduleMode, TimeWindow};
use crate::domain::{BuiltinChannel, Channel, Task, TaskId};
use crate::guard::{CircuitListener, CircuitStatus};
use crate::ports::{Clock, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueManagerStatus {
    pub total_size: usize,
    pub is_running: bool,
    pub all_paused: bool,
    pub any_executing: bool,
    pub channels: BTreeMap<Channel, ChannelStatus>,
}

struct ManagerSettings {
    config: PacerConfig,
    running: bool,
}

pub struct QueueManager {
    queues: RwLock<BTreeMap<Channel, Arc<ChannelQueue>>>,
    settings: RwLock<ManagerSettings>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    pub fn new(config: PacerConfig, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        let mut queues = BTreeMap::new();
        let mut configured: Vec<Channel> = Channel::builtins().collect();
        configured.extend(config.schedule.channels.keys().filter(|c| c.is_custom()).cloned());
        for channel in configured {
            let queue = ChannelQueue::new(
                channel.clone(),
                config.channel(&channel),
                config.timezone,
                store.clone(),
                clock.clone(),
            );
            queues.insert(channel, Arc::new(queue));
        }
        info!(channels = queues.len(), "queue manager initialised");
        Self {
            queues: RwLock::new(queues),
            settings: RwLock::new(ManagerSettings {
                config,
                running: false,
            }),
            store,
            clock,
        }
    }

    /// Existing queue for `channel`, if any.
    pub fn get(&self, channel: &Channel) -> Option<Arc<ChannelQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
    }

    /// Queue for `channel`, creating it for a custom channel seen first here.
    pub fn queue(&self, channel: &Channel) -> Arc<ChannelQueue> {
        if let Some(queue) = self.get(channel) {
            return queue;
        }
        let (config, timezone, running) = {
            let s = self.settings.read().unwrap_or_else(|e| e.into_inner());
            (s.config.channel(channel), s.config.timezone, s.running)
        };
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(channel.clone())
            .or_insert_with(|| {
                info!(%channel, "creating queue for custom channel");
                let queue = ChannelQueue::new(
                    channel.clone(),
                    config,
                    timezone,
                    self.store.clone(),
                    self.clock.clone(),
                );
                if running {
                    queue.start();
                }
                Arc::new(queue)
            })
            .clone()
    }

    /// Registers `channel` with an explicit config, replacing the config of
    /// an existing queue.
    pub fn declare_channel(&self, channel: &Channel, config: ChannelConfig) -> Arc<ChannelQueue> {
        let queue = self.queue(channel);
        queue.reconfigure(config.clone());
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .config
            .schedule
            .channels
            .insert(channel.clone(), config);
        queue
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<Arc<ChannelQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn add(&self, task: Task) -> AddOutcome {
        self.queue(&task.channel).add(task)
    }

    pub fn next(&self, channel: &Channel) -> Option<Task> {
        self.get(channel).and_then(|q| q.next())
    }

    pub fn remove(&self, channel: &Channel, id: TaskId) -> bool {
        self.get(channel).is_some_and(|q| q.remove(id))
    }

    /// Removes `id` from whichever queue holds it.
    pub fn remove_anywhere(&self, id: TaskId) -> bool {
        self.all().iter().any(|q| q.remove(id))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.all().iter().any(|q| q.contains(id))
    }

    pub fn total_size(&self) -> usize {
        self.all().iter().map(|q| q.len()).sum()
    }

    pub fn is_running(&self) -> bool {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn start_all(&self) {
        self.settings.write().unwrap_or_else(|e| e.into_inner()).running = true;
        for q in self.all() {
            q.start();
        }
        info!("all channel queues started");
    }

    pub fn stop_all(&self) {
        self.settings.write().unwrap_or_else(|e| e.into_inner()).running = false;
        for q in self.all() {
            q.stop();
        }
        info!("all channel queues stopped");
    }

    pub fn pause_all(&self) {
        for q in self.all() {
            q.pause();
        }
    }

    pub fn resume_all(&self) {
        for q in self.all() {
            q.resume();
        }
    }

    /// Pauses every running channel and returns the ones it paused.
    pub fn pause_running(&self) -> Vec<Channel> {
        let mut paused = Vec::new();
        for q in self.all() {
            if q.is_running() && !q.is_paused() {
                q.pause();
                paused.push(q.channel().clone());
            }
        }
        paused
    }

    pub fn clear_all(&self) -> usize {
        self.all().iter().map(|q| q.clear()).sum()
    }

    pub fn start_channel(&self, channel: &Channel) {
        self.queue(channel).start();
    }

    pub fn stop_channel(&self, channel: &Channel) -> bool {
        self.get(channel).map(|q| q.stop()).is_some()
    }

    pub fn pause_channel(&self, channel: &Channel) -> bool {
        self.get(channel).map(|q| q.pause()).is_some()
    }

    pub fn resume_channel(&self, channel: &Channel) -> bool {
        self.get(channel).map(|q| q.resume()).is_some()
    }

    pub fn clear_channel(&self, channel: &Channel) -> usize {
        self.get(channel).map_or(0, |q| q.clear())
    }

    pub fn set_schedule_mode(&self, channel: &Channel, mode: ScheduleMode) {
        self.queue(channel).set_schedule_mode(mode);
    }

    pub fn set_interval(&self, channel: &Channel, interval_secs: u64) {
        self.queue(channel).set_interval(interval_secs);
    }

    pub fn set_minute_of_hour(&self, channel: &Channel, minute: u32) {
        self.queue(channel).set_minute_of_hour(minute);
    }

    pub fn set_daily_window(&self, channel: &Channel, window: TimeWindow) {
        self.queue(channel).set_daily_window(window);
    }

    pub fn channel_config(&self, channel: &Channel) -> ChannelConfig {
        match self.get(channel) {
            Some(q) => q.config(),
            None => self
                .settings
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .config
                .channel(channel),
        }
    }

    /// Pushes a new configuration to every queue, creating queues for custom
    /// channels that appear in it.
    pub fn reconfigure(&self, config: PacerConfig) {
        let custom: Vec<Channel> = config
            .schedule
            .channels
            .keys()
            .filter(|c| c.is_custom())
            .cloned()
            .collect();
        let timezone = config.timezone;
        let snapshot = config.clone();
        self.settings.write().unwrap_or_else(|e| e.into_inner()).config = config;
        for channel in custom {
            self.queue(&channel);
        }
        for q in self.all() {
            q.set_timezone(timezone);
            q.reconfigure(snapshot.channel(q.channel()));
        }
    }

    pub fn channel_status(&self, channel: &Channel) -> Option<ChannelStatus> {
        self.get(channel).map(|q| q.status())
    }

    pub fn status(&self) -> QueueManagerStatus {
        let channels: BTreeMap<_, _> = self
            .all()
            .iter()
            .map(|q| (q.channel().clone(), q.status()))
            .collect();
        QueueManagerStatus {
            total_size: channels.values().map(|s| s.queue_size).sum(),
            is_running: self.is_running(),
            all_paused: !channels.is_empty() && channels.values().all(|s| s.is_paused),
            any_executing: channels.values().any(|s| s.is_executing),
            channels,
        }
    }

    /// Per-channel previews in channel order.
    pub fn previews(&self) -> Vec<ChannelPreview> {
        self.all().iter().map(|q| q.preview()).collect()
    }

    /// The task most likely to run next across all channels.
    ///
    /// A runnable candidate wins over a blocked one; ties go to the earliest
    /// next time, then the higher priority. With no candidate anywhere the
    /// result carries no task and says why (`QueueEmpty` when every queue
    /// is empty).
    pub fn preview(&self) -> ChannelPreview {
        let previews = self.previews();
        let best = previews
            .iter()
            .filter(|p| p.task.is_some())
            .min_by(|a, b| {
                let rank = |p: &ChannelPreview| if p.is_ready() { 0 } else { 1 };
                let priority = |p: &ChannelPreview| p.task.as_ref().map_or(0, |t| t.priority);
                rank(a)
                    .cmp(&rank(b))
                    .then_with(|| a.next_time.cmp(&b.next_time))
                    .then_with(|| priority(b).cmp(&priority(a)))
            });
        if let Some(best) = best {
            return best.clone();
        }
        // 候補なし: 空でないキューがあればその理由を優先する
        previews
            .iter()
            .find(|p| p.reason != Some(BlockReason::QueueEmpty))
            .or_else(|| previews.first())
            .cloned()
            .unwrap_or_else(|| ChannelPreview {
                channel: BuiltinChannel::Feed.into(),
                task: None,
                reason: Some(BlockReason::QueueEmpty),
                next_time: None,
            })
    }
}

/// Pauses running channels while the breaker is open and resumes exactly
/// those channels once it probes or closes.
pub struct QueuePausingListener {
    manager: Arc<QueueManager>,
    paused: Mutex<Vec<Channel>>,
}

impl QueuePausingListener {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        Self {
            manager,
            paused: Mutex::new(Vec::new()),
        }
    }

    fn resume_paused(&self) {
        let channels = std::mem::take(&mut *self.paused.lock().unwrap_or_else(|e| e.into_inner()));
        if channels.is_empty() {
            return;
        }
        for channel in &channels {
            self.manager.resume_channel(channel);
        }
        info!(count = channels.len(), "resumed queues paused by circuit breaker");
    }
}

impl CircuitListener for QueuePausingListener {
    fn on_open(&self, _status: &CircuitStatus) {
        let newly = self.manager.pause_running();
        info!(count = newly.len(), "paused queues while circuit is open");
        self.paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(newly);
    }

    fn on_half_open(&self, _status: &CircuitStatus) {
        self.resume_paused();
    }

    fn on_close(&self, _status: &CircuitStatus) {
        self.resume_paused();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuiltinChannel;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use crate::queue::BlockReason;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use ulid::Ulid;

    fn manager() -> (QueueManager, FixedClock) {
        // 10:30 Shanghai.
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 2, 30, 0).unwrap());
        let manager = QueueManager::new(
            PacerConfig::default(),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    fn task(channel: Channel, priority: i32, now: DateTime<Utc>) -> Task {
        Task::new(TaskId::from_ulid(Ulid::new()), "C-1", channel, now).with_priority(priority)
    }

    fn open_status() -> CircuitStatus {
        crate::guard::CircuitBreaker::new(
            crate::config::CircuitBreakerConfig::default(),
            Arc::new(FixedClock::new(Utc::now())),
            Arc::new(crate::ports::TracingAlertSink),
        )
        .status()
    }

    #[test]
    fn builtin_channels_exist_and_custom_ones_are_created_on_demand() {
        let (manager, clock) = manager();
        assert_eq!(manager.channels().len(), 3);

        let custom = Channel::custom("vip").unwrap();
        assert!(manager.get(&custom).is_none());
        manager.start_all();
        assert!(manager.add(task(custom.clone(), 1, clock.now())).is_accepted());
        assert_eq!(manager.channels().len(), 4);
        assert!(manager.get(&custom).unwrap().is_running());
    }

    #[test]
    fn routes_by_channel() {
        let (manager, clock) = manager();
        manager.start_all();
        let feed = task(BuiltinChannel::Feed.into(), 1, clock.now());
        let agents = task(BuiltinChannel::AgentGroup.into(), 1, clock.now());
        manager.add(feed.clone());
        manager.add(agents.clone());

        assert_eq!(manager.total_size(), 2);
        assert_eq!(manager.next(&BuiltinChannel::Feed.into()).unwrap().id, feed.id);
        assert!(manager.next(&BuiltinChannel::CustomerGroup.into()).is_none());
        assert!(manager.remove_anywhere(agents.id));
        assert_eq!(manager.total_size(), 0);
    }

    #[test]
    fn preview_prefers_runnable_candidates() {
        let (manager, clock) = manager();
        manager.start_all();
        let later = task(BuiltinChannel::Feed.into(), 99, clock.now())
            .with_scheduled_time(clock.now() + Duration::hours(1));
        let now = task(BuiltinChannel::AgentGroup.into(), 1, clock.now());
        manager.add(later);
        manager.add(now.clone());

        let p = manager.preview();
        assert!(p.is_ready());
        assert_eq!(p.task.unwrap().id, now.id);
    }

    #[test]
    fn preview_reports_not_started() {
        let (manager, clock) = manager();
        manager.add(task(BuiltinChannel::Feed.into(), 1, clock.now()));
        let p = manager.preview();
        assert_eq!(p.reason, Some(BlockReason::NotStarted));
    }

    #[test]
    fn preview_of_empty_queues_says_so() {
        let (manager, _) = manager();
        manager.start_all();
        let p = manager.preview();
        assert!(p.task.is_none());
        assert!(!p.is_ready());
        assert_eq!(p.reason, Some(BlockReason::QueueEmpty));
        assert_eq!(p.reason.unwrap().to_string(), "queue empty");
    }

    #[test]
    fn status_aggregates_channels() {
        let (manager, clock) = manager();
        manager.start_all();
        manager.add(task(BuiltinChannel::Feed.into(), 1, clock.now()));
        manager.pause_channel(&BuiltinChannel::Feed.into());
        let status = manager.status();
        assert_eq!(status.total_size, 1);
        assert!(!status.all_paused);
        assert!(status.channels[&Channel::from(BuiltinChannel::Feed)].is_paused);

        manager.pause_all();
        assert!(manager.status().all_paused);
    }

    #[test]
    fn listener_resumes_only_what_it_paused() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        manager.start_all();
        manager.stop_channel(&BuiltinChannel::CustomerGroup.into());
        let listener = QueuePausingListener::new(manager.clone());
        let status = open_status();

        listener.on_open(&status);
        assert!(manager.get(&BuiltinChannel::Feed.into()).unwrap().is_paused());

        listener.on_half_open(&status);
        assert!(manager.get(&BuiltinChannel::Feed.into()).unwrap().is_running());
        assert!(!manager.get(&BuiltinChannel::CustomerGroup.into()).unwrap().is_running());
    }

    #[test]
    fn reconfigure_reaches_every_queue() {
        let (manager, _) = manager();
        let mut config = PacerConfig::default();
        config.schedule.channels.insert(
            BuiltinChannel::Feed.into(),
            ChannelConfig {
                interval_secs: 30,
                ..ChannelConfig::default()
            },
        );
        config
            .schedule
            .channels
            .insert(Channel::custom("vip").unwrap(), ChannelConfig::default());
        manager.reconfigure(config);

        assert_eq!(manager.channel_config(&BuiltinChannel::Feed.into()).interval_secs, 30);
        assert_eq!(manager.channels().len(), 4);
    }

    #[test]
    fn declared_channel_keeps_its_config() {
        let (manager, _) = manager();
        let vip = Channel::custom("vip").unwrap();
        manager.declare_channel(
            &vip,
            ChannelConfig {
                mode: ScheduleMode::FixedMinute,
                minute_of_hour: 70,
                ..ChannelConfig::default()
            },
        );
        let config = manager.channel_config(&vip);
        assert_eq!(config.mode, ScheduleMode::FixedMinute);
        assert_eq!(config.minute_of_hour, 59, "clamped");
    }
}
