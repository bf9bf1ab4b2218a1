//! Scheduler configuration.
//!
//! Loaded from TOML. Every field has a default so a partial file (or none at
//! all) yields a usable config; `validate` rejects values the components
//! cannot honour.
//!
//! ```toml
//! timezone = "Asia/Shanghai"
//!
//! [schedule]
//! daily_limit = 200
//! active_hours = { start = "09:00", end = "18:00" }
//!
//! [schedule.channels.feed]
//! mode = "fixed_minute"
//! minute_of_hour = 15
//!
//! [schedule.channels.custom_vip]
//! interval_secs = 600
//! daily_window = { start = "20:00", end = "02:00" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Datelike, NaiveTime, TimeDelta, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::Channel;

/// Upper bounds enforced by `validate`.
pub const MAX_TICK_INTERVAL_SECS: u64 = 3_600;
pub const MAX_LOCK_TIMEOUT_MS: u64 = 600_000;
pub const MAX_INTERVAL_SECS: u64 = 7 * 86_400;
pub const MAX_MISSED_WINDOW_MINS: i64 = 7 * 24 * 60;
pub const MAX_RETRY_DELAY_SECS: u64 = 7 * 86_400;
pub const MAX_RECOVERY_TIMEOUT_SECS: u64 = 86_400;
pub const MAX_PACING_SECS: u64 = 86_400;
pub const MAX_KEY_TTL_HOURS: i64 = 30 * 24;

/// `secs` as a chrono delta, saturating at `TimeDelta::MAX`.
pub(crate) fn delta_secs(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Canonical timezone for every day boundary, window and idempotency key.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

fn default_timezone() -> Tz {
    chrono_tz::Asia::Shanghai
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

impl PacerConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.schedule;
        if s.tick_interval_secs == 0 {
            return Err(invalid("schedule.tick_interval_secs must be at least 1"));
        }
        if s.tick_interval_secs > MAX_TICK_INTERVAL_SECS {
            return Err(invalid(format!(
                "schedule.tick_interval_secs must be at most {MAX_TICK_INTERVAL_SECS}"
            )));
        }
        if s.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(invalid(format!(
                "schedule.lock_timeout_ms must be at most {MAX_LOCK_TIMEOUT_MS}"
            )));
        }
        if !(0..=MAX_MISSED_WINDOW_MINS).contains(&s.missed_task_window_mins) {
            return Err(invalid(format!(
                "schedule.missed_task_window_mins must be 0-{MAX_MISSED_WINDOW_MINS}"
            )));
        }
        if s.max_skip_per_dispatch == 0 {
            return Err(invalid("schedule.max_skip_per_dispatch must be at least 1"));
        }
        if let Some(day) = s.work_days.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(invalid(format!(
                "schedule.work_days entries must be 1 (Mon) to 7 (Sun), got {day}"
            )));
        }
        for (channel, cfg) in &s.channels {
            if cfg.interval_secs > MAX_INTERVAL_SECS {
                return Err(invalid(format!(
                    "schedule.channels.{channel}.interval_secs must be at most {MAX_INTERVAL_SECS}, got {}",
                    cfg.interval_secs
                )));
            }
            if cfg.minute_of_hour > 59 {
                return Err(invalid(format!(
                    "schedule.channels.{channel}.minute_of_hour must be 0-59, got {}",
                    cfg.minute_of_hour
                )));
            }
        }

        if self.retry.base_delay_secs == 0 {
            return Err(invalid("retry.base_delay_secs must be at least 1"));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(invalid("retry.max_delay_secs must be >= retry.base_delay_secs"));
        }
        if self.retry.max_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(invalid(format!(
                "retry.max_delay_secs must be at most {MAX_RETRY_DELAY_SECS}"
            )));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }
        if cb.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls must be at least 1"));
        }
        if cb.recovery_timeout_secs > MAX_RECOVERY_TIMEOUT_SECS {
            return Err(invalid(format!(
                "circuit_breaker.recovery_timeout_secs must be at most {MAX_RECOVERY_TIMEOUT_SECS}"
            )));
        }

        let rl = &self.rate_limit;
        if rl.jitter_min_secs > rl.jitter_max_secs {
            return Err(invalid("rate_limit.jitter_min_secs must be <= jitter_max_secs"));
        }
        let pacing = MAX_PACING_SECS as i64;
        if rl.base_interval_secs > MAX_PACING_SECS
            || !(-pacing..=pacing).contains(&rl.jitter_min_secs)
            || !(-pacing..=pacing).contains(&rl.jitter_max_secs)
        {
            return Err(invalid(format!(
                "rate_limit base interval and jitter must lie within {MAX_PACING_SECS}s"
            )));
        }
        if !(0.0..=1.0).contains(&rl.failure_rate_low)
            || !(0.0..=1.0).contains(&rl.failure_rate_high)
            || rl.failure_rate_low > rl.failure_rate_high
        {
            return Err(invalid(
                "rate_limit failure rates must satisfy 0 <= low <= high <= 1",
            ));
        }
        if rl.window_size == 0 {
            return Err(invalid("rate_limit.window_size must be at least 1"));
        }

        if !(24..=MAX_KEY_TTL_HOURS).contains(&self.idempotency.key_ttl_hours) {
            return Err(invalid(format!(
                "idempotency.key_ttl_hours must be 24-{MAX_KEY_TTL_HOURS}"
            )));
        }
        Ok(())
    }

    /// Configuration of `channel`, falling back to the channel defaults.
    pub fn channel(&self, channel: &Channel) -> ChannelConfig {
        self.schedule
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// A wall-clock window such as `08:00-22:00`. A window whose start is after
/// its end wraps midnight. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hh_mm")]
    pub start: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parses `"HH:MM"` pairs.
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            start: hh_mm::parse(start).map_err(|e| invalid(e.to_string()))?,
            end: hh_mm::parse(end).map_err(|e| invalid(e.to_string()))?,
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        // Minute resolution: 22:00:59 is still inside a window ending at 22:00.
        let t = time.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(time);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(raw.trim(), FORMAT)
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// At least `interval_secs` between two deliveries.
    #[default]
    Interval,
    /// Once per clock hour, at `minute_of_hour`.
    FixedMinute,
}

/// Pacing of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub mode: ScheduleMode,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub minute_of_hour: u32,
    #[serde(default = "default_daily_window")]
    pub daily_window: TimeWindow,
}

fn default_interval_secs() -> u64 {
    180
}

fn default_daily_window() -> TimeWindow {
    TimeWindow::new(hm(8, 0), hm(22, 0))
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            interval_secs: default_interval_secs(),
            minute_of_hour: 0,
            daily_window: default_daily_window(),
        }
    }
}

impl ChannelConfig {
    /// Clamps `minute_of_hour` into 0-59 and `interval_secs` to
    /// `MAX_INTERVAL_SECS`.
    pub fn clamped(mut self) -> Self {
        self.minute_of_hour = self.minute_of_hour.min(59);
        self.interval_secs = self.interval_secs.min(MAX_INTERVAL_SECS);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Successful deliveries allowed per calendar day, all channels together.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_missed_task_window_mins")]
    pub missed_task_window_mins: i64,
    #[serde(default = "bool_true")]
    pub enable_missed_recovery: bool,
    /// Idempotency collisions tolerated in one dispatch attempt.
    #[serde(default = "default_max_skip")]
    pub max_skip_per_dispatch: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_active_hours")]
    pub active_hours: TimeWindow,
    /// ISO weekdays, 1 = Monday. Empty falls back to `weekend_work`.
    #[serde(default = "default_work_days")]
    pub work_days: Vec<u32>,
    #[serde(default)]
    pub weekend_work: bool,
    #[serde(default)]
    pub channels: BTreeMap<Channel, ChannelConfig>,
}

fn default_tick_interval_secs() -> u64 {
    10
}
fn default_daily_limit() -> u32 {
    500
}
fn default_missed_task_window_mins() -> i64 {
    30
}
fn default_max_skip() -> usize {
    100
}
fn default_lock_timeout_ms() -> u64 {
    1000
}
fn default_active_hours() -> TimeWindow {
    TimeWindow::new(hm(9, 0), hm(18, 0))
}
fn default_work_days() -> Vec<u32> {
    (1..=7).collect()
}
fn bool_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            daily_limit: default_daily_limit(),
            missed_task_window_mins: default_missed_task_window_mins(),
            enable_missed_recovery: true,
            max_skip_per_dispatch: default_max_skip(),
            lock_timeout_ms: default_lock_timeout_ms(),
            active_hours: default_active_hours(),
            work_days: default_work_days(),
            weekend_work: false,
            channels: BTreeMap::new(),
        }
    }
}

impl ScheduleConfig {
    /// Whether `local` falls on a work day inside the active hours.
    pub fn is_work_time<T: Datelike + Timelike>(&self, local: &T) -> bool {
        let weekday = local.weekday().number_from_monday();
        let day_ok = if self.work_days.is_empty() {
            self.weekend_work || weekday <= 5
        } else {
            self.work_days.contains(&weekday)
        };
        if !day_ok {
            return false;
        }
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0)
            .unwrap_or(NaiveTime::MIN);
        self.active_hours.contains(time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Case-insensitive substrings marking an error as transient.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_base_delay_secs() -> u64 {
    600
}
fn default_max_delay_secs() -> u64 {
    3600
}

pub fn default_retryable_errors() -> Vec<String> {
    [
        "network timeout",
        "element not found",
        "window not responding",
        "send failed",
        "connection failed",
        "operation timed out",
        "TimeoutError",
        "ConnectionError",
        "ElementNotFoundError",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Pause every channel while open, resume on half-open.
    #[serde(default = "bool_true")]
    pub pause_queues_on_open: bool,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_timeout_secs() -> u64 {
    300
}
fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            pause_queues_on_open: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: i64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: i64,
    #[serde(default = "default_failure_rate_low")]
    pub failure_rate_low: f64,
    #[serde(default = "default_failure_rate_high")]
    pub failure_rate_high: f64,
    /// Number of recent results the failure rate is computed over.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Hold back dispatch by `next_delay()` after every attempt.
    #[serde(default)]
    pub adaptive_pacing: bool,
}

fn default_base_interval_secs() -> u64 {
    180
}
fn default_jitter_min_secs() -> i64 {
    -30
}
fn default_jitter_max_secs() -> i64 {
    60
}
fn default_failure_rate_low() -> f64 {
    0.1
}
fn default_failure_rate_high() -> f64 {
    0.3
}
fn default_window_size() -> usize {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
            failure_rate_low: default_failure_rate_low(),
            failure_rate_high: default_failure_rate_high(),
            window_size: default_window_size(),
            daily_limit: default_daily_limit(),
            adaptive_pacing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_key_ttl_hours")]
    pub key_ttl_hours: i64,
}

fn default_key_ttl_hours() -> i64 {
    24
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_ttl_hours: default_key_ttl_hours(),
        }
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}
