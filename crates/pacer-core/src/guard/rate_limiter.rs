//! Adaptive rate limiter.
//!
//! Tracks the outcome of recent deliveries in a bounded window and stretches
//! the pause between attempts as the failure rate climbs:
//!
//! | failure rate        | multiplier |
//! |---------------------|------------|
//! | `< low`  (10%)      | 1.0        |
//! | `< high` (30%)      | 1.5        |
//! | otherwise           | 2.0        |
//!
//! A uniform jitter in `[jitter_min, jitter_max]` is added on top so the
//! cadence is not a fixed period. Also owns the calendar-day success counter,
//! which rolls over at local midnight of the configured timezone.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{RateLimitConfig, delta_secs};
use crate::ports::Clock;

const RECENT_RECORDS_SHOWN: usize = 10;
const MAX_ADAPTIVE_FACTOR: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    pub base_interval_secs: u64,
    pub failure_rate: f64,
    pub rate_multiplier: f64,
    pub should_slow_down: bool,
    pub daily_limit: u32,
    pub today: NaiveDate,
    pub today_count: u32,
    pub remaining_quota: u32,
    pub window_size: usize,
    pub records_count: usize,
    pub recent_records: Vec<ExecutionRecord>,
}

struct LimiterState {
    config: RateLimitConfig,
    timezone: Tz,
    records: VecDeque<ExecutionRecord>,
    today: NaiveDate,
    today_count: u32,
}

impl LimiterState {
    /// Resets the counter and the window when the local day has changed.
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.timezone).date_naive();
        if today != self.today {
            info!(from = %self.today, to = %today, "day rolled over, resetting send counter");
            self.today = today;
            self.today_count = 0;
            self.records.clear();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let failures = self.records.iter().filter(|r| !r.success).count();
        failures as f64 / self.records.len() as f64
    }

    fn multiplier(&self) -> f64 {
        let rate = self.failure_rate();
        if rate < self.config.failure_rate_low {
            1.0
        } else if rate < self.config.failure_rate_high {
            1.5
        } else {
            2.0
        }
    }
}

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, timezone: Tz, clock: Arc<dyn Clock>) -> Self {
        let today = clock.now().with_timezone(&timezone).date_naive();
        info!(
            base_interval_secs = config.base_interval_secs,
            daily_limit = config.daily_limit,
            "rate limiter initialised"
        );
        Self {
            state: Mutex::new(LimiterState {
                records: VecDeque::with_capacity(config.window_size),
                config,
                timezone,
                today,
                today_count: 0,
            }),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.roll_over(self.clock.now());
        s
    }

    /// Sets today's counter, typically from the store at startup.
    pub fn seed_today_count(&self, count: u32) {
        let mut s = self.lock();
        s.today_count = count;
        debug!(count, "seeded today's send counter");
    }

    /// Seconds to wait before the next attempt. Never below 1.
    pub fn next_delay(&self) -> u64 {
        let (base, jitter_min, jitter_max, multiplier) = {
            let s = self.lock();
            (
                s.config.base_interval_secs,
                s.config.jitter_min_secs,
                s.config.jitter_max_secs,
                s.multiplier(),
            )
        };
        let jitter = if jitter_min < jitter_max {
            rand::thread_rng().gen_range(jitter_min..=jitter_max)
        } else {
            jitter_min
        };
        let scaled = (base as f64 * multiplier) as i64;
        scaled.saturating_add(jitter).max(1) as u64
    }

    /// Earliest instant the next attempt should start.
    pub fn next_send_time(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        now.checked_add_signed(delta_secs(self.next_delay()))
            .unwrap_or(now)
    }

    /// `next_delay` scaled by `2^consecutive_failures`, capped at 8x.
    pub fn adaptive_interval(&self, consecutive_failures: u32) -> u64 {
        let delay = self.next_delay();
        if consecutive_failures == 0 {
            return delay;
        }
        let factor = 1u64
            .checked_shl(consecutive_failures)
            .unwrap_or(u64::MAX)
            .min(MAX_ADAPTIVE_FACTOR);
        delay * factor
    }

    pub fn record_result(&self, success: bool) {
        let now = self.clock.now();
        let mut s = self.lock();
        if s.records.len() >= s.config.window_size {
            s.records.pop_front();
        }
        s.records.push_back(ExecutionRecord { at: now, success });
        if success {
            s.today_count += 1;
        }
        debug!(success, failure_rate = s.failure_rate(), "recorded delivery result");
    }

    pub fn can_send_today(&self) -> bool {
        let s = self.lock();
        s.today_count < s.config.daily_limit
    }

    pub fn remaining_quota(&self) -> u32 {
        let s = self.lock();
        s.config.daily_limit.saturating_sub(s.today_count)
    }

    pub fn today_count(&self) -> u32 {
        self.lock().today_count
    }

    pub fn failure_rate(&self) -> f64 {
        self.lock().failure_rate()
    }

    pub fn rate_multiplier(&self) -> f64 {
        self.lock().multiplier()
    }

    pub fn should_slow_down(&self) -> bool {
        let s = self.lock();
        s.failure_rate() >= s.config.failure_rate_low
    }

    pub fn reconfigure(&self, config: RateLimitConfig, timezone: Tz) {
        let mut s = self.lock();
        while s.records.len() > config.window_size {
            s.records.pop_front();
        }
        s.config = config;
        s.timezone = timezone;
    }

    pub fn adaptive_pacing(&self) -> bool {
        self.lock().config.adaptive_pacing
    }

    pub fn status(&self) -> RateLimiterStatus {
        let s = self.lock();
        let skip = s.records.len().saturating_sub(RECENT_RECORDS_SHOWN);
        RateLimiterStatus {
            base_interval_secs: s.config.base_interval_secs,
            failure_rate: s.failure_rate(),
            rate_multiplier: s.multiplier(),
            should_slow_down: s.failure_rate() >= s.config.failure_rate_low,
            daily_limit: s.config.daily_limit,
            today: s.today,
            today_count: s.today_count,
            remaining_quota: s.config.daily_limit.saturating_sub(s.today_count),
            window_size: s.config.window_size,
            records_count: s.records.len(),
            recent_records: s.records.iter().skip(skip).copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, FixedClock) {
        // 15:00 UTC is 23:00 in Shanghai.
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap());
        let limiter = RateLimiter::new(config, chrono_tz::Asia::Shanghai, Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn no_jitter() -> RateLimitConfig {
        RateLimitConfig {
            jitter_min_secs: 0,
            jitter_max_secs: 0,
            ..RateLimitConfig::default()
        }
    }

    #[rstest]
    #[case(0, 180)]
    #[case(1, 180)]
    #[case(2, 270)]
    #[case(5, 270)]
    #[case(6, 360)]
    #[case(20, 360)]
    fn delay_follows_failure_bands(#[case] failures: usize, #[case] expected: u64) {
        let (limiter, _) = limiter(no_jitter());
        for i in 0..20 {
            limiter.record_result(i >= failures);
        }
        assert_eq!(limiter.next_delay(), expected);
    }

    #[test]
    fn delay_is_monotonic_across_bands() {
        let (limiter, _) = limiter(no_jitter());
        let mut last = 0;
        for failures in [0, 3, 10] {
            limiter.reconfigure(no_jitter(), chrono_tz::Asia::Shanghai);
            for i in 0..20 {
                limiter.record_result(i >= failures);
            }
            let delay = limiter.next_delay();
            assert!(delay > last, "{delay} should exceed {last}");
            last = delay;
        }
    }

    #[test]
    fn jitter_stays_within_bounds_and_floor_is_one_second() {
        let (limiter, _) = limiter(RateLimitConfig::default());
        for _ in 0..200 {
            let d = limiter.next_delay();
            assert!((150..=240).contains(&d), "{d}");
        }

        let (tiny, _) = limiter_with_base(5);
        for _ in 0..50 {
            assert!(tiny.next_delay() >= 1);
        }
    }

    fn limiter_with_base(base: u64) -> (RateLimiter, FixedClock) {
        limiter(RateLimitConfig {
            base_interval_secs: base,
            jitter_min_secs: -30,
            jitter_max_secs: 0,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn window_is_bounded() {
        let (limiter, _) = limiter(RateLimitConfig {
            window_size: 4,
            ..no_jitter()
        });
        for _ in 0..4 {
            limiter.record_result(false);
        }
        for _ in 0..4 {
            limiter.record_result(true);
        }
        assert_eq!(limiter.failure_rate(), 0.0);
        assert_eq!(limiter.status().records_count, 4);
    }

    #[test]
    fn quota_counts_successes_and_rolls_over_at_local_midnight() {
        let (limiter, clock) = limiter(RateLimitConfig {
            daily_limit: 2,
            ..no_jitter()
        });
        limiter.record_result(true);
        limiter.record_result(false);
        assert_eq!(limiter.remaining_quota(), 1);
        limiter.record_result(true);
        assert!(!limiter.can_send_today());

        // 23:59 local, same day.
        clock.advance(Duration::minutes(59));
        assert!(!limiter.can_send_today());

        // 00:00 local, next day.
        clock.advance(Duration::minutes(1));
        assert!(limiter.can_send_today());
        assert_eq!(limiter.remaining_quota(), 2);
        assert_eq!(limiter.status().records_count, 0);
    }

    #[test]
    fn seeded_count_counts_against_quota() {
        let (limiter, _) = limiter(RateLimitConfig {
            daily_limit: 10,
            ..no_jitter()
        });
        limiter.seed_today_count(9);
        assert_eq!(limiter.remaining_quota(), 1);
    }

    #[rstest]
    #[case(0, 180)]
    #[case(1, 360)]
    #[case(2, 720)]
    #[case(3, 1440)]
    #[case(10, 1440)]
    fn adaptive_interval_caps_at_eight_times(#[case] consecutive: u32, #[case] expected: u64) {
        let (limiter, _) = limiter(no_jitter());
        assert_eq!(limiter.adaptive_interval(consecutive), expected);
    }

    #[test]
    fn slow_down_starts_at_low_threshold() {
        let (limiter, _) = limiter(no_jitter());
        for i in 0..10 {
            limiter.record_result(i != 0);
        }
        assert!(limiter.should_slow_down());
        assert_eq!(limiter.rate_multiplier(), 1.5);
    }
}
