//! Circuit breaker over delivery outcomes.
//!
//! ```text
//! Closed --(consecutive failures >= threshold)--> Open
//! Open   --(recovery timeout elapsed)-----------> HalfOpen
//! HalfOpen --(success)--> Closed
//! HalfOpen --(failure)--> Open
//! ```
//!
//! The Open -> HalfOpen move is lazy: it happens inside `can_execute` (or
//! `refresh`) once the timer has run out. Half-open admits at most
//! `half_open_max_calls` probes; the call that performs the transition counts
//! as the first one.
//!
//! Listeners and the alert sink are notified after the state lock is
//! released, so a listener may call back into the breaker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{CircuitBreakerConfig, delta_secs};
use crate::ports::{Alert, AlertKind, AlertSink, Clock};

const FAILURE_HISTORY_CAP: usize = 100;
const FAILURE_HISTORY_KEEP: usize = 50;
const RECENT_FAILURES_SHOWN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub enabled: bool,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub remaining_recovery_secs: u64,
    pub half_open_calls: u32,
    pub half_open_max_calls: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<FailureRecord>,
}

/// Hooks fired on state changes.
pub trait CircuitListener: Send + Sync {
    fn on_open(&self, _status: &CircuitStatus) {}
    fn on_half_open(&self, _status: &CircuitStatus) {}
    fn on_close(&self, _status: &CircuitStatus) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    failures: VecDeque<FailureRecord>,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_calls: u32,
}

impl BreakerState {
    fn recovery_elapsed(&self, now: DateTime<Utc>) -> bool {
        let timeout = delta_secs(self.config.recovery_timeout_secs);
        self.opened_at.is_none_or(|at| now - at >= timeout)
    }

    fn open(&mut self, now: DateTime<Utc>) -> Transition {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_calls = 0;
        Transition::Opened
    }

    fn half_open(&mut self) -> Transition {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls = 0;
        Transition::HalfOpened
    }

    /// `None` when already closed.
    fn close(&mut self) -> Option<Transition> {
        let was = self.state;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_calls = 0;
        (was != CircuitState::Closed).then_some(Transition::Closed)
    }

    fn status(&self, now: DateTime<Utc>) -> CircuitStatus {
        let remaining = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => {
                let elapsed = (now - at).num_seconds().max(0) as u64;
                self.config.recovery_timeout_secs.saturating_sub(elapsed)
            }
            _ => 0,
        };
        let skip = self.failures.len().saturating_sub(RECENT_FAILURES_SHOWN);
        CircuitStatus {
            enabled: self.config.enabled,
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
            remaining_recovery_secs: remaining,
            half_open_calls: self.half_open_calls,
            half_open_max_calls: self.config.half_open_max_calls,
            last_failure_time: self.last_failure_time,
            opened_at: self.opened_at,
            recent_failures: self.failures.iter().skip(skip).cloned().collect(),
        }
    }
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    listeners: Vec<Arc<dyn CircuitListener>>,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        info!(
            threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout_secs,
            "circuit breaker initialised"
        );
        Self {
            state: Mutex::new(BreakerState {
                config,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                failures: VecDeque::new(),
                last_failure_time: None,
                opened_at: None,
                half_open_calls: 0,
            }),
            clock,
            alerts,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CircuitListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an attempt may proceed. Claims a probe slot in half-open.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let (admitted, transition) = {
            let mut s = self.lock();
            if !s.config.enabled {
                return true;
            }
            match s.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open if s.recovery_elapsed(now) => {
                    let t = s.half_open();
                    s.half_open_calls = 1;
                    (true, Some(t))
                }
                CircuitState::Open => (false, None),
                CircuitState::HalfOpen => {
                    if s.half_open_calls < s.config.half_open_max_calls {
                        s.half_open_calls += 1;
                        (true, None)
                    } else {
                        (false, None)
                    }
                }
            }
        };
        if let Some(t) = transition {
            self.notify(t);
        }
        admitted
    }

    /// Performs a due Open -> HalfOpen move without claiming a probe.
    pub fn refresh(&self) -> CircuitState {
        let now = self.clock.now();
        let (state, transition) = {
            let mut s = self.lock();
            let t = (s.config.enabled
                && s.state == CircuitState::Open
                && s.recovery_elapsed(now))
            .then(|| s.half_open());
            (s.state, t)
        };
        if let Some(t) = transition {
            self.notify(t);
        }
        state
    }

    /// Gives back a half-open probe that was admitted but never reached the
    /// executor.
    pub fn release_probe(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.half_open_calls = s.half_open_calls.saturating_sub(1);
        }
    }

    pub fn record_success(&self) {
        let transition = {
            let mut s = self.lock();
            if !s.config.enabled {
                return;
            }
            match s.state {
                CircuitState::Closed => {
                    s.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    info!("circuit probe succeeded, closing");
                    s.close()
                }
                CircuitState::Open => None,
            }
        };
        if let Some(t) = transition {
            self.notify(t);
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let now = self.clock.now();
        let transition = {
            let mut s = self.lock();
            if !s.config.enabled {
                return;
            }
            s.consecutive_failures += 1;
            s.last_failure_time = Some(now);
            s.failures.push_back(FailureRecord {
                at: now,
                error: reason.to_string(),
            });
            if s.failures.len() > FAILURE_HISTORY_CAP {
                let excess = s.failures.len() - FAILURE_HISTORY_KEEP;
                s.failures.drain(..excess);
            }
            warn!(
                consecutive = s.consecutive_failures,
                threshold = s.config.failure_threshold,
                error = reason,
                "circuit recorded failure"
            );
            match s.state {
                CircuitState::Closed if s.consecutive_failures >= s.config.failure_threshold => {
                    Some(s.open(now))
                }
                CircuitState::HalfOpen => {
                    warn!("circuit probe failed, reopening");
                    Some(s.open(now))
                }
                _ => None,
            }
        };
        if let Some(t) = transition {
            self.notify(t);
        }
    }

    pub fn force_reset(&self) {
        info!("circuit force reset");
        let transition = self.lock().close();
        if let Some(t) = transition {
            self.notify(t);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        self.lock().status(self.clock.now())
    }

    /// Applies new thresholds without touching the current state.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        let mut s = self.lock();
        s.config = config;
        if !s.config.enabled {
            s.state = CircuitState::Closed;
            s.consecutive_failures = 0;
            s.opened_at = None;
            s.half_open_calls = 0;
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.lock().config.clone()
    }

    fn notify(&self, transition: Transition) {
        let now = self.clock.now();
        let status = self.status();
        let (kind, message) = match transition {
            Transition::Opened => {
                error!(
                    consecutive = status.consecutive_failures,
                    "circuit opened"
                );
                for l in &self.listeners {
                    l.on_open(&status);
                }
                (
                    AlertKind::CircuitOpened,
                    format!(
                        "circuit opened after {} consecutive failures",
                        status.consecutive_failures
                    ),
                )
            }
            Transition::HalfOpened => {
                info!("circuit half-open, probing");
                for l in &self.listeners {
                    l.on_half_open(&status);
                }
                (AlertKind::CircuitHalfOpen, "circuit half-open, probing".to_string())
            }
            Transition::Closed => {
                info!("circuit closed");
                for l in &self.listeners {
                    l.on_close(&status);
                }
                (AlertKind::CircuitClosed, "circuit closed, delivery resumed".to_string())
            }
        };
        self.alerts.alert(Alert {
            kind,
            message,
            at: now,
            details: serde_json::to_value(&status).unwrap_or_default(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<AlertKind>>);

    impl AlertSink for RecordingSink {
        fn alert(&self, alert: Alert) {
            self.0.lock().unwrap().push(alert.kind);
        }
    }

    #[derive(Default)]
    struct CountingListener {
        opened: AtomicUsize,
        half_opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl CircuitListener for CountingListener {
        fn on_open(&self, _: &CircuitStatus) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
        fn on_half_open(&self, _: &CircuitStatus) {
            self.half_opened.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, _: &CircuitStatus) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(max_probes: u32) -> (CircuitBreaker, FixedClock, Arc<RecordingSink>, Arc<CountingListener>) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let listener = Arc::new(CountingListener::default());
        let config = CircuitBreakerConfig {
            half_open_max_calls: max_probes,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new(config, Arc::new(clock.clone()), sink.clone())
            .with_listener(listener.clone());
        (breaker, clock, sink, listener)
    }

    #[test]
    fn opens_after_threshold_and_blocks_until_recovery() {
        let (breaker, clock, sink, listener) = setup(1);

        breaker.record_failure("network timeout");
        breaker.record_failure("network timeout");
        assert!(breaker.can_execute());
        breaker.record_failure("network timeout");

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(listener.opened.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(299));
        assert!(!breaker.can_execute());
        assert_eq!(breaker.status().remaining_recovery_secs, 1);

        clock.advance(Duration::seconds(1));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute(), "only one probe admitted");

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![AlertKind::CircuitOpened, AlertKind::CircuitHalfOpen]
        );
    }

    #[test]
    fn half_open_admits_exactly_max_probes() {
        let (breaker, clock, _, _) = setup(3);
        for _ in 0..3 {
            breaker.record_failure("x");
        }
        clock.advance(Duration::seconds(300));

        let admitted = (0..10).filter(|_| breaker.can_execute()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn probe_success_closes_and_failure_reopens() {
        let (breaker, clock, _, listener) = setup(1);
        for _ in 0..3 {
            breaker.record_failure("x");
        }
        clock.advance(Duration::seconds(300));
        assert!(breaker.can_execute());
        breaker.record_failure("still broken");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(listener.opened.load(Ordering::SeqCst), 2);

        clock.advance(Duration::seconds(300));
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().consecutive_failures, 0);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_moves_to_half_open_without_claiming_a_probe() {
        let (breaker, clock, _, listener) = setup(1);
        for _ in 0..3 {
            breaker.record_failure("x");
        }
        assert_eq!(breaker.refresh(), CircuitState::Open);
        clock.advance(Duration::seconds(301));
        assert_eq!(breaker.refresh(), CircuitState::HalfOpen);
        assert_eq!(listener.half_opened.load(Ordering::SeqCst), 1);
        assert!(breaker.can_execute());
    }

    #[test]
    fn released_probe_can_be_claimed_again() {
        let (breaker, clock, _, _) = setup(1);
        for _ in 0..3 {
            breaker.record_failure("x");
        }
        clock.advance(Duration::seconds(300));
        assert!(breaker.can_execute());
        breaker.release_probe();
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_in_closed_resets_the_streak() {
        let (breaker, _, _, _) = setup(1);
        breaker.record_failure("a");
        breaker.record_failure("b");
        breaker.record_success();
        breaker.record_failure("c");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().consecutive_failures, 1);
    }

    #[test]
    fn failure_history_is_bounded_and_status_shows_last_five() {
        let (breaker, _, _, _) = setup(1);
        breaker.force_reset();
        for i in 0..101 {
            breaker.record_failure(&format!("e{i}"));
        }
        let status = breaker.status();
        assert_eq!(status.recent_failures.len(), 5);
        assert_eq!(status.recent_failures[4].error, "e100");
        assert_eq!(breaker.lock().failures.len(), FAILURE_HISTORY_KEEP);
    }

    #[test]
    fn force_reset_closes_and_alerts_once() {
        let (breaker, _, sink, _) = setup(1);
        for _ in 0..3 {
            breaker.record_failure("x");
        }
        breaker.force_reset();
        breaker.force_reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![AlertKind::CircuitOpened, AlertKind::CircuitClosed]
        );
    }

    #[test]
    fn disabled_breaker_always_admits() {
        let (breaker, _, _, _) = setup(1);
        breaker.reconfigure(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..10 {
            breaker.record_failure("x");
        }
        assert!(breaker.can_execute());
        assert_eq!(breaker.status().consecutive_failures, 0);
    }
}
