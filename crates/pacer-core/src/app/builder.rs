//! SchedulerBuilder - wiring and fail-fast startup checks.
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: store と executor は必須、config は build 時に検証

use std::sync::Arc;

use tracing::info;

use super::scheduler::{Components, Scheduler};
use crate::config::{ConfigError, PacerConfig};
use crate::guard::{CircuitBreaker, IdempotencyManager, RateLimiter};
use crate::ports::{
    AlertSink, Clock, Executor, IdGenerator, SystemClock, TaskStore, TracingAlertSink,
    UlidGenerator,
};
use crate::queue::{QueueManager, QueuePausingListener, RetryHandler};

/// Builds a `Scheduler` with every component injected.
///
/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new(config)
///     .store(Arc::new(InMemoryTaskStore::new()))
///     .executor(Arc::new(MyExecutor))
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    config: PacerConfig,
    store: Option<Arc<dyn TaskStore>>,
    executor: Option<Arc<dyn Executor>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a task store is required")]
    MissingStore,

    #[error("an executor is required")]
    MissingExecutor,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl SchedulerBuilder {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            store: None,
            executor: None,
            clock: None,
            ids: None,
            alerts: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to ULIDs stamped by the scheduler's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `TracingAlertSink`.
    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> Result<Arc<Scheduler>, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let alerts = self.alerts.unwrap_or_else(|| Arc::new(TracingAlertSink));
        let config = self.config;

        let queues = Arc::new(QueueManager::new(config.clone(), store.clone(), clock.clone()));

        let mut breaker = CircuitBreaker::new(config.circuit_breaker.clone(), clock.clone(), alerts);
        if config.circuit_breaker.pause_queues_on_open {
            breaker = breaker.with_listener(Arc::new(QueuePausingListener::new(queues.clone())));
        }

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            config.timezone,
            clock.clone(),
        ));
        let idempotency = Arc::new(IdempotencyManager::new(
            store.clone(),
            clock.clone(),
            config.timezone,
            &config.idempotency,
        ));
        let retry = Arc::new(RetryHandler::new(
            &config.retry,
            store.clone(),
            limiter.clone(),
            clock.clone(),
        ));

        info!(timezone = %config.timezone, channels = queues.channels().len(), "scheduler built");
        Ok(Arc::new(Scheduler::from_components(Components {
            config,
            store,
            executor,
            clock,
            ids,
            queues,
            breaker: Arc::new(breaker),
            idempotency,
            limiter,
            retry,
        })))
    }
}
