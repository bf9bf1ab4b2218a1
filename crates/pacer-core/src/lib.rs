//! pacer-core
//!
//! Multi-channel delivery scheduler: per-channel priority queues with pacing,
//! an idempotency ledger, a circuit breaker, backoff retries and an adaptive
//! rate limiter, orchestrated by a ticking `Scheduler`.
//!
//! # モジュール構成
//! - **domain**: Task, status machine, channels, ids, execution reports
//! - **ports**: TaskStore, Executor, AlertSink, Clock, IdGenerator
//! - **config**: TOML configuration with defaults and validation
//! - **guard**: IdempotencyManager, CircuitBreaker, RateLimiter
//! - **queue**: ChannelQueue, QueueManager, RetryHandler
//! - **app**: SchedulerBuilder, Scheduler, run loop, status
//! - **impls**: InMemoryTaskStore

pub mod app;
pub mod config;
pub mod domain;
pub mod guard;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{Scheduler, SchedulerBuilder, SchedulerError, SchedulerHandle, TaskRequest};
pub use config::PacerConfig;
