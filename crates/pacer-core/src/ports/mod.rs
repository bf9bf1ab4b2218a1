//! Ports: the seams to everything outside the scheduler.
//!
//! - **TaskStore**: durable tasks and idempotency keys (source of truth)
//! - **Executor**: performs one delivery
//! - **AlertSink**: operator notifications
//! - **Clock** / **IdGenerator**: time and identity, swappable in tests

pub mod alert_sink;
pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod task_store;

pub use self::alert_sink::{Alert, AlertKind, AlertSink, TracingAlertSink};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{Executor, ExecutorError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StoreError, TaskStore};
