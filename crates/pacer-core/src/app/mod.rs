//! App - application layer
//!
//! ports と guard/queue を組み合わせてスケジューラを構成します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: wiring and fail-fast validation
//! - **Scheduler**: tick gates, dispatch, outcome routing, task operations
//! - **SchedulerHandle**: background run loop with graceful shutdown
//! - **FireTable**: fixed-minute wake-ups
//! - **status**: serializable snapshots

pub mod builder;
pub mod fire_table;
pub mod run_loop;
pub mod scheduler;
pub mod status;

pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::fire_table::FireTable;
pub use self::run_loop::SchedulerHandle;
pub use self::scheduler::{RecoveryReport, Scheduler, SchedulerError, TaskRequest};
pub use self::status::{SchedulerStatus, TickReport, TickSkip};
