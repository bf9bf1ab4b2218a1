//! Domain model: tasks, channels, identifiers and execution reports.

pub mod channel;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod task;

pub use channel::{BuiltinChannel, Channel, ChannelParseError, CustomChannelId};
pub use errors::TransitionError;
pub use ids::TaskId;
pub use outcome::{Artifact, ExecutionReport, ReportStatus};
pub use task::{DEFAULT_MAX_RETRY, Task, TaskStatus};
