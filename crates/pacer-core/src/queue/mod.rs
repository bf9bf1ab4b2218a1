//! Queue module: per-channel queues, routing, and retry scheduling.

mod channel_queue;
mod manager;
mod retry;

pub use channel_queue::{
    AddOutcome, BlockReason, ChannelPreview, ChannelQueue, ChannelStatus, ExecutionPermit,
    QueueError, RejectReason,
};
pub use manager::{QueueManager, QueueManagerStatus, QueuePausingListener};
pub use retry::{
    RetryError, RetryHandler, RetryPolicy, RetryScheduleEntry, RetryStatus, format_duration,
};
