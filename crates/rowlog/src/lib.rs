//! Per-row write-ahead message log with durable subscriptions.
//!
//! Writers append messages to a row log with [`RowLog::put_message`]. Every subscription
//! registered at that moment gets a pending [`ExecutionState`] entry, and a leader-elected
//! [`RowLogProcessor`] scans the shard per subscription, dispatches each message to a local
//! or remote consumer, and marks it done. Messages whose consumer keeps failing are moved
//! to a per-subscription problematic set after `max_tries` attempts.
//!
//! ```text
//! put_message ──► storage + shard ──► wake-up ──► processor (leader)
//!                                                 ├─ worker(index)  ──► local listener
//!                                                 └─ worker(blobs)  ──► remote listener
//! ```
//!
//! [`RowLog::put_message`]: crate::row_log::RowLog::put_message
//! [`ExecutionState`]: crate::execution_state::ExecutionState
//! [`RowLogProcessor`]: crate::processor::RowLogProcessor

pub mod config;
pub mod coordination;
pub mod error;
pub mod execution_state;
pub mod handler;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod row_log;
pub mod row_log_storage;
pub mod shard;
pub mod storage;
pub mod subscription;
pub mod testing;
pub mod transport;
pub mod types;
pub mod wakeup;
mod worker;

/// Prelude module for convenient glob imports.
///
/// ```text
/// use rowlog::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::RowLogConfig;
    pub use crate::error::RowLogError;
    pub use crate::listener::MessageListener;
    pub use crate::message::{Message, MessageId};
    pub use crate::processor::RowLogProcessor;
    pub use crate::row_log::{AttemptOutcome, RowLog};
    pub use crate::subscription::{Subscription, SubscriptionKind};
    pub use crate::types::{HostAddress, RowLogId, ShardId, SubscriptionId};
}
