use async_trait::async_trait;

use crate::error::RowLogError;
use crate::execution_state::ExecutionState;
use crate::message::{Message, MessageId};

/// Per-row message table: each entry holds a message, its optional payload and its
/// execution state.
#[async_trait]
pub trait RowLogStorage: Send + Sync {
    /// Allocate the next sequence number for a row. Strictly increasing per row.
    async fn next_sequence_nr(&self, row_key: &[u8]) -> Result<i64, RowLogError>;

    /// Store a new message with its payload and initial execution state in one write.
    async fn put_message(
        &self,
        message: &Message,
        payload: Option<&[u8]>,
        state: &ExecutionState,
    ) -> Result<(), RowLogError>;

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, RowLogError>;

    /// Current execution state, or `None` once the entry was purged.
    async fn execution_state(&self, id: &MessageId)
        -> Result<Option<ExecutionState>, RowLogError>;

    /// Replace the execution state if its stored revision still equals `expected_revision`.
    /// The stored revision becomes `expected_revision + 1` on success. Returns `false` on a
    /// revision mismatch or when the entry no longer exists.
    async fn compare_and_set_state(
        &self,
        id: &MessageId,
        expected_revision: u64,
        state: &ExecutionState,
    ) -> Result<bool, RowLogError>;

    async fn payload(&self, id: &MessageId) -> Result<Option<Vec<u8>>, RowLogError>;

    /// Purge the entry. Removing a missing entry is not an error.
    async fn remove_message(&self, id: &MessageId) -> Result<(), RowLogError>;
}
