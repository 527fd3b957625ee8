use std::collections::HashMap;

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::error::RowLogError;
use crate::execution_state::ExecutionState;
use crate::message::{Message, MessageId};
use crate::row_log_storage::RowLogStorage;

/// In-memory row storage for testing and single-process deployments.
pub struct MemoryRowLogStorage {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<MessageId, StoredEntry>,
    /// Last allocated sequence number per row.
    sequences: HashMap<Vec<u8>, i64>,
}

struct StoredEntry {
    message: Message,
    payload: Option<Vec<u8>>,
    state: ExecutionState,
}

impl MemoryRowLogStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                sequences: HashMap::new(),
            }),
        }
    }

    /// Number of entries not yet purged.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryRowLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowLogStorage for MemoryRowLogStorage {
    async fn next_sequence_nr(&self, row_key: &[u8]) -> Result<i64, RowLogError> {
        let mut inner = self.inner.lock();
        let seq = inner.sequences.entry(row_key.to_vec()).or_insert(-1);
        *seq += 1;
        Ok(*seq)
    }

    async fn put_message(
        &self,
        message: &Message,
        payload: Option<&[u8]>,
        state: &ExecutionState,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        let id = message.id();
        if inner.entries.contains_key(&id) {
            return Err(RowLogError::PersistenceError {
                reason: format!("message {id} already exists"),
                source: None,
            });
        }
        inner.entries.insert(
            id,
            StoredEntry {
                message: message.clone(),
                payload: payload.map(<[u8]>::to_vec),
                state: state.clone(),
            },
        );
        Ok(())
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, RowLogError> {
        let inner = self.inner.lock();
        Ok(inner.entries.get(id).map(|e| e.message.clone()))
    }

    async fn execution_state(
        &self,
        id: &MessageId,
    ) -> Result<Option<ExecutionState>, RowLogError> {
        let inner = self.inner.lock();
        Ok(inner.entries.get(id).map(|e| e.state.clone()))
    }

    async fn compare_and_set_state(
        &self,
        id: &MessageId,
        expected_revision: u64,
        state: &ExecutionState,
    ) -> Result<bool, RowLogError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return Ok(false);
        };
        if entry.state.revision != expected_revision {
            return Ok(false);
        }
        let mut next = state.clone();
        next.revision = expected_revision + 1;
        entry.state = next;
        Ok(true)
    }

    async fn payload(&self, id: &MessageId) -> Result<Option<Vec<u8>>, RowLogError> {
        let inner = self.inner.lock();
        Ok(inner.entries.get(id).and_then(|e| e.payload.clone()))
    }

    async fn remove_message(&self, id: &MessageId) -> Result<(), RowLogError> {
        self.inner.lock().entries.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscription;
    use crate::types::SubscriptionId;

    fn state() -> ExecutionState {
        ExecutionState::new(&[Subscription::local("index", 0, 3)])
    }

    #[tokio::test]
    async fn sequence_numbers_are_per_row() {
        let storage = MemoryRowLogStorage::new();
        assert_eq!(storage.next_sequence_nr(b"a").await.unwrap(), 0);
        assert_eq!(storage.next_sequence_nr(b"a").await.unwrap(), 1);
        assert_eq!(storage.next_sequence_nr(b"b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn put_and_read_back() {
        let storage = MemoryRowLogStorage::new();
        let msg = Message::new("row", 1, 0).with_data(b"d".to_vec());
        storage
            .put_message(&msg, Some(b"big payload"), &state())
            .await
            .unwrap();

        let stored = storage.message(&msg.id()).await.unwrap().unwrap();
        assert_eq!(stored.data.as_deref(), Some(&b"d"[..]));
        assert_eq!(
            storage.payload(&msg.id()).await.unwrap().as_deref(),
            Some(&b"big payload"[..])
        );
        assert_eq!(
            storage.execution_state(&msg.id()).await.unwrap(),
            Some(state())
        );
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected() {
        let storage = MemoryRowLogStorage::new();
        let msg = Message::new("row", 1, 0);
        storage.put_message(&msg, None, &state()).await.unwrap();
        assert!(storage.put_message(&msg, None, &state()).await.is_err());
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_revision() {
        let storage = MemoryRowLogStorage::new();
        let msg = Message::new("row", 1, 0);
        storage.put_message(&msg, None, &state()).await.unwrap();

        let mut first = state();
        first.record_failure(&SubscriptionId::new("index"));
        assert!(storage
            .compare_and_set_state(&msg.id(), 0, &first)
            .await
            .unwrap());

        // A second writer still holding revision 0 loses.
        let mut second = state();
        second.mark_done(&SubscriptionId::new("index"));
        assert!(!storage
            .compare_and_set_state(&msg.id(), 0, &second)
            .await
            .unwrap());

        let current = storage.execution_state(&msg.id()).await.unwrap().unwrap();
        assert_eq!(current.revision, 1);
        assert_eq!(current.attempts(&SubscriptionId::new("index")), 1);
    }

    #[tokio::test]
    async fn compare_and_set_on_purged_entry_fails() {
        let storage = MemoryRowLogStorage::new();
        let msg = Message::new("row", 1, 0);
        storage.put_message(&msg, None, &state()).await.unwrap();
        storage.remove_message(&msg.id()).await.unwrap();
        assert!(!storage
            .compare_and_set_state(&msg.id(), 0, &state())
            .await
            .unwrap());
        assert!(storage.is_empty());
    }
}
