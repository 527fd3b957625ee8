use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::error::RowLogError;
use crate::message::Message;
use crate::shard::{RowLogShard, ScannedMessage};
use crate::types::{ShardId, SubscriptionId};

/// Failure injected into the next scans of a [`MemoryShard`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanFailure {
    /// Scans fail with a retryable persistence error.
    Transient,
    /// Scans fail as if the backend became unreachable.
    Unavailable,
}

/// In-memory shard index for testing and single-process deployments.
pub struct MemoryShard {
    id: ShardId,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<SubscriptionId, BTreeSet<Message>>,
    problematic: HashMap<SubscriptionId, BTreeSet<Message>>,
    /// Remaining scans to fail, and how.
    scan_failures: Option<(usize, ScanFailure)>,
    put_failures: usize,
    scans: usize,
}

impl MemoryShard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make the next `count` calls to `next` fail.
    pub fn fail_scans(&self, count: usize, failure: ScanFailure) {
        self.inner.lock().scan_failures = Some((count, failure));
    }

    /// Make the next `count` calls to `put_message` fail with a retryable error.
    pub fn fail_puts(&self, count: usize) {
        self.inner.lock().put_failures = count;
    }

    /// Number of `next` calls served so far, failed ones included.
    pub fn scan_count(&self) -> usize {
        self.inner.lock().scans
    }

    /// Number of pending entries for a subscription, problematic ones included.
    pub fn pending_count(&self, subscription: &SubscriptionId) -> usize {
        self.inner
            .lock()
            .pending
            .get(subscription)
            .map_or(0, BTreeSet::len)
    }
}

impl Default for MemoryShard {
    fn default() -> Self {
        Self::new(ShardId::new("shard1"))
    }
}

#[async_trait]
impl RowLogShard for MemoryShard {
    fn id(&self) -> &ShardId {
        &self.id
    }

    async fn put_message(
        &self,
        message: &Message,
        subscriptions: &[SubscriptionId],
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        if inner.put_failures > 0 {
            inner.put_failures -= 1;
            return Err(RowLogError::PersistenceError {
                reason: format!("injected put failure on shard {}", self.id),
                source: None,
            });
        }
        for subscription in subscriptions {
            inner
                .pending
                .entry(subscription.clone())
                .or_default()
                .insert(message.clone());
        }
        Ok(())
    }

    async fn remove_message(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.pending.get_mut(subscription) {
            set.remove(message);
        }
        Ok(())
    }

    async fn next(
        &self,
        subscription: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ScannedMessage>, RowLogError> {
        let mut inner = self.inner.lock();
        inner.scans += 1;

        if let Some((remaining, failure)) = inner.scan_failures {
            inner.scan_failures = (remaining > 1).then_some((remaining - 1, failure));
            if remaining > 0 {
                return Err(match failure {
                    ScanFailure::Transient => RowLogError::PersistenceError {
                        reason: format!("injected scan failure on shard {}", self.id),
                        source: None,
                    },
                    ScanFailure::Unavailable => RowLogError::BackendUnavailable {
                        reason: format!("shard {} unreachable", self.id),
                        source: None,
                    },
                });
            }
        }

        let Some(pending) = inner.pending.get(subscription) else {
            return Ok(Vec::new());
        };
        let problematic = inner.problematic.get(subscription);

        let mut batch = Vec::new();
        let mut healthy = 0;
        let mut flagged_count = 0;
        for message in pending {
            if healthy >= limit {
                break;
            }
            let flagged = problematic.is_some_and(|p| p.contains(message));
            if flagged {
                if flagged_count >= limit {
                    continue;
                }
                flagged_count += 1;
            } else {
                healthy += 1;
            }
            batch.push(ScannedMessage {
                message: message.clone(),
                problematic: flagged,
            });
        }
        Ok(batch)
    }

    async fn put_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        self.inner
            .lock()
            .problematic
            .entry(subscription.clone())
            .or_default()
            .insert(message.clone());
        Ok(())
    }

    async fn remove_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        if let Some(set) = self.inner.lock().problematic.get_mut(subscription) {
            set.remove(message);
        }
        Ok(())
    }

    async fn is_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError> {
        Ok(self
            .inner
            .lock()
            .problematic
            .get(subscription)
            .is_some_and(|p| p.contains(message)))
    }

    async fn problematic(
        &self,
        subscription: &SubscriptionId,
    ) -> Result<Vec<Message>, RowLogError> {
        Ok(self
            .inner
            .lock()
            .problematic
            .get(subscription)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: &str) -> SubscriptionId {
        SubscriptionId::new(id)
    }

    fn ids(batch: &[ScannedMessage]) -> Vec<(Vec<u8>, i64)> {
        batch
            .iter()
            .map(|s| (s.message.row_key.clone(), s.message.timestamp))
            .collect()
    }

    #[tokio::test]
    async fn next_is_ordered_and_bounded() {
        let shard = MemoryShard::default();
        for (row, ts) in [("b", 1), ("a", 2), ("a", 1), ("c", 1)] {
            shard
                .put_message(&Message::new(row, ts, 0), &[sub("index")])
                .await
                .unwrap();
        }

        let batch = shard.next(&sub("index"), 3).await.unwrap();
        assert_eq!(
            ids(&batch),
            vec![(b"a".to_vec(), 1), (b"a".to_vec(), 2), (b"b".to_vec(), 1)]
        );
        assert!(batch.iter().all(|s| !s.problematic));
    }

    #[tokio::test]
    async fn subscriptions_are_independent() {
        let shard = MemoryShard::default();
        let msg = Message::new("row", 1, 0);
        shard
            .put_message(&msg, &[sub("index"), sub("blobs")])
            .await
            .unwrap();
        shard.remove_message(&msg, &sub("index")).await.unwrap();

        assert!(shard.next(&sub("index"), 10).await.unwrap().is_empty());
        assert_eq!(shard.next(&sub("blobs"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn problematic_messages_are_flagged_and_do_not_fill_the_batch() {
        let shard = MemoryShard::default();
        let poison = Message::new("a", 1, 0);
        let healthy = Message::new("b", 1, 0);
        shard.put_message(&poison, &[sub("index")]).await.unwrap();
        shard.put_message(&healthy, &[sub("index")]).await.unwrap();
        shard.put_problematic(&poison, &sub("index")).await.unwrap();

        let batch = shard.next(&sub("index"), 1).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].problematic);
        assert!(!batch[1].problematic);
        assert_eq!(shard.problematic(&sub("index")).await.unwrap(), vec![poison.clone()]);

        shard.remove_problematic(&poison, &sub("index")).await.unwrap();
        assert!(!shard.is_problematic(&poison, &sub("index")).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let shard = MemoryShard::default();
        shard.fail_scans(2, ScanFailure::Transient);
        assert!(shard.next(&sub("index"), 1).await.unwrap_err().is_retryable());
        assert!(shard.next(&sub("index"), 1).await.is_err());
        assert!(shard.next(&sub("index"), 1).await.unwrap().is_empty());
        assert_eq!(shard.scan_count(), 3);

        shard.fail_scans(1, ScanFailure::Unavailable);
        assert!(!shard.next(&sub("index"), 1).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn flagged_entries_are_capped_by_the_limit() {
        let shard = MemoryShard::default();
        for seq in 0..1000 {
            let poison = Message::new("a", 1, seq);
            shard.put_message(&poison, &[sub("index")]).await.unwrap();
            shard.put_problematic(&poison, &sub("index")).await.unwrap();
        }
        let healthy = Message::new("b", 1, 0);
        shard.put_message(&healthy, &[sub("index")]).await.unwrap();

        let batch = shard.next(&sub("index"), 10).await.unwrap();
        assert_eq!(batch.len(), 11);
        assert_eq!(batch.iter().filter(|s| s.problematic).count(), 10);
        assert_eq!(batch.last().map(|s| &s.message), Some(&healthy));
    }
}
