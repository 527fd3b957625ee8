//! In-memory row log fixtures for unit and integration testing.
//!
//! Every backend lives in process memory, and the coordination store doubles as the
//! leader election service, so several members and processors can share one "fleet".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::RowLogConfig;
use crate::error::RowLogError;
use crate::listener::MessageListener;
use crate::message::{Message, MessageId};
use crate::metrics::RowLogMetrics;
use crate::processor::RowLogProcessor;
use crate::row_log::RowLog;
use crate::storage::memory_coordination::MemoryCoordination;
use crate::storage::memory_shard::MemoryShard;
use crate::storage::memory_store::MemoryRowLogStorage;
use crate::transport::framed::FramedTransport;
use crate::types::ShardId;

/// A row log over in-memory storage, shard and coordination.
///
/// # Example
///
/// ```ignore
/// let log = TestRowLog::new().await;
/// log.row_log().register_subscription(Subscription::local("index", 1, 3)).await?;
/// let processor = log.processor();
/// processor.start().await?;
/// ```
pub struct TestRowLog {
    row_log: Arc<RowLog>,
    storage: Arc<MemoryRowLogStorage>,
    shard: Arc<MemoryShard>,
    coordination: Arc<MemoryCoordination>,
}

impl TestRowLog {
    /// Configuration with short poll and backoff intervals so tests finish quickly.
    pub fn fast_config() -> RowLogConfig {
        RowLogConfig {
            idle_poll_timeout: Duration::from_millis(100),
            store_retry_backoff: Duration::from_millis(10),
            remote_ack_timeout: Duration::from_secs(2),
            worker_join_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub async fn new() -> Self {
        Self::with_config(Self::fast_config()).await
    }

    pub async fn with_config(config: RowLogConfig) -> Self {
        let storage = Arc::new(MemoryRowLogStorage::new());
        let shard = Arc::new(MemoryShard::new(config.shard_id.clone()));
        let coordination = Arc::new(MemoryCoordination::new());
        Self::open(config, storage, shard, coordination).await
    }

    async fn open(
        config: RowLogConfig,
        storage: Arc<MemoryRowLogStorage>,
        shard: Arc<MemoryShard>,
        coordination: Arc<MemoryCoordination>,
    ) -> Self {
        let row_log = RowLog::open(
            config,
            storage.clone(),
            shard.clone(),
            coordination.clone(),
        )
        .await
        .expect("TestRowLog config should be valid");
        Self {
            row_log,
            storage,
            shard,
            coordination,
        }
    }

    /// Another member of the fleet: a separate row log instance over the same backends.
    pub async fn member(&self) -> Self {
        self.member_with_config(self.row_log.config().clone()).await
    }

    pub async fn member_with_config(&self, config: RowLogConfig) -> Self {
        Self::open(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.shard),
            Arc::clone(&self.coordination),
        )
        .await
    }

    /// A processor for this member, electing through the shared coordination store.
    pub fn processor(&self) -> Arc<RowLogProcessor> {
        RowLogProcessor::new(
            Arc::clone(&self.row_log),
            self.coordination.clone(),
            Arc::new(FramedTransport::new(
                self.row_log.config().remote_connect_timeout,
            )),
            Arc::new(RowLogMetrics::unregistered()),
        )
    }

    pub fn row_log(&self) -> &Arc<RowLog> {
        &self.row_log
    }

    pub fn storage(&self) -> &Arc<MemoryRowLogStorage> {
        &self.storage
    }

    pub fn shard(&self) -> &Arc<MemoryShard> {
        &self.shard
    }

    pub fn coordination(&self) -> &Arc<MemoryCoordination> {
        &self.coordination
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.row_log.config().shard_id
    }

    pub async fn shutdown(&self) {
        self.row_log.close().await;
    }
}

#[derive(Default)]
struct Recorded {
    delivered: Vec<Message>,
    attempts: HashMap<MessageId, usize>,
    failures: HashMap<MessageId, usize>,
}

/// Local listener that records what it processed and can be scripted to fail.
#[derive(Default)]
pub struct RecordingListener {
    inner: Mutex<Recorded>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the message as not done for its next `times` deliveries.
    pub fn fail(&self, message: &Message, times: usize) {
        self.inner.lock().failures.insert(message.id(), times);
    }

    /// Messages processed successfully, in delivery order.
    pub fn delivered(&self) -> Vec<Message> {
        self.inner.lock().delivered.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().delivered.len()
    }

    /// Number of times the message was handed to this listener, failures included.
    pub fn attempts(&self, message: &Message) -> usize {
        self.inner
            .lock()
            .attempts
            .get(&message.id())
            .copied()
            .unwrap_or(0)
    }

    /// Wait until at least `count` messages were processed. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn process_message(&self, message: &Message) -> Result<bool, RowLogError> {
        let mut inner = self.inner.lock();
        let id = message.id();
        *inner.attempts.entry(id.clone()).or_default() += 1;
        if let Some(remaining) = inner.failures.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        inner.delivered.push(message.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscription;
    use crate::types::SubscriptionId;

    #[tokio::test]
    async fn members_share_backends() {
        let first = TestRowLog::new().await;
        let second = first.member().await;
        first
            .row_log()
            .register_subscription(Subscription::local("index", 1, 3))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while second.row_log().subscriptions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let msg = second.row_log().put_message(b"row", None, None).await.unwrap();
        assert_eq!(first.storage().len(), 1);
        assert!(!first
            .row_log()
            .is_message_done(&msg, &SubscriptionId::new("index"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn recording_listener_fails_as_scripted() {
        let listener = RecordingListener::new();
        let msg = Message::new(b"row".to_vec(), 1, 0);
        listener.fail(&msg, 1);
        assert!(!listener.process_message(&msg).await.unwrap());
        assert!(listener.process_message(&msg).await.unwrap());
        assert_eq!(listener.attempts(&msg), 2);
        assert_eq!(listener.delivered(), vec![msg]);
    }
}
