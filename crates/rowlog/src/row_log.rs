//! The row log façade: puts messages, manages subscriptions and mutates execution state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::RowLogConfig;
use crate::coordination::CoordinationStore;
use crate::error::RowLogError;
use crate::execution_state::ExecutionState;
use crate::listener::{ListenerRegistry, MessageListener};
use crate::message::{Message, PayloadRef};
use crate::row_log_storage::RowLogStorage;
use crate::shard::RowLogShard;
use crate::subscription::{sort_for_dispatch, Subscription};
use crate::types::SubscriptionId;
use crate::wakeup::ProcessorNotifier;

/// Maximum compare-and-set attempts on one execution state before giving up.
const MAX_CAS_RETRIES: u32 = 32;

/// Result of recording a failed delivery attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AttemptOutcome {
    /// The message stays pending and will be retried.
    Pending { attempts: u32 },
    /// The message reached `max_tries` and joined the problematic set.
    Problematic { attempts: u32 },
    /// The message is already done for the subscription, or purged.
    Resolved,
}

pub struct RowLog {
    config: Arc<RowLogConfig>,
    storage: Arc<dyn RowLogStorage>,
    shard: Arc<dyn RowLogShard>,
    coordination: Arc<dyn CoordinationStore>,
    listeners: Arc<ListenerRegistry>,
    subscriptions: Arc<watch::Sender<Arc<Vec<Subscription>>>>,
    /// Serializes coordination writes and reloads with their local publication.
    subscription_sync: Arc<tokio::sync::Mutex<()>>,
    notifier: Option<ProcessorNotifier>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RowLog {
    /// Open a row log: load the registered subscriptions, follow changes to them, and start
    /// the wake-up notifier when enabled.
    pub async fn open(
        config: RowLogConfig,
        storage: Arc<dyn RowLogStorage>,
        shard: Arc<dyn RowLogShard>,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Result<Arc<Self>, RowLogError> {
        config.validate()?;
        if shard.id() != &config.shard_id {
            return Err(RowLogError::InvalidConfig {
                reason: format!(
                    "shard {} does not match configured shard {}",
                    shard.id(),
                    config.shard_id
                ),
            });
        }
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Subscribe before loading so no change between the two is missed.
        let mut changes = coordination.watch_subscriptions(&config.row_log_id).await?;
        let mut initial = coordination.subscriptions(&config.row_log_id).await?;
        sort_for_dispatch(&mut initial);
        let (tx, _) = watch::channel(Arc::new(initial));
        let subscriptions = Arc::new(tx);

        let subscription_sync = Arc::new(tokio::sync::Mutex::new(()));

        let watch_tx = Arc::clone(&subscriptions);
        let watch_sync = Arc::clone(&subscription_sync);
        let watch_coordination = Arc::clone(&coordination);
        let watch_cancel = cancel.clone();
        let row_log_id = config.row_log_id.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    event = changes.next() => event,
                };
                if event.is_none() {
                    tracing::warn!(row_log = %row_log_id, "subscription watch ended");
                    break;
                }
                // Events may trail local registrations, so reload the current set instead.
                let _sync = watch_sync.lock().await;
                match watch_coordination.subscriptions(&row_log_id).await {
                    Ok(mut snapshot) => {
                        sort_for_dispatch(&mut snapshot);
                        publish_snapshot(&watch_tx, snapshot);
                    }
                    Err(e) => {
                        tracing::warn!(row_log = %row_log_id, error = %e, "failed to reload subscriptions");
                    }
                }
            }
        }));

        let notifier = if config.wakeup_enabled {
            let (notifier, handle) = ProcessorNotifier::spawn(
                Arc::clone(&coordination),
                config.row_log_id.clone(),
                config.shard_id.clone(),
                config.notify_connect_timeout,
                cancel.clone(),
            );
            tasks.push(handle);
            Some(notifier)
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            storage,
            shard,
            coordination,
            listeners: Arc::new(ListenerRegistry::new()),
            subscriptions,
            subscription_sync,
            notifier,
            cancel,
            tasks: parking_lot::Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &RowLogConfig {
        &self.config
    }

    pub fn shard(&self) -> &Arc<dyn RowLogShard> {
        &self.shard
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationStore> {
        &self.coordination
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Append a message for every currently registered subscription.
    ///
    /// Fails only when the store rejects the write. The processor is signalled afterwards on a
    /// best-effort basis. A message put while no subscription is registered is not retained.
    #[instrument(skip(self, row_key, data, payload), fields(row_log = %self.config.row_log_id))]
    pub async fn put_message(
        &self,
        row_key: &[u8],
        data: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Message, RowLogError> {
        let subscriptions = self.subscriptions();
        let seq_nr = self.storage.next_sequence_nr(row_key).await?;
        let mut message = Message::new(row_key, Utc::now().timestamp_millis(), seq_nr);
        if let Some(data) = data {
            message = message.with_data(data);
        }
        if let Some(payload) = payload {
            message = message.with_payload(PayloadRef { len: payload.len() });
        }
        if subscriptions.is_empty() {
            tracing::debug!(message = %message, "no subscriptions registered, message not retained");
            return Ok(message);
        }

        let state = ExecutionState::new(&subscriptions);
        self.storage.put_message(&message, payload, &state).await?;
        let ids: Vec<SubscriptionId> = subscriptions.iter().map(|s| s.id.clone()).collect();
        if let Err(e) = self.shard.put_message(&message, &ids).await {
            // Unindexed entries are never scanned or purged.
            if let Err(undo) = self.storage.remove_message(&message.id()).await {
                tracing::warn!(
                    message = %message,
                    error = %undo,
                    "failed to remove unindexed message after shard write failure"
                );
            }
            return Err(e);
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
        Ok(message)
    }

    /// Add or replace a subscription. New puts include it immediately.
    #[instrument(skip(self), fields(row_log = %self.config.row_log_id))]
    pub async fn register_subscription(&self, subscription: Subscription) -> Result<(), RowLogError> {
        subscription.validate()?;
        let _sync = self.subscription_sync.lock().await;
        self.coordination
            .put_subscription(&self.config.row_log_id, &subscription)
            .await?;
        let mut next: Vec<Subscription> = self
            .subscriptions()
            .iter()
            .filter(|s| s.id != subscription.id)
            .cloned()
            .collect();
        tracing::info!(subscription = %subscription.id, kind = ?subscription.kind, "subscription registered");
        next.push(subscription);
        sort_for_dispatch(&mut next);
        publish_snapshot(&self.subscriptions, next);
        Ok(())
    }

    #[instrument(skip(self), fields(row_log = %self.config.row_log_id))]
    pub async fn unregister_subscription(&self, id: &SubscriptionId) -> Result<(), RowLogError> {
        let sync = self.subscription_sync.lock().await;
        self.coordination
            .remove_subscription(&self.config.row_log_id, id)
            .await?;
        let next: Vec<Subscription> = self
            .subscriptions()
            .iter()
            .filter(|s| &s.id != id)
            .cloned()
            .collect();
        publish_snapshot(&self.subscriptions, next);
        drop(sync);
        let released = self.release_entries(id).await?;
        tracing::info!(subscription = %id, released, "subscription unregistered");
        Ok(())
    }

    /// Drop the pending and problematic entries of an unregistered subscription, purging
    /// messages that no longer wait on anyone. Returns the number of entries dropped.
    async fn release_entries(&self, id: &SubscriptionId) -> Result<usize, RowLogError> {
        let registered = self.registered_ids();
        let mut released = 0;
        loop {
            let batch = self.shard.next(id, self.config.scan_batch_size).await?;
            if batch.is_empty() {
                return Ok(released);
            }
            for scanned in batch {
                let message = scanned.message;
                self.shard.remove_message(&message, id).await?;
                self.shard.remove_problematic(&message, id).await?;
                released += 1;
                if let Some(state) = self.storage.execution_state(&message.id()).await? {
                    if state.all_done(&registered) {
                        self.purge(&message, &state).await?;
                    }
                }
            }
        }
    }

    /// Registered subscriptions in dispatch order.
    pub fn subscriptions(&self) -> Arc<Vec<Subscription>> {
        Arc::clone(&self.subscriptions.borrow())
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions().iter().find(|s| &s.id == id).cloned()
    }

    /// Receiver that observes every change to the subscription set.
    pub fn watch_subscriptions(&self) -> watch::Receiver<Arc<Vec<Subscription>>> {
        self.subscriptions.subscribe()
    }

    pub(crate) fn registered_ids(&self) -> HashSet<SubscriptionId> {
        self.subscriptions().iter().map(|s| s.id.clone()).collect()
    }

    /// Register the in-process listener of a Local subscription.
    pub fn register_listener(&self, subscription: SubscriptionId, listener: Arc<dyn MessageListener>) {
        self.listeners.register(subscription, listener);
    }

    pub fn unregister_listener(&self, subscription: &SubscriptionId) {
        self.listeners.unregister(subscription);
    }

    /// Whether `subscription` is done with the message. A purged message is done for everyone.
    pub async fn is_message_done(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError> {
        Ok(self
            .storage
            .execution_state(&message.id())
            .await?
            .map_or(true, |state| state.is_done(subscription)))
    }

    pub async fn is_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError> {
        self.shard.is_problematic(message, subscription).await
    }

    /// The problematic set of a subscription.
    pub async fn problematic(&self, subscription: &SubscriptionId) -> Result<Vec<Message>, RowLogError> {
        self.shard.problematic(subscription).await
    }

    pub async fn execution_state(&self, message: &Message) -> Result<Option<ExecutionState>, RowLogError> {
        self.storage.execution_state(&message.id()).await
    }

    /// The out-of-band payload of a message, if it has one and is not purged yet.
    pub async fn payload(&self, message: &Message) -> Result<Option<Vec<u8>>, RowLogError> {
        if message.payload.is_none() {
            return Ok(None);
        }
        self.storage.payload(&message.id()).await
    }

    /// Mark the message done for `subscription`. Returns whether this call set the flag.
    /// The entry is purged once every registered subscription is done.
    #[instrument(skip(self, message), fields(message = %message))]
    pub async fn message_done(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError> {
        let id = message.id();
        for _ in 0..MAX_CAS_RETRIES {
            let Some(mut state) = self.storage.execution_state(&id).await? else {
                return Ok(false);
            };
            let revision = state.revision;
            if !state.mark_done(subscription) {
                self.shard.remove_message(message, subscription).await?;
                return Ok(false);
            }
            if !self
                .storage
                .compare_and_set_state(&id, revision, &state)
                .await?
            {
                tracing::debug!(subscription = %subscription, "execution state changed concurrently, retrying");
                continue;
            }
            self.shard.remove_message(message, subscription).await?;
            self.shard.remove_problematic(message, subscription).await?;
            if state.all_done(&self.registered_ids()) {
                self.purge(message, &state).await?;
            }
            return Ok(true);
        }
        Err(cas_exhausted(message))
    }

    /// Count a failed attempt for `subscription`. When the count reaches `max_tries` the
    /// message joins the subscription's problematic set.
    #[instrument(skip(self, message, subscription), fields(message = %message, subscription = %subscription.id))]
    pub async fn message_failed(
        &self,
        message: &Message,
        subscription: &Subscription,
    ) -> Result<AttemptOutcome, RowLogError> {
        let id = message.id();
        for _ in 0..MAX_CAS_RETRIES {
            let Some(mut state) = self.storage.execution_state(&id).await? else {
                return Ok(AttemptOutcome::Resolved);
            };
            let revision = state.revision;
            let Some(attempts) = state.record_failure(&subscription.id) else {
                return Ok(AttemptOutcome::Resolved);
            };
            if !self
                .storage
                .compare_and_set_state(&id, revision, &state)
                .await?
            {
                continue;
            }
            if attempts >= subscription.max_tries {
                self.shard.put_problematic(message, &subscription.id).await?;
                return Ok(AttemptOutcome::Problematic { attempts });
            }
            return Ok(AttemptOutcome::Pending { attempts });
        }
        Err(cas_exhausted(message))
    }

    /// Operator action: take a message out of the problematic set and reset its attempt
    /// counter so it is dispatched again.
    #[instrument(skip(self, message), fields(message = %message))]
    pub async fn retry_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        if self.subscription(subscription).is_none() {
            return Err(RowLogError::SubscriptionNotFound {
                subscription_id: subscription.clone(),
            });
        }
        let id = message.id();
        for _ in 0..MAX_CAS_RETRIES {
            let Some(mut state) = self.storage.execution_state(&id).await? else {
                break;
            };
            let revision = state.revision;
            if !state.reset_attempts(subscription)
                || self
                    .storage
                    .compare_and_set_state(&id, revision, &state)
                    .await?
            {
                self.shard.remove_problematic(message, subscription).await?;
                if let Some(notifier) = &self.notifier {
                    notifier.notify();
                }
                return Ok(());
            }
        }
        self.shard.remove_problematic(message, subscription).await
    }

    async fn purge(&self, message: &Message, state: &ExecutionState) -> Result<(), RowLogError> {
        for subscription in state.subscription_ids() {
            self.shard.remove_message(message, subscription).await?;
            self.shard.remove_problematic(message, subscription).await?;
        }
        self.storage.remove_message(&message.id()).await?;
        tracing::debug!(message = %message, "row log entry purged");
        Ok(())
    }

    /// Stop background tasks. Pending messages stay in storage.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "row log background task failed");
            }
        }
    }
}

impl Drop for RowLog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn publish_snapshot(tx: &watch::Sender<Arc<Vec<Subscription>>>, snapshot: Vec<Subscription>) {
    tx.send_if_modified(|current| {
        if **current == snapshot {
            return false;
        }
        *current = Arc::new(snapshot);
        true
    });
}

fn cas_exhausted(message: &Message) -> RowLogError {
    RowLogError::PersistenceError {
        reason: format!(
            "execution state of {message} kept changing after {MAX_CAS_RETRIES} attempts"
        ),
        source: None,
    }
}
