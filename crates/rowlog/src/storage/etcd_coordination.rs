//! etcd-backed coordination store and leader election.
//!
//! Keys under the configured prefix:
//! - `{prefix}{row_log}/processors/{shard}`: published wake-up address, session lease
//! - `{prefix}{row_log}/subscriptions/{id}`: subscription JSON, persistent
//! - `{prefix}{row_log}/listeners/{subscription}/{host:port}`: remote listener, session lease
//! - `{prefix}elections/{path}`: current leader's candidate id, candidate lease
//!
//! Ephemeral keys hang off a session lease granted on first use and kept alive in the
//! background, so they vanish when this process dies.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LeaseGrantOptions, PutOptions, Txn,
    TxnOp, TxnOpResponse, WatchOptions,
};
use futures::Stream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordination::{Candidacy, CoordinationStore, ElectionCallback, LeaderElection};
use crate::error::RowLogError;
use crate::subscription::{sort_for_dispatch, Subscription};
use crate::types::{HostAddress, RowLogId, ShardId, SubscriptionId};

/// etcd-backed coordination using leases for ephemeral registrations and transactions
/// for leader election.
pub struct EtcdCoordination {
    client: Arc<Mutex<Client>>,
    prefix: String,
    lease_ttl: i64,
    /// Session lease for processor and listener keys, granted on first use.
    session: Mutex<Option<i64>>,
    keep_alive_cancel: CancellationToken,
}

impl EtcdCoordination {
    /// - `client`: Connected etcd client.
    /// - `prefix`: Key prefix for all row log keys (e.g., "/rowlog/").
    /// - `lease_ttl`: TTL in seconds for leases of ephemeral keys and election candidates.
    pub fn new(client: Client, prefix: impl Into<String>, lease_ttl: i64) -> Result<Self, RowLogError> {
        if lease_ttl <= 0 {
            return Err(RowLogError::InvalidConfig {
                reason: format!("lease_ttl must be positive, got {lease_ttl}"),
            });
        }
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            prefix: prefix.into(),
            lease_ttl,
            session: Mutex::new(None),
            keep_alive_cancel: CancellationToken::new(),
        })
    }

    fn processor_key(&self, row_log: &RowLogId, shard: &ShardId) -> String {
        format!("{}{}/processors/{}", self.prefix, row_log, shard)
    }

    fn subscriptions_prefix(&self, row_log: &RowLogId) -> String {
        format!("{}{}/subscriptions/", self.prefix, row_log)
    }

    fn listeners_prefix(&self, row_log: &RowLogId, subscription: &SubscriptionId) -> String {
        format!("{}{}/listeners/{}/", self.prefix, row_log, subscription)
    }

    fn election_key(&self, path: &str) -> String {
        format!("{}elections/{}", self.prefix, path)
    }

    fn map_err(e: etcd_client::Error) -> RowLogError {
        RowLogError::CoordinationError {
            reason: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    /// Session lease id, granting it and starting its keep-alive on first use.
    async fn session_lease(&self) -> Result<i64, RowLogError> {
        let mut session = self.session.lock().await;
        if let Some(id) = *session {
            return Ok(id);
        }
        let id = grant_lease(&self.client, self.lease_ttl).await?;
        spawn_keep_alive(
            Arc::clone(&self.client),
            id,
            self.lease_ttl,
            self.keep_alive_cancel.child_token(),
            None,
        );
        *session = Some(id);
        Ok(id)
    }

    async fn load_subscriptions(
        client: &Arc<Mutex<Client>>,
        prefix: &str,
    ) -> Result<Vec<Subscription>, RowLogError> {
        let resp = client
            .lock()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(Self::map_err)?;
        let mut subscriptions = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<Subscription>(kv.value()) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    tracing::warn!(
                        key = %kv.key_str().unwrap_or("<non-utf8>"),
                        error = %e,
                        "skipping malformed subscription entry in etcd"
                    );
                }
            }
        }
        sort_for_dispatch(&mut subscriptions);
        Ok(subscriptions)
    }
}

impl Drop for EtcdCoordination {
    fn drop(&mut self) {
        self.keep_alive_cancel.cancel();
    }
}

async fn grant_lease(client: &Arc<Mutex<Client>>, ttl: i64) -> Result<i64, RowLogError> {
    let lease = client
        .lock()
        .await
        .lease_grant(ttl, None::<LeaseGrantOptions>)
        .await
        .map_err(EtcdCoordination::map_err)?;
    Ok(lease.id())
}

/// Keep `lease_id` alive until `cancel` fires or the lease is lost. `lost` is cancelled
/// when keep-alive gives up, so owners of lease-bound state can react.
fn spawn_keep_alive(
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    ttl: i64,
    cancel: CancellationToken,
    lost: Option<CancellationToken>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs((ttl as u64).max(3) / 3);
    tokio::spawn(async move {
        let result = {
            let mut c = client.lock().await;
            c.lease_keep_alive(lease_id).await
        };
        let (mut keeper, mut stream) = match result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "etcd keep-alive initialization failed");
                if let Some(lost) = lost {
                    lost.cancel();
                }
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = keeper.keep_alive().await {
                tracing::warn!(lease_id, error = %e, "etcd lease keep-alive failed");
                break;
            }
            match tokio::time::timeout(Duration::from_secs(5), stream.message()).await {
                Ok(Ok(Some(resp))) if resp.ttl() > 0 => {}
                Ok(Ok(Some(_))) => {
                    tracing::warn!(lease_id, "etcd lease expired");
                    break;
                }
                Ok(Ok(None)) => {
                    tracing::warn!(lease_id, "etcd keep-alive stream ended");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(lease_id, error = %e, "etcd keep-alive stream error");
                    break;
                }
                Err(_) => {
                    tracing::warn!(lease_id, "etcd keep-alive response timed out");
                    break;
                }
            }
        }
        if let Some(lost) = lost {
            lost.cancel();
        }
    })
}

#[async_trait]
impl CoordinationStore for EtcdCoordination {
    async fn publish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let lease_id = self.session_lease().await?;
        let key = self.processor_key(row_log, shard);
        self.client
            .lock()
            .await
            .put(
                key,
                address.to_string(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn unpublish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let key = self.processor_key(row_log, shard);
        let value = address.to_string();
        // Only delete if the key still holds our address.
        let txn = Txn::new()
            .when([Compare::value(
                key.as_bytes(),
                CompareOp::Equal,
                value.as_bytes(),
            )])
            .and_then([TxnOp::delete(key.as_bytes(), None)]);
        self.client
            .lock()
            .await
            .txn(txn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn processor_address(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
    ) -> Result<Option<HostAddress>, RowLogError> {
        let key = self.processor_key(row_log, shard);
        let resp = self
            .client
            .lock()
            .await
            .get(key.as_bytes(), None)
            .await
            .map_err(Self::map_err)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let address = kv.value_str().ok().and_then(HostAddress::parse);
        if address.is_none() {
            tracing::warn!(key = %key, "malformed processor address in etcd");
        }
        Ok(address)
    }

    async fn put_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &Subscription,
    ) -> Result<(), RowLogError> {
        let key = format!("{}{}", self.subscriptions_prefix(row_log), subscription.id);
        let data = serde_json::to_vec(subscription).map_err(|e| RowLogError::CoordinationError {
            reason: format!("failed to serialize subscription: {e}"),
            source: Some(Box::new(e)),
        })?;
        self.client
            .lock()
            .await
            .put(key, data, None)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn remove_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        let key = format!("{}{}", self.subscriptions_prefix(row_log), subscription);
        self.client
            .lock()
            .await
            .delete(key, None)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn subscriptions(&self, row_log: &RowLogId) -> Result<Vec<Subscription>, RowLogError> {
        Self::load_subscriptions(&self.client, &self.subscriptions_prefix(row_log)).await
    }

    async fn watch_subscriptions(
        &self,
        row_log: &RowLogId,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<Subscription>> + Send>>, RowLogError> {
        let prefix = self.subscriptions_prefix(row_log);
        let (mut watcher, watch_stream) = self
            .client
            .lock()
            .await
            .watch(prefix.as_bytes(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(Self::map_err)?;

        let client = Arc::clone(&self.client);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // Turns watch events into full snapshots. Reconnects with backoff when the stream
        // ends, then sends a snapshot to cover the gap.
        tokio::spawn(async move {
            let mut stream = watch_stream;
            let mut consecutive_failures: u32 = 0;
            const MAX_RECONNECT_FAILURES: u32 = 50;
            const MAX_BACKOFF: Duration = Duration::from_secs(30);

            'outer: loop {
                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            consecutive_failures = 0;
                            let relevant = resp.events().iter().any(|e| {
                                matches!(e.event_type(), EventType::Put | EventType::Delete)
                            });
                            if !relevant {
                                continue;
                            }
                            match Self::load_subscriptions(&client, &prefix).await {
                                Ok(snapshot) => {
                                    if tx.send(snapshot).is_err() {
                                        break 'outer;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "etcd get failed after subscription watch event");
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::warn!("etcd subscription watch ended, reconnecting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "etcd subscription watch error, reconnecting");
                            break;
                        }
                    }
                }

                if let Err(e) = watcher.cancel().await {
                    tracing::warn!(error = %e, "failed to cancel etcd watch before reconnection");
                }
                consecutive_failures += 1;
                if consecutive_failures >= MAX_RECONNECT_FAILURES {
                    tracing::error!(
                        consecutive_failures,
                        "etcd subscription watch gave up reconnecting"
                    );
                    break 'outer;
                }
                let backoff = std::cmp::min(
                    Duration::from_millis(500u64.saturating_mul(1u64 << consecutive_failures.min(10))),
                    MAX_BACKOFF,
                );
                tokio::time::sleep(backoff).await;

                let reconnected = client
                    .lock()
                    .await
                    .watch(prefix.as_bytes(), Some(WatchOptions::new().with_prefix()))
                    .await;
                match reconnected {
                    Ok((new_watcher, new_stream)) => {
                        watcher = new_watcher;
                        stream = new_stream;
                        tracing::info!("etcd subscription watch reconnected");
                        if let Ok(snapshot) = Self::load_subscriptions(&client, &prefix).await {
                            if tx.send(snapshot).is_err() {
                                break 'outer;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt = consecutive_failures, "etcd watch reconnection failed");
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                tracing::warn!(error = %e, "failed to cancel etcd watch on task exit");
            }
        });

        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }

    async fn add_listener(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let lease_id = self.session_lease().await?;
        let key = format!("{}{}", self.listeners_prefix(row_log, subscription), address);
        self.client
            .lock()
            .await
            .put(
                key,
                address.to_string(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn remove_listener(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let key = format!("{}{}", self.listeners_prefix(row_log, subscription), address);
        self.client
            .lock()
            .await
            .delete(key, None)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn listeners(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<Vec<HostAddress>, RowLogError> {
        let prefix = self.listeners_prefix(row_log, subscription);
        let resp = self
            .client
            .lock()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(Self::map_err)?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.value_str().ok().and_then(HostAddress::parse))
            .collect())
    }
}

/// Candidacy backed by an election key created under the candidate's own lease.
struct EtcdCandidacy {
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    leading: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Candidacy for EtcdCandidacy {
    fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    async fn resign(&self) -> Result<(), RowLogError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "election task failed");
            }
        }
        // Revoking deletes the election key, so the next candidate can take over.
        self.client
            .lock()
            .await
            .lease_revoke(self.lease_id)
            .await
            .map_err(EtcdCoordination::map_err)?;
        Ok(())
    }
}

impl Drop for EtcdCandidacy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Whether the election key holds `candidate` after trying to create it.
async fn try_acquire(
    client: &Arc<Mutex<Client>>,
    key: &str,
    candidate: &str,
    lease_id: i64,
) -> Result<(bool, i64), RowLogError> {
    let txn = Txn::new()
        .when([Compare::create_revision(key, CompareOp::Equal, 0)])
        .and_then([TxnOp::put(
            key,
            candidate,
            Some(PutOptions::new().with_lease(lease_id)),
        )])
        .or_else([TxnOp::get(key, None)]);
    let resp = client
        .lock()
        .await
        .txn(txn)
        .await
        .map_err(EtcdCoordination::map_err)?;
    let revision = resp.header().map_or(0, |h| h.revision());
    if resp.succeeded() {
        return Ok((true, revision));
    }
    let ours = resp.op_responses().iter().any(|op| match op {
        TxnOpResponse::Get(get) => get
            .kvs()
            .first()
            .is_some_and(|kv| kv.value() == candidate.as_bytes()),
        _ => false,
    });
    Ok((ours, revision))
}

/// Block until the election key is deleted or `cancel` fires. Returns false on
/// cancellation.
async fn wait_for_delete(
    client: &Arc<Mutex<Client>>,
    key: &str,
    after_revision: i64,
    cancel: &CancellationToken,
) -> Result<bool, RowLogError> {
    let (mut watcher, mut stream) = client
        .lock()
        .await
        .watch(
            key,
            Some(WatchOptions::new().with_start_revision(after_revision + 1)),
        )
        .await
        .map_err(EtcdCoordination::map_err)?;
    let deleted = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break false,
            message = stream.message() => message,
        };
        match message {
            Ok(Some(resp)) => {
                if resp
                    .events()
                    .iter()
                    .any(|e| e.event_type() == EventType::Delete)
                {
                    break true;
                }
            }
            // Stream lost: re-check the key through a fresh acquire attempt.
            Ok(None) | Err(_) => break true,
        }
    };
    if let Err(e) = watcher.cancel().await {
        tracing::debug!(error = %e, "failed to cancel election watch");
    }
    Ok(deleted)
}

async fn run_election(
    client: Arc<Mutex<Client>>,
    key: String,
    lease_id: i64,
    callback: Arc<dyn ElectionCallback>,
    leading: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let candidate = lease_id.to_string();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let (won, revision) = match try_acquire(&client, &key, &candidate, lease_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "election attempt failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };
        if won && !leading.swap(true, Ordering::AcqRel) {
            tracing::info!(key = %key, "won leader election");
            callback.on_become_leader().await;
        }
        let waited = wait_for_delete(&client, &key, revision, &cancel).await;
        if won {
            leading.store(false, Ordering::Release);
            tracing::info!(key = %key, "leadership ended");
            callback.on_lose_leadership().await;
        }
        match waited {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "election watch failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

#[async_trait]
impl LeaderElection for EtcdCoordination {
    async fn elect(
        &self,
        path: &str,
        callback: Arc<dyn ElectionCallback>,
    ) -> Result<Box<dyn Candidacy>, RowLogError> {
        let lease_id = grant_lease(&self.client, self.lease_ttl).await?;
        let cancel = self.keep_alive_cancel.child_token();
        // Losing the lease ends the candidacy; its key is gone with it.
        spawn_keep_alive(
            Arc::clone(&self.client),
            lease_id,
            self.lease_ttl,
            cancel.clone(),
            Some(cancel.clone()),
        );
        let leading = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_election(
            Arc::clone(&self.client),
            self.election_key(path),
            lease_id,
            callback,
            Arc::clone(&leading),
            cancel.clone(),
        ));
        Ok(Box::new(EtcdCandidacy {
            client: Arc::clone(&self.client),
            lease_id,
            leading,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }))
    }
}
