//! Leader-elected processor.
//!
//! Every member of a fleet runs a [`RowLogProcessor`] for the row log shard, but only the
//! elected leader scans it. For the duration of a leadership term the leader owns one
//! worker task per registered subscription, a wake-up listener whose address it publishes,
//! and a task that starts and stops workers as subscriptions come and go. Losing leadership
//! tears the whole term down before another member can take over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::coordination::{Candidacy, ElectionCallback, LeaderElection};
use crate::error::RowLogError;
use crate::handler::SubscriptionHandler;
use crate::metrics::RowLogMetrics;
use crate::row_log::RowLog;
use crate::subscription::Subscription;
use crate::transport::ListenerTransport;
use crate::types::{HostAddress, SubscriptionId};
use crate::wakeup::{WakeupListener, WakeupSignal};
use crate::worker::SubscriptionWorker;

struct WorkerHandle {
    subscription: Subscription,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything owned during one leadership term.
struct LeaderTerm {
    cancel: CancellationToken,
    workers: HashMap<SubscriptionId, WorkerHandle>,
    /// Published wake-up address, if the listener opened and publishing succeeded.
    wakeup_address: Option<HostAddress>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RowLogProcessor {
    row_log: Arc<RowLog>,
    election: Arc<dyn LeaderElection>,
    transport: Arc<dyn ListenerTransport>,
    metrics: Arc<RowLogMetrics>,
    signal: WakeupSignal,
    term: Mutex<Option<LeaderTerm>>,
    leader: AtomicBool,
    candidacy: Mutex<Option<Box<dyn Candidacy>>>,
}

impl RowLogProcessor {
    pub fn new(
        row_log: Arc<RowLog>,
        election: Arc<dyn LeaderElection>,
        transport: Arc<dyn ListenerTransport>,
        metrics: Arc<RowLogMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            row_log,
            election,
            transport,
            metrics,
            signal: WakeupSignal::new(),
            term: Mutex::new(None),
            leader: AtomicBool::new(false),
            candidacy: Mutex::new(None),
        })
    }

    /// Join the leader election. Scanning starts when, and each time, this member is elected.
    #[instrument(skip(self), fields(row_log = %self.row_log.config().row_log_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), RowLogError> {
        let mut candidacy = self.candidacy.lock().await;
        if candidacy.is_some() {
            return Ok(());
        }
        let callback = Arc::new(ProcessorCallback {
            processor: Arc::downgrade(self),
        });
        let path = self.row_log.config().election_path();
        *candidacy = Some(self.election.elect(&path, callback).await?);
        tracing::info!(path = %path, "processor joined leader election");
        Ok(())
    }

    /// Leave the election and end the current term, if any.
    #[instrument(skip(self), fields(row_log = %self.row_log.config().row_log_id))]
    pub async fn stop(&self) {
        let candidacy = self.candidacy.lock().await.take();
        if let Some(candidacy) = candidacy {
            if let Err(e) = candidacy.resign().await {
                tracing::warn!(error = %e, "failed to resign leadership");
            }
        }
        self.deactivate().await;
        tracing::info!("processor stopped");
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Whether a worker for the subscription is running in the current term.
    pub async fn is_running(&self, subscription: &SubscriptionId) -> bool {
        self.term.lock().await.as_ref().map_or(false, |term| {
            term.workers
                .get(subscription)
                .map_or(false, |w| !w.handle.is_finished())
        })
    }

    /// Wake-up address published for the current term.
    pub async fn wakeup_address(&self) -> Option<HostAddress> {
        self.term
            .lock()
            .await
            .as_ref()
            .and_then(|term| term.wakeup_address.clone())
    }

    pub fn metrics(&self) -> &Arc<RowLogMetrics> {
        &self.metrics
    }

    async fn activate(self: &Arc<Self>) {
        let mut guard = self.term.lock().await;
        if guard.is_some() {
            return;
        }
        let config = self.row_log.config();
        let mut term = LeaderTerm {
            cancel: CancellationToken::new(),
            workers: HashMap::new(),
            wakeup_address: None,
            tasks: Vec::new(),
        };

        if config.wakeup_enabled {
            self.open_wakeup_channel(&mut term).await;
        }

        let mut updates = self.row_log.watch_subscriptions();
        let initial = Arc::clone(&updates.borrow_and_update());
        // Nothing is stale in a fresh term.
        let _ = self.sync_workers(&mut term, &initial);

        let weak = Arc::downgrade(self);
        let cancel = term.cancel.clone();
        term.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let snapshot = Arc::clone(&updates.borrow_and_update());
                let Some(processor) = weak.upgrade() else {
                    break;
                };
                processor.subscriptions_changed(&snapshot).await;
            }
        }));

        tracing::info!(
            row_log = %config.row_log_id,
            shard = %config.shard_id,
            workers = term.workers.len(),
            wakeup_address = ?term.wakeup_address,
            "became row log leader"
        );
        *guard = Some(term);
        self.leader.store(true, Ordering::Release);
        self.metrics.leader.set(1);
    }

    /// Open the wake-up listener and publish its address. Failures degrade to poll-only.
    async fn open_wakeup_channel(&self, term: &mut LeaderTerm) {
        let config = self.row_log.config();
        let listener = match WakeupListener::bind(&config.wakeup_listen_host).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "wake-up listener unavailable, relying on polling");
                return;
            }
        };
        let address = HostAddress::advertised(config.wakeup_advertise_host(), listener.local_addr());
        term.tasks.push(tokio::spawn(
            listener.serve(self.signal.clone(), term.cancel.child_token()),
        ));
        match self
            .row_log
            .coordination()
            .publish_processor(&config.row_log_id, &config.shard_id, &address)
            .await
        {
            Ok(()) => term.wakeup_address = Some(address),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "failed to publish processor address, relying on polling");
            }
        }
    }

    async fn deactivate(&self) {
        let term = self.term.lock().await.take();
        self.leader.store(false, Ordering::Release);
        self.metrics.leader.set(0);
        let Some(term) = term else {
            return;
        };
        let config = self.row_log.config();

        if let Some(address) = &term.wakeup_address {
            if let Err(e) = self
                .row_log
                .coordination()
                .unpublish_processor(&config.row_log_id, &config.shard_id, address)
                .await
            {
                tracing::warn!(address = %address, error = %e, "failed to unpublish processor address");
            }
        }
        term.cancel.cancel();

        let workers: Vec<WorkerHandle> = term.workers.into_values().collect();
        self.join_workers(workers).await;
        for handle in term.tasks {
            self.join("processor task", handle).await;
        }
        self.metrics.workers.set(0);
        tracing::info!(row_log = %config.row_log_id, "lost row log leadership");
    }

    async fn subscriptions_changed(&self, subscriptions: &[Subscription]) {
        let stale = {
            let mut guard = self.term.lock().await;
            let Some(term) = guard.as_mut() else {
                return;
            };
            if term.cancel.is_cancelled() {
                return;
            }
            self.sync_workers(term, subscriptions)
        };
        self.join_workers(stale).await;
    }

    /// Start workers for new subscriptions and detach those of removed or changed ones.
    /// Returns the detached workers, already cancelled, for the caller to join.
    fn sync_workers(&self, term: &mut LeaderTerm, subscriptions: &[Subscription]) -> Vec<WorkerHandle> {
        let mut stale = Vec::new();
        let current: HashMap<&SubscriptionId, &Subscription> =
            subscriptions.iter().map(|s| (&s.id, s)).collect();

        let outdated: Vec<SubscriptionId> = term
            .workers
            .iter()
            .filter(|(id, w)| current.get(id).map_or(true, |s| **s != w.subscription))
            .map(|(id, _)| id.clone())
            .collect();
        for id in outdated {
            if let Some(worker) = term.workers.remove(&id) {
                tracing::info!(subscription = %id, "stopping subscription worker");
                worker.cancel.cancel();
                stale.push(worker);
            }
        }

        for subscription in subscriptions {
            if term.workers.contains_key(&subscription.id) {
                continue;
            }
            let worker = self.spawn_worker(term, subscription.clone());
            term.workers.insert(subscription.id.clone(), worker);
        }
        self.metrics.workers.set(term.workers.len() as i64);
        stale
    }

    fn spawn_worker(&self, term: &LeaderTerm, subscription: Subscription) -> WorkerHandle {
        let config = self.row_log.config();
        let handler = SubscriptionHandler::for_subscription(
            &subscription,
            config.row_log_id.clone(),
            Arc::clone(self.row_log.listeners()),
            Arc::clone(self.row_log.coordination()),
            Arc::clone(&self.transport),
            config.remote_ack_timeout,
        );
        let cancel = term.cancel.child_token();
        let worker = SubscriptionWorker::new(
            subscription.clone(),
            Arc::clone(&self.row_log),
            handler,
            self.signal.clone(),
            cancel.clone(),
            Arc::clone(&self.metrics),
        );
        tracing::info!(subscription = %subscription.id, kind = ?subscription.kind, "starting subscription worker");
        WorkerHandle {
            subscription,
            cancel,
            handle: tokio::spawn(worker.run()),
        }
    }

    async fn join_workers(&self, workers: Vec<WorkerHandle>) {
        for worker in workers {
            worker.cancel.cancel();
            self.join(worker.subscription.id.as_ref(), worker.handle).await;
        }
    }

    async fn join(&self, name: &str, handle: JoinHandle<()>) {
        let timeout = self.row_log.config().worker_join_timeout;
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(join_error)) => log_join_error(name, join_error),
            Err(_timeout) => {
                tracing::warn!(
                    task = name,
                    timeout_secs = timeout.as_secs_f64(),
                    "task did not stop within join timeout"
                );
            }
        }
    }
}

fn log_join_error(name: &str, join_error: JoinError) {
    if join_error.is_panic() {
        let panic_payload = join_error.into_panic();
        let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic_payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::error!(task = name, panic_message = %msg, "task panicked");
    } else {
        tracing::warn!(task = name, error = %join_error, "task failed");
    }
}

impl Drop for RowLogProcessor {
    fn drop(&mut self) {
        if let Ok(mut term) = self.term.try_lock() {
            if let Some(term) = term.take() {
                term.cancel.cancel();
            }
        }
    }
}

struct ProcessorCallback {
    processor: Weak<RowLogProcessor>,
}

#[async_trait]
impl ElectionCallback for ProcessorCallback {
    async fn on_become_leader(&self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.activate().await;
        }
    }

    async fn on_lose_leadership(&self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.deactivate().await;
        }
    }
}
