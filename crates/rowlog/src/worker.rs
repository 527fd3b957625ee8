//! Scan-dispatch-wait loop of one subscription.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::RowLogError;
use crate::handler::{DispatchOutcome, SubscriptionHandler};
use crate::message::{Message, RowKey};
use crate::metrics::RowLogMetrics;
use crate::row_log::{AttemptOutcome, RowLog};
use crate::shard::ScannedMessage;
use crate::subscription::Subscription;
use crate::wakeup::WakeupSignal;

/// How a batch ended.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
struct BatchReport {
    /// At least one message was marked done.
    progressed: bool,
    /// A stop was requested mid-batch.
    stopped: bool,
}

pub(crate) struct SubscriptionWorker {
    subscription: Subscription,
    row_log: Arc<RowLog>,
    handler: SubscriptionHandler,
    signal: WakeupSignal,
    wakeups: watch::Receiver<u64>,
    cancel: CancellationToken,
    metrics: Arc<RowLogMetrics>,
}

impl SubscriptionWorker {
    pub(crate) fn new(
        subscription: Subscription,
        row_log: Arc<RowLog>,
        handler: SubscriptionHandler,
        signal: WakeupSignal,
        cancel: CancellationToken,
        metrics: Arc<RowLogMetrics>,
    ) -> Self {
        let wakeups = signal.subscribe();
        Self {
            subscription,
            row_log,
            handler,
            signal,
            wakeups,
            cancel,
            metrics,
        }
    }

    /// Run until cancelled or until the shard becomes unreachable.
    #[instrument(skip(self), fields(subscription = %self.subscription.id))]
    pub(crate) async fn run(mut self) {
        tracing::debug!("subscription worker started");
        let batch_size = self.row_log.config().scan_batch_size;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            // Anything signalled from here on triggers another scan.
            let _seen = *self.wakeups.borrow_and_update();

            let scan = tokio::select! {
                _ = self.cancel.cancelled() => break,
                scan = self.row_log.shard().next(&self.subscription.id, batch_size) => scan,
            };
            self.metrics.scans.inc();
            let batch = match scan {
                Ok(batch) => batch,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "shard scan failed, retrying");
                    if !self.pause(self.row_log.config().store_retry_backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "shard unreachable, worker stopping");
                    break;
                }
            };
            self.metrics.scanned_messages.inc_by(batch.len() as u64);

            let report = self.process_batch(batch).await;
            if report.stopped {
                break;
            }
            if report.progressed {
                // Later subscriptions may be gated on what this one just finished.
                self.signal.wake();
                continue;
            }
            // Without progress a rescan returns the same head of the index.
            let idle = self.row_log.config().idle_poll_timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.wakeups.changed() => {
                    if changed.is_err() {
                        // Sender gone, only the poll timeout is left.
                        if !self.pause(idle).await {
                            break;
                        }
                    } else {
                        self.metrics.wakeups.inc();
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
        tracing::debug!("subscription worker stopped");
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn process_batch(&self, batch: Vec<ScannedMessage>) -> BatchReport {
        let mut report = BatchReport::default();
        // Rows with an undelivered earlier message; later messages of the row wait for it.
        let mut blocked_rows: HashSet<Vec<u8>> = HashSet::new();

        for scanned in batch {
            if self.cancel.is_cancelled() {
                report.stopped = true;
                break;
            }
            let message = scanned.message;
            if scanned.problematic {
                tracing::trace!(message = %message, "skipping problematic message");
                continue;
            }
            if blocked_rows.contains(&message.row_key) {
                continue;
            }
            match self.deliver(&message).await {
                Ok(Delivery::Done) => report.progressed = true,
                Ok(Delivery::Skipped) => {}
                Ok(Delivery::Pending) => {
                    blocked_rows.insert(message.row_key.clone());
                }
                Ok(Delivery::Unavailable) => break,
                Ok(Delivery::Stopped) => {
                    report.stopped = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        message = %message,
                        row = %RowKey(&message.row_key),
                        error = %e,
                        "failed to update execution state"
                    );
                    blocked_rows.insert(message.row_key.clone());
                }
            }
        }
        report
    }

    async fn deliver(&self, message: &Message) -> Result<Delivery, RowLogError> {
        let sub = &self.subscription.id;
        let Some(state) = self.row_log.execution_state(message).await? else {
            // Purged concurrently.
            return Ok(Delivery::Skipped);
        };
        if state.is_done(sub) {
            self.row_log.shard().remove_message(message, sub).await?;
            return Ok(Delivery::Skipped);
        }
        if state.waits_on_earlier(sub, &self.row_log.registered_ids()) {
            return Ok(Delivery::Pending);
        }

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Delivery::Stopped),
            outcome = self.handler.dispatch(message) => outcome,
        };

        match outcome {
            DispatchOutcome::Done => {
                self.row_log.message_done(message, sub).await?;
                self.metrics.delivered.inc();
                Ok(Delivery::Done)
            }
            DispatchOutcome::Unavailable(reason) => {
                tracing::debug!(message = %message, reason = %reason, "no consumer available");
                Ok(Delivery::Unavailable)
            }
            outcome => {
                self.metrics.failed_attempts.inc();
                match self.row_log.message_failed(message, &self.subscription).await? {
                    AttemptOutcome::Problematic { attempts } => {
                        self.metrics.problematic.inc();
                        tracing::warn!(
                            message = %message,
                            attempts,
                            outcome = ?outcome,
                            "message marked problematic"
                        );
                    }
                    AttemptOutcome::Pending { attempts } => {
                        tracing::info!(
                            message = %message,
                            attempts,
                            max_tries = self.subscription.max_tries,
                            outcome = ?outcome,
                            "delivery failed, message stays pending"
                        );
                    }
                    AttemptOutcome::Resolved => return Ok(Delivery::Skipped),
                }
                Ok(Delivery::Pending)
            }
        }
    }
}

enum Delivery {
    Done,
    Skipped,
    Pending,
    Unavailable,
    Stopped,
}
