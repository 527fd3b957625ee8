//! Dispatch of messages to a subscription's consumer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::coordination::CoordinationStore;
use crate::listener::ListenerRegistry;
use crate::message::Message;
use crate::subscription::{Subscription, SubscriptionKind};
use crate::transport::ListenerTransport;
use crate::types::{RowLogId, SubscriptionId};

/// Result of handing one message to a consumer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The consumer finished the message.
    Done,
    /// The consumer ran but did not finish the message. Counts as a failed attempt.
    NotDone,
    /// The consumer failed. Counts as a failed attempt.
    Failed(String),
    /// No consumer could be reached. The message stays pending without using up a try.
    Unavailable(String),
}

impl DispatchOutcome {
    /// Whether this outcome counts against the subscription's `max_tries`.
    pub fn is_failed_attempt(&self) -> bool {
        matches!(self, DispatchOutcome::NotDone | DispatchOutcome::Failed(_))
    }
}

/// Calls the in-process listener registered for the subscription.
pub struct LocalDispatch {
    subscription: SubscriptionId,
    listeners: Arc<ListenerRegistry>,
}

/// Forwards messages to a remote listener found in the coordination store.
pub struct RemoteDispatch {
    row_log: RowLogId,
    subscription: SubscriptionId,
    coordination: Arc<dyn CoordinationStore>,
    transport: Arc<dyn ListenerTransport>,
    ack_timeout: Duration,
    next_listener: AtomicUsize,
}

/// Dispatch target of a subscription, chosen from its kind when the worker starts.
pub enum SubscriptionHandler {
    Local(LocalDispatch),
    Remote(RemoteDispatch),
}

impl SubscriptionHandler {
    pub fn local(subscription: SubscriptionId, listeners: Arc<ListenerRegistry>) -> Self {
        SubscriptionHandler::Local(LocalDispatch {
            subscription,
            listeners,
        })
    }

    pub fn remote(
        row_log: RowLogId,
        subscription: SubscriptionId,
        coordination: Arc<dyn CoordinationStore>,
        transport: Arc<dyn ListenerTransport>,
        ack_timeout: Duration,
    ) -> Self {
        SubscriptionHandler::Remote(RemoteDispatch {
            row_log,
            subscription,
            coordination,
            transport,
            ack_timeout,
            next_listener: AtomicUsize::new(0),
        })
    }

    /// Build the handler matching `subscription.kind`.
    pub fn for_subscription(
        subscription: &Subscription,
        row_log: RowLogId,
        listeners: Arc<ListenerRegistry>,
        coordination: Arc<dyn CoordinationStore>,
        transport: Arc<dyn ListenerTransport>,
        ack_timeout: Duration,
    ) -> Self {
        match subscription.kind {
            SubscriptionKind::Local => Self::local(subscription.id.clone(), listeners),
            SubscriptionKind::Remote => Self::remote(
                row_log,
                subscription.id.clone(),
                coordination,
                transport,
                ack_timeout,
            ),
        }
    }

    pub async fn dispatch(&self, message: &Message) -> DispatchOutcome {
        match self {
            SubscriptionHandler::Local(local) => local.dispatch(message).await,
            SubscriptionHandler::Remote(remote) => remote.dispatch(message).await,
        }
    }
}

impl LocalDispatch {
    async fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let Some(listener) = self.listeners.get(&self.subscription) else {
            return DispatchOutcome::Unavailable(format!(
                "no local listener registered for {}",
                self.subscription
            ));
        };
        match AssertUnwindSafe(listener.process_message(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(true)) => DispatchOutcome::Done,
            Ok(Ok(false)) => DispatchOutcome::NotDone,
            Ok(Err(e)) => DispatchOutcome::Failed(e.to_string()),
            Err(panic) => {
                let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                DispatchOutcome::Failed(format!("listener panicked: {reason}"))
            }
        }
    }
}

impl RemoteDispatch {
    async fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let listeners = match self
            .coordination
            .listeners(&self.row_log, &self.subscription)
            .await
        {
            Ok(listeners) => listeners,
            Err(e) => {
                tracing::warn!(
                    subscription = %self.subscription,
                    error = %e,
                    "remote listener lookup failed"
                );
                return DispatchOutcome::Unavailable(e.to_string());
            }
        };
        if listeners.is_empty() {
            return DispatchOutcome::Unavailable(format!(
                "no remote listener registered for {}",
                self.subscription
            ));
        }
        let index = self.next_listener.fetch_add(1, Ordering::Relaxed) % listeners.len();
        let address = &listeners[index];

        match tokio::time::timeout(
            self.ack_timeout,
            self.transport.deliver(address, &self.subscription, message),
        )
        .await
        {
            Ok(Ok(true)) => DispatchOutcome::Done,
            Ok(Ok(false)) => DispatchOutcome::NotDone,
            Ok(Err(e)) => DispatchOutcome::Failed(e.to_string()),
            Err(_) => DispatchOutcome::Failed(format!(
                "no acknowledgement from {address} within {:?}",
                self.ack_timeout
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RowLogError;
    use crate::listener::MessageListener;
    use crate::storage::memory_coordination::MemoryCoordination;
    use crate::types::HostAddress;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    enum Behaviour {
        Done,
        NotDone,
        Error,
        Panic,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl MessageListener for Scripted {
        async fn process_message(&self, _message: &Message) -> Result<bool, RowLogError> {
            match self.0 {
                Behaviour::Done => Ok(true),
                Behaviour::NotDone => Ok(false),
                Behaviour::Error => Err(RowLogError::ListenerError {
                    subscription_id: SubscriptionId::new("index"),
                    reason: "index offline".into(),
                }),
                Behaviour::Panic => panic!("consumer bug"),
            }
        }
    }

    async fn local_outcome(behaviour: Behaviour) -> DispatchOutcome {
        let listeners = Arc::new(ListenerRegistry::new());
        let sub = SubscriptionId::new("index");
        listeners.register(sub.clone(), Arc::new(Scripted(behaviour)));
        SubscriptionHandler::local(sub, listeners)
            .dispatch(&Message::new("row", 1, 0))
            .await
    }

    #[tokio::test]
    async fn local_dispatch_maps_listener_results() {
        assert_eq!(local_outcome(Behaviour::Done).await, DispatchOutcome::Done);
        assert_eq!(local_outcome(Behaviour::NotDone).await, DispatchOutcome::NotDone);
        assert!(matches!(
            local_outcome(Behaviour::Error).await,
            DispatchOutcome::Failed(reason) if reason.contains("index offline")
        ));
    }

    #[tokio::test]
    async fn local_dispatch_catches_panics() {
        let outcome = local_outcome(Behaviour::Panic).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(ref reason) if reason.contains("consumer bug")
        ));
        assert!(outcome.is_failed_attempt());
    }

    #[tokio::test]
    async fn local_dispatch_without_listener_is_unavailable() {
        let handler = SubscriptionHandler::local(
            SubscriptionId::new("index"),
            Arc::new(ListenerRegistry::new()),
        );
        let outcome = handler.dispatch(&Message::new("row", 1, 0)).await;
        assert!(matches!(outcome, DispatchOutcome::Unavailable(_)));
        assert!(!outcome.is_failed_attempt());
    }

    /// Transport that records target addresses and answers after a delay.
    struct FakeTransport {
        delay: Duration,
        targets: Mutex<Vec<HostAddress>>,
    }

    #[async_trait]
    impl ListenerTransport for FakeTransport {
        async fn deliver(
            &self,
            address: &HostAddress,
            _subscription: &SubscriptionId,
            _message: &Message,
        ) -> Result<bool, RowLogError> {
            self.targets.lock().push(address.clone());
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }
    }

    async fn remote_handler(
        delay: Duration,
        listeners: &[HostAddress],
    ) -> (SubscriptionHandler, Arc<FakeTransport>) {
        let coordination = Arc::new(MemoryCoordination::new());
        let row_log = RowLogId::new("records");
        let sub = SubscriptionId::new("index");
        for address in listeners {
            coordination
                .add_listener(&row_log, &sub, address)
                .await
                .unwrap();
        }
        let transport = Arc::new(FakeTransport {
            delay,
            targets: Mutex::new(Vec::new()),
        });
        let handler = SubscriptionHandler::remote(
            row_log,
            sub,
            coordination,
            transport.clone(),
            Duration::from_millis(100),
        );
        (handler, transport)
    }

    #[tokio::test]
    async fn remote_dispatch_round_robins_listeners() {
        let a = HostAddress::new("10.0.0.1", 1);
        let b = HostAddress::new("10.0.0.2", 1);
        let (handler, transport) =
            remote_handler(Duration::ZERO, &[a.clone(), b.clone()]).await;
        for ts in 0..4 {
            assert_eq!(
                handler.dispatch(&Message::new("row", ts, 0)).await,
                DispatchOutcome::Done
            );
        }
        assert_eq!(*transport.targets.lock(), vec![a.clone(), b.clone(), a, b]);
    }

    #[tokio::test]
    async fn remote_dispatch_times_out() {
        let (handler, _) =
            remote_handler(Duration::from_secs(5), &[HostAddress::new("10.0.0.1", 1)]).await;
        let outcome = handler.dispatch(&Message::new("row", 1, 0)).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(ref reason) if reason.contains("no acknowledgement")
        ));
    }

    #[tokio::test]
    async fn remote_dispatch_without_listener_is_unavailable() {
        let (handler, transport) = remote_handler(Duration::ZERO, &[]).await;
        assert!(matches!(
            handler.dispatch(&Message::new("row", 1, 0)).await,
            DispatchOutcome::Unavailable(_)
        ));
        assert!(transport.targets.lock().is_empty());
    }
}
