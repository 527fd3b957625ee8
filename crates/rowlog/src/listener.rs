use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RowLogError;
use crate::message::Message;
use crate::types::SubscriptionId;

/// Consumer callback of a subscription.
///
/// Returns `Ok(true)` when the message is done for the subscription. `Ok(false)` and errors
/// count as failed attempts. Consumers must be idempotent: a message can be delivered more
/// than once.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn process_message(&self, message: &Message) -> Result<bool, RowLogError>;
}

/// In-process listeners of Local subscriptions, keyed by subscription.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<SubscriptionId, Arc<dyn MessageListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, replacing any previous one for the subscription.
    pub fn register(&self, subscription: SubscriptionId, listener: Arc<dyn MessageListener>) {
        self.listeners.insert(subscription, listener);
    }

    pub fn unregister(&self, subscription: &SubscriptionId) -> Option<Arc<dyn MessageListener>> {
        self.listeners.remove(subscription).map(|(_, l)| l)
    }

    pub fn get(&self, subscription: &SubscriptionId) -> Option<Arc<dyn MessageListener>> {
        self.listeners.get(subscription).map(|l| Arc::clone(l.value()))
    }
}
