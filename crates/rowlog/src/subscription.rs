use serde::{Deserialize, Serialize};

use crate::error::RowLogError;
use crate::types::SubscriptionId;

/// How messages are handed to a subscription's consumer.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// An in-process listener registered on the row log.
    Local,
    /// A listener process reached through the coordination store's listener registry.
    Remote,
}

/// A registered, independently tracked consumer of row log messages.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub kind: SubscriptionKind,
    /// Lower values are dispatched first.
    pub order_index: i32,
    /// Failed attempts after which a message becomes problematic.
    pub max_tries: u32,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        kind: SubscriptionKind,
        order_index: i32,
        max_tries: u32,
    ) -> Self {
        Self {
            id: SubscriptionId::new(id),
            kind,
            order_index,
            max_tries,
        }
    }

    pub fn local(id: impl Into<String>, order_index: i32, max_tries: u32) -> Self {
        Self::new(id, SubscriptionKind::Local, order_index, max_tries)
    }

    pub fn remote(id: impl Into<String>, order_index: i32, max_tries: u32) -> Self {
        Self::new(id, SubscriptionKind::Remote, order_index, max_tries)
    }

    pub fn validate(&self) -> Result<(), RowLogError> {
        if self.id.is_empty() {
            return Err(RowLogError::InvalidConfig {
                reason: "subscription id must not be empty".to_string(),
            });
        }
        if self.max_tries == 0 {
            return Err(RowLogError::InvalidConfig {
                reason: format!("subscription {} must allow at least one try", self.id),
            });
        }
        Ok(())
    }
}

/// Sort subscriptions into dispatch order: ascending `order_index`, ties broken by id.
pub fn sort_for_dispatch(subscriptions: &mut [Subscription]) {
    subscriptions.sort_by(|a, b| {
        a.order_index
            .cmp(&b.order_index)
            .then_with(|| a.id.cmp(&b.id))
    });
}
