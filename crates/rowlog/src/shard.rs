use async_trait::async_trait;

use crate::error::RowLogError;
use crate::message::Message;
use crate::types::{ShardId, SubscriptionId};

/// A message returned by [`RowLogShard::next`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScannedMessage {
    pub message: Message,
    /// The message is in the subscription's problematic set.
    pub problematic: bool,
}

/// Secondary index of pending `(message, subscription)` work items.
///
/// Implementations must allow concurrent calls from workers of different subscriptions.
#[async_trait]
pub trait RowLogShard: Send + Sync {
    fn id(&self) -> &ShardId;

    /// Add a pending entry for each subscription.
    async fn put_message(
        &self,
        message: &Message,
        subscriptions: &[SubscriptionId],
    ) -> Result<(), RowLogError>;

    /// Drop the pending entry of `subscription` for this message.
    async fn remove_message(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError>;

    /// Pending messages of a subscription, ordered by row key, then timestamp, then sequence.
    ///
    /// At most `limit` non-problematic messages are returned. Problematic messages met
    /// before the limit is reached are included with their flag set and do not count
    /// towards it, but no more than `limit` of them, so a batch never exceeds `2 * limit`.
    async fn next(
        &self,
        subscription: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ScannedMessage>, RowLogError>;

    async fn put_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError>;

    async fn remove_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError>;

    async fn is_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError>;

    /// The problematic set of a subscription, in scan order.
    async fn problematic(&self, subscription: &SubscriptionId)
        -> Result<Vec<Message>, RowLogError>;
}
