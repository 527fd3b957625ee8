//! Coordination collaborators: the key/value registry used to publish where processors and
//! remote listeners live, and leader election.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::RowLogError;
use crate::subscription::Subscription;
use crate::types::{HostAddress, RowLogId, ShardId, SubscriptionId};

/// Shared coordination state for a fleet of row log processes.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Publish the wake-up address of the processor currently leading `(row_log, shard)`.
    async fn publish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError>;

    /// Delete the published processor address if it is still `address`. An entry published
    /// by a newer leader is left alone.
    async fn unpublish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError>;

    async fn processor_address(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
    ) -> Result<Option<HostAddress>, RowLogError>;

    /// Add or replace a subscription.
    async fn put_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &Subscription,
    ) -> Result<(), RowLogError>;

    async fn remove_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError>;

    async fn subscriptions(&self, row_log: &RowLogId) -> Result<Vec<Subscription>, RowLogError>;

    /// Stream of full subscription snapshots, one per change.
    async fn watch_subscriptions(
        &self,
        row_log: &RowLogId,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<Subscription>> + Send>>, RowLogError>;

    /// Register a remote listener endpoint for a subscription.
    async fn add_listener(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
        address: &HostAddress,
    ) -> Result<(), RowLogError>;

    async fn remove_listener(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
        address: &HostAddress,
    ) -> Result<(), RowLogError>;

    async fn listeners(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<Vec<HostAddress>, RowLogError>;
}

/// Hooks invoked by a [`LeaderElection`] when leadership changes.
#[async_trait]
pub trait ElectionCallback: Send + Sync {
    async fn on_become_leader(&self);

    async fn on_lose_leadership(&self);
}

/// A participation in an election.
#[async_trait]
pub trait Candidacy: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Leave the election. If this candidate leads, `on_lose_leadership` has completed by
    /// the time this returns.
    async fn resign(&self) -> Result<(), RowLogError>;
}

/// Leader election over a path.
///
/// At most one candidate per path is leader at any time, and a demoted leader's
/// `on_lose_leadership` finishes before the next leader's `on_become_leader` starts.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn elect(
        &self,
        path: &str,
        callback: Arc<dyn ElectionCallback>,
    ) -> Result<Box<dyn Candidacy>, RowLogError>;
}
