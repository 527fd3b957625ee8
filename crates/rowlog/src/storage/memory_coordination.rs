use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use async_trait::async_trait;
use futures::Stream;

use crate::coordination::{Candidacy, CoordinationStore, ElectionCallback, LeaderElection};
use crate::error::RowLogError;
use crate::subscription::{sort_for_dispatch, Subscription};
use crate::types::{HostAddress, RowLogId, ShardId, SubscriptionId};

/// In-memory coordination store and leader election for testing.
///
/// Every clone of the `Arc` shares one registry, so several row logs and processors in one
/// process behave like members of a fleet.
pub struct MemoryCoordination {
    inner: Mutex<Inner>,
    elections: Elections,
    next_candidate: AtomicU64,
}

#[derive(Default)]
struct Inner {
    processors: HashMap<(RowLogId, ShardId), HostAddress>,
    subscriptions: HashMap<RowLogId, BTreeMap<SubscriptionId, Subscription>>,
    listeners: HashMap<(RowLogId, SubscriptionId), Vec<HostAddress>>,
    watchers: HashMap<RowLogId, Vec<tokio::sync::mpsc::UnboundedSender<Vec<Subscription>>>>,
    /// When set, registry operations fail with a coordination error.
    unavailable: bool,
}

#[derive(Default)]
struct ElectionQueue {
    leader: Option<u64>,
    candidates: VecDeque<Candidate>,
}

struct Candidate {
    id: u64,
    callback: Arc<dyn ElectionCallback>,
    leading: Arc<AtomicBool>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            elections: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            next_candidate: AtomicU64::new(1),
        }
    }

    /// Simulate an unreachable coordination service for the registry operations.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Expire the current leader of `path` as if its session died: it loses leadership,
    /// leaves the election, and the next candidate takes over. Returns whether a leader
    /// was expired.
    pub async fn expire_leader(&self, path: &str) -> bool {
        let mut elections = self.elections.lock().await;
        let Some(queue) = elections.get_mut(path) else {
            return false;
        };
        let Some(leader) = queue.leader else {
            return false;
        };
        demote(queue, leader).await;
        promote(queue).await;
        true
    }

    fn snapshot(inner: &Inner, row_log: &RowLogId) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = inner
            .subscriptions
            .get(row_log)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        sort_for_dispatch(&mut subs);
        subs
    }

    fn notify_watchers(inner: &mut Inner, row_log: &RowLogId) {
        let subs = Self::snapshot(inner, row_log);
        if let Some(watchers) = inner.watchers.get_mut(row_log) {
            watchers.retain(|tx| tx.send(subs.clone()).is_ok());
        }
    }

    fn check_available(inner: &Inner) -> Result<(), RowLogError> {
        if inner.unavailable {
            return Err(RowLogError::CoordinationError {
                reason: "coordination store unavailable".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `id` from the queue; if it was leading, run its `on_lose_leadership` first.
async fn demote(queue: &mut ElectionQueue, id: u64) {
    let Some(pos) = queue.candidates.iter().position(|c| c.id == id) else {
        return;
    };
    let Some(candidate) = queue.candidates.remove(pos) else {
        return;
    };
    if queue.leader == Some(id) {
        candidate.leading.store(false, Ordering::Release);
        candidate.callback.on_lose_leadership().await;
        queue.leader = None;
    }
}

/// Make the oldest candidate leader if nobody leads.
async fn promote(queue: &mut ElectionQueue) {
    if queue.leader.is_some() {
        return;
    }
    if let Some(next) = queue.candidates.front() {
        queue.leader = Some(next.id);
        next.leading.store(true, Ordering::Release);
        next.callback.on_become_leader().await;
    }
}

type Elections = Arc<tokio::sync::Mutex<HashMap<String, ElectionQueue>>>;

/// Take `id` out of the election on `path`, handing leadership to the next candidate.
async fn leave(elections: &Elections, path: &str, id: u64) {
    let mut elections = elections.lock().await;
    if let Some(queue) = elections.get_mut(path) {
        demote(queue, id).await;
        promote(queue).await;
        if queue.candidates.is_empty() {
            elections.remove(path);
        }
    }
}

struct MemoryCandidacy {
    path: String,
    id: u64,
    leading: Arc<AtomicBool>,
    resigned: AtomicBool,
    elections: Elections,
}

#[async_trait]
impl Candidacy for MemoryCandidacy {
    fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    async fn resign(&self) -> Result<(), RowLogError> {
        if !self.resigned.swap(true, Ordering::AcqRel) {
            leave(&self.elections, &self.path, self.id).await;
        }
        Ok(())
    }
}

/// A dropped candidacy leaves the election like an expired session.
impl Drop for MemoryCandidacy {
    fn drop(&mut self) {
        if self.resigned.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(path = %self.path, "candidacy dropped outside a runtime, election left as is");
            return;
        };
        let elections = Arc::clone(&self.elections);
        let path = std::mem::take(&mut self.path);
        let id = self.id;
        runtime.spawn(async move {
            leave(&elections, &path, id).await;
        });
    }
}

#[async_trait]
impl LeaderElection for MemoryCoordination {
    async fn elect(
        &self,
        path: &str,
        callback: Arc<dyn ElectionCallback>,
    ) -> Result<Box<dyn Candidacy>, RowLogError> {
        let id = self.next_candidate.fetch_add(1, Ordering::Relaxed);
        let leading = Arc::new(AtomicBool::new(false));
        let mut elections = self.elections.lock().await;
        let queue = elections.entry(path.to_string()).or_default();
        queue.candidates.push_back(Candidate {
            id,
            callback,
            leading: Arc::clone(&leading),
        });
        promote(queue).await;
        Ok(Box::new(MemoryCandidacy {
            path: path.to_string(),
            id,
            leading,
            resigned: AtomicBool::new(false),
            elections: Arc::clone(&self.elections),
        }))
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn publish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner
            .processors
            .insert((row_log.clone(), shard.clone()), address.clone());
        Ok(())
    }

    async fn unpublish_processor(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let key = (row_log.clone(), shard.clone());
        if inner.processors.get(&key) == Some(address) {
            inner.processors.remove(&key);
        }
        Ok(())
    }

    async fn processor_address(
        &self,
        row_log: &RowLogId,
        shard: &ShardId,
    ) -> Result<Option<HostAddress>, RowLogError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .processors
            .get(&(row_log.clone(), shard.clone()))
            .cloned())
    }

    async fn put_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &Subscription,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner
            .subscriptions
            .entry(row_log.clone())
            .or_default()
            .insert(subscription.id.clone(), subscription.clone());
        Self::notify_watchers(&mut inner, row_log);
        Ok(())
    }

    async fn remove_subscription(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let removed = inner
            .subscriptions
            .get_mut(row_log)
            .and_then(|m| m.remove(subscription))
            .is_some();
        if removed {
            Self::notify_watchers(&mut inner, row_log);
        }
        Ok(())
    }

    async fn subscriptions(&self, row_log: &RowLogId) -> Result<Vec<Subscription>, RowLogError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(Self::snapshot(&inner, row_log))
    }

    async fn watch_subscriptions(
        &self,
        row_log: &RowLogId,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<Subscription>> + Send>>, RowLogError> {
        let mut inner = self.inner.lock();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inner.watchers.entry(row_log.clone()).or_default().push(tx);
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
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let listeners = inner
            .listeners
            .entry((row_log.clone(), subscription.clone()))
            .or_default();
        if !listeners.contains(address) {
            listeners.push(address.clone());
        }
        Ok(())
    }

    async fn remove_listener(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
        address: &HostAddress,
    ) -> Result<(), RowLogError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        if let Some(listeners) = inner
            .listeners
            .get_mut(&(row_log.clone(), subscription.clone()))
        {
            listeners.retain(|a| a != address);
        }
        Ok(())
    }

    async fn listeners(
        &self,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<Vec<HostAddress>, RowLogError> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .listeners
            .get(&(row_log.clone(), subscription.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn row_log() -> RowLogId {
        RowLogId::new("records")
    }

    /// Records the order of leadership transitions across candidates.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ElectionCallback for Recorder {
        async fn on_become_leader(&self) {
            self.log.lock().push(format!("{} up", self.name));
        }

        async fn on_lose_leadership(&self) {
            self.log.lock().push(format!("{} down", self.name));
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn ElectionCallback> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn publish_and_unpublish_processor() {
        let coord = MemoryCoordination::new();
        let shard = ShardId::new("shard1");
        let addr = HostAddress::new("127.0.0.1", 4000);
        coord.publish_processor(&row_log(), &shard, &addr).await.unwrap();
        assert_eq!(
            coord.processor_address(&row_log(), &shard).await.unwrap(),
            Some(addr.clone())
        );
        coord.unpublish_processor(&row_log(), &shard, &addr).await.unwrap();
        assert_eq!(coord.processor_address(&row_log(), &shard).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unpublish_leaves_a_newer_address_alone() {
        let coord = MemoryCoordination::new();
        let shard = ShardId::new("shard1");
        let old = HostAddress::new("127.0.0.1", 4000);
        let new = HostAddress::new("127.0.0.1", 4001);
        coord.publish_processor(&row_log(), &shard, &new).await.unwrap();
        coord.unpublish_processor(&row_log(), &shard, &old).await.unwrap();
        assert_eq!(
            coord.processor_address(&row_log(), &shard).await.unwrap(),
            Some(new)
        );
    }

    #[tokio::test]
    async fn subscription_changes_reach_watchers() {
        let coord = MemoryCoordination::new();
        let mut stream = coord.watch_subscriptions(&row_log()).await.unwrap();

        coord
            .put_subscription(&row_log(), &Subscription::local("blobs", 2, 3))
            .await
            .unwrap();
        coord
            .put_subscription(&row_log(), &Subscription::local("index", 1, 3))
            .await
            .unwrap();
        coord
            .remove_subscription(&row_log(), &SubscriptionId::new("blobs"))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().len(), 1);
        let second = stream.next().await.unwrap();
        assert_eq!(second[0].id.as_ref(), "index");
        assert_eq!(second[1].id.as_ref(), "blobs");
        assert_eq!(stream.next().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listeners_are_deduplicated() {
        let coord = MemoryCoordination::new();
        let sub = SubscriptionId::new("index");
        let addr = HostAddress::new("10.0.0.5", 7000);
        coord.add_listener(&row_log(), &sub, &addr).await.unwrap();
        coord.add_listener(&row_log(), &sub, &addr).await.unwrap();
        assert_eq!(coord.listeners(&row_log(), &sub).await.unwrap().len(), 1);
        coord.remove_listener(&row_log(), &sub, &addr).await.unwrap();
        assert!(coord.listeners(&row_log(), &sub).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_registry_operations() {
        let coord = MemoryCoordination::new();
        coord.set_unavailable(true);
        let err = coord
            .publish_processor(&row_log(), &ShardId::new("s"), &HostAddress::new("h", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RowLogError::CoordinationError { .. }));
        coord.set_unavailable(false);
        assert!(coord.subscriptions(&row_log()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_candidate_leads_and_handover_is_ordered() {
        let coord = MemoryCoordination::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = coord.elect("records/shard1", recorder("a", &log)).await.unwrap();
        let b = coord.elect("records/shard1", recorder("b", &log)).await.unwrap();
        assert!(a.is_leader());
        assert!(!b.is_leader());

        a.resign().await.unwrap();
        assert!(!a.is_leader());
        assert!(b.is_leader());
        assert_eq!(*log.lock(), vec!["a up", "a down", "b up"]);

        b.resign().await.unwrap();
        assert_eq!(log.lock().last().map(String::as_str), Some("b down"));
    }

    #[tokio::test]
    async fn expiring_the_leader_promotes_the_standby() {
        let coord = MemoryCoordination::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = coord.elect("p", recorder("a", &log)).await.unwrap();
        let b = coord.elect("p", recorder("b", &log)).await.unwrap();

        assert!(coord.expire_leader("p").await);
        assert!(!a.is_leader());
        assert!(b.is_leader());

        // Resigning an expired candidacy changes nothing.
        a.resign().await.unwrap();
        assert!(b.is_leader());
        assert_eq!(*log.lock(), vec!["a up", "a down", "b up"]);
    }

    #[tokio::test]
    async fn elections_on_different_paths_are_independent() {
        let coord = MemoryCoordination::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = coord.elect("p1", recorder("a", &log)).await.unwrap();
        let b = coord.elect("p2", recorder("b", &log)).await.unwrap();
        assert!(a.is_leader());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn dropping_a_candidacy_hands_leadership_over() {
        let coord = MemoryCoordination::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = coord.elect("p", recorder("a", &log)).await.unwrap();
        let b = coord.elect("p", recorder("b", &log)).await.unwrap();
        assert!(a.is_leader());

        drop(a);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !b.is_leader() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*log.lock(), vec!["a up", "a down", "b up"]);
    }
}
