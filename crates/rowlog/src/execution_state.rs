//! Per-message delivery progress.
//!
//! An [`ExecutionState`] is written together with its message and afterwards only changed
//! through compare-and-set on its `revision`, so concurrent re-deliveries (or two leadership
//! terms overlapping briefly) never double-count an attempt or lose a done flag.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::subscription::Subscription;
use crate::types::SubscriptionId;

/// Progress of one subscription for one message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionProgress {
    pub order_index: i32,
    pub done: bool,
    /// Failed delivery attempts. Persisted, so it survives a leadership handover.
    pub attempts: u32,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Bumped by the store on every successful compare-and-set.
    pub revision: u64,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionProgress>,
}

impl ExecutionState {
    /// Initial state: every given subscription pending with no attempts.
    pub fn new(subscriptions: &[Subscription]) -> Self {
        Self {
            revision: 0,
            subscriptions: subscriptions
                .iter()
                .map(|s| {
                    (
                        s.id.clone(),
                        SubscriptionProgress {
                            order_index: s.order_index,
                            done: false,
                            attempts: 0,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn progress(&self, subscription: &SubscriptionId) -> Option<&SubscriptionProgress> {
        self.subscriptions.get(subscription)
    }

    pub fn subscription_ids(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.subscriptions.keys()
    }

    /// Done for `subscription`. Subscriptions not recorded in the state count as done:
    /// the message was put before they existed and is never delivered to them.
    pub fn is_done(&self, subscription: &SubscriptionId) -> bool {
        self.subscriptions
            .get(subscription)
            .map(|p| p.done)
            .unwrap_or(true)
    }

    pub fn attempts(&self, subscription: &SubscriptionId) -> u32 {
        self.subscriptions
            .get(subscription)
            .map(|p| p.attempts)
            .unwrap_or(0)
    }

    /// Set the done flag. Returns `false` if it was already set or the subscription is unknown.
    pub fn mark_done(&mut self, subscription: &SubscriptionId) -> bool {
        match self.subscriptions.get_mut(subscription) {
            Some(p) if !p.done => {
                p.done = true;
                true
            }
            _ => false,
        }
    }

    /// Count a failed attempt and return the new total. Done subscriptions are left alone.
    pub fn record_failure(&mut self, subscription: &SubscriptionId) -> Option<u32> {
        let p = self.subscriptions.get_mut(subscription)?;
        if p.done {
            return None;
        }
        p.attempts = p.attempts.saturating_add(1);
        Some(p.attempts)
    }

    pub fn reset_attempts(&mut self, subscription: &SubscriptionId) -> bool {
        match self.subscriptions.get_mut(subscription) {
            Some(p) if !p.done && p.attempts != 0 => {
                p.attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// Whether a subscription with a lower order index, still in `registered`, has not
    /// finished this message yet.
    pub fn waits_on_earlier(
        &self,
        subscription: &SubscriptionId,
        registered: &HashSet<SubscriptionId>,
    ) -> bool {
        let Some(own) = self.subscriptions.get(subscription) else {
            return false;
        };
        self.subscriptions.iter().any(|(id, p)| {
            id != subscription
                && p.order_index < own.order_index
                && !p.done
                && registered.contains(id)
        })
    }

    /// Whether every subscription in `registered` that this message was put for is done.
    pub fn all_done(&self, registered: &HashSet<SubscriptionId>) -> bool {
        self.subscriptions
            .iter()
            .filter(|(id, _)| registered.contains(*id))
            .all(|(_, p)| p.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs() -> Vec<Subscription> {
        vec![
            Subscription::local("index", 1, 3),
            Subscription::local("blobs", 2, 3),
        ]
    }

    fn registered(ids: &[&str]) -> HashSet<SubscriptionId> {
        ids.iter().map(|s| SubscriptionId::new(*s)).collect()
    }

    #[test]
    fn done_flag_is_monotonic() {
        let mut state = ExecutionState::new(&subs());
        let index = SubscriptionId::new("index");
        assert!(!state.is_done(&index));
        assert!(state.mark_done(&index));
        assert!(!state.mark_done(&index));
        assert!(state.is_done(&index));
        assert_eq!(state.record_failure(&index), None);
        assert!(!state.reset_attempts(&index));
        assert!(state.is_done(&index));
    }

    #[test]
    fn failures_accumulate_per_subscription() {
        let mut state = ExecutionState::new(&subs());
        let index = SubscriptionId::new("index");
        let blobs = SubscriptionId::new("blobs");
        assert_eq!(state.record_failure(&index), Some(1));
        assert_eq!(state.record_failure(&index), Some(2));
        assert_eq!(state.attempts(&blobs), 0);
        assert!(state.reset_attempts(&index));
        assert_eq!(state.attempts(&index), 0);
    }

    #[test]
    fn unknown_subscription_counts_as_done() {
        let state = ExecutionState::new(&subs());
        assert!(state.is_done(&SubscriptionId::new("late")));
    }

    #[test]
    fn later_subscription_waits_on_registered_earlier_ones() {
        let mut state = ExecutionState::new(&subs());
        let index = SubscriptionId::new("index");
        let blobs = SubscriptionId::new("blobs");
        let both = registered(&["index", "blobs"]);

        assert!(state.waits_on_earlier(&blobs, &both));
        assert!(!state.waits_on_earlier(&index, &both));
        // Unregistering the earlier subscription releases the later one.
        assert!(!state.waits_on_earlier(&blobs, &registered(&["blobs"])));

        state.mark_done(&index);
        assert!(!state.waits_on_earlier(&blobs, &both));
    }

    #[test]
    fn all_done_only_considers_registered_subscriptions() {
        let mut state = ExecutionState::new(&subs());
        state.mark_done(&SubscriptionId::new("index"));
        assert!(!state.all_done(&registered(&["index", "blobs"])));
        assert!(state.all_done(&registered(&["index"])));
    }
}
