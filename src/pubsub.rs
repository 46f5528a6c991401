//! Synchronous fan-out of container events.
//!
//! Subscribers are called in registration order and [`PubSub::publish`] only
//! returns once every callback returned. Publishing iterates over a snapshot
//! so callbacks may subscribe, unsubscribe or publish without deadlocking.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::container::ContainerEvent;

pub type SubscriberFn = Arc<dyn Fn(&ContainerEvent) + Send + Sync>;

/// Stable handle returned by [`PubSub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
pub struct PubSub {
    next_token: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionToken, SubscriberFn)>>,
}

impl fmt::Debug for PubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl PubSub {
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&ContainerEvent) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((token, Arc::new(callback)));
        token
    }

    /// Removes a subscriber. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    pub fn publish(&self, event: &ContainerEvent) {
        let snapshot: Vec<SubscriberFn> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();

        log::trace!(
            "publishing {} event for container `{}` to {} subscribers",
            event.kind,
            event.container.id,
            snapshot.len()
        );
        for subscriber in snapshot {
            subscriber(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
