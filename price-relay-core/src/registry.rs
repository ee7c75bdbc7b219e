//! Subscription registry: which feeds have interested consumers, and which
//! callbacks to invoke when an observation for a feed arrives.
//!
//! The set of feeds with at least one callback is exactly what gets replayed
//! to the server after a reconnect.

use crate::types::{FeedId, Observation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Consumer callback invoked for every accepted observation of a feed.
pub type PriceCallback = Arc<dyn Fn(&FeedId, &Observation) + Send + Sync>;

/// Identifies one registered callback, for precise removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct SubscriptionRegistry {
    callbacks: DashMap<FeedId, Vec<(CallbackId, PriceCallback)>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_callback_id(&self) -> CallbackId {
        CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a callback for `feed_id`. Returns `true` when the feed had no
    /// callbacks before, i.e. the server must be told about it.
    pub fn subscribe(&self, feed_id: FeedId, id: CallbackId, callback: PriceCallback) -> bool {
        match self.callbacks.entry(feed_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push((id, callback));
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![(id, callback)]);
                true
            }
        }
    }

    /// Removes one callback (`Some`) or all callbacks (`None`) of `feed_id`.
    /// Returns `true` when the feed became inactive as a result.
    pub fn unsubscribe(&self, feed_id: &FeedId, id: Option<CallbackId>) -> bool {
        let entry = match self.callbacks.entry(*feed_id) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => return false,
        };

        match id {
            None => {
                entry.remove();
                true
            }
            Some(id) => {
                let mut entry = entry;
                entry.get_mut().retain(|(existing, _)| *existing != id);
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Invokes every callback registered for `feed_id`. Returns how many were called.
    pub fn dispatch(&self, feed_id: &FeedId, observation: &Observation) -> usize {
        // Clone the handles so callbacks run without holding the shard lock.
        let callbacks: Vec<PriceCallback> = match self.callbacks.get(feed_id) {
            Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => {
                debug!(%feed_id, "Received update for feed without subscribers");
                return 0;
            }
        };

        for callback in &callbacks {
            callback(feed_id, observation);
        }
        callbacks.len()
    }

    pub fn is_active(&self, feed_id: &FeedId) -> bool {
        self.callbacks.contains_key(feed_id)
    }

    /// Feeds with at least one callback, sorted.
    pub fn active_feeds(&self) -> Vec<FeedId> {
        let mut feeds: Vec<FeedId> = self.callbacks.iter().map(|entry| *entry.key()).collect();
        feeds.sort();
        feeds
    }
}
