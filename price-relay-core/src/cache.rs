//! Latest-value cache with monotonic publish-time acceptance.
//!
//! The cache is fed concurrently by the push stream and by periodic polls,
//! so an observation is only stored when it is strictly newer than the one
//! already held for the same feed.

use crate::types::{FeedId, Observation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
pub struct ObservationCache {
    latest: DashMap<FeedId, Observation>,
}

impl ObservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `observation` if its publish time is strictly newer than the
    /// cached one. Returns whether it was accepted.
    pub fn record(&self, feed_id: FeedId, observation: Observation) -> bool {
        match self.latest.entry(feed_id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().publish_time;
                if observation.publish_time > current {
                    entry.insert(observation);
                    true
                } else {
                    trace!(
                        %feed_id,
                        current,
                        incoming = observation.publish_time,
                        "Discarding observation that is not newer than cached value"
                    );
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(observation);
                true
            }
        }
    }

    pub fn latest(&self, feed_id: &FeedId) -> Option<Observation> {
        self.latest.get(feed_id).map(|entry| *entry.value())
    }

    pub fn snapshot(&self) -> HashMap<FeedId, Observation> {
        self.latest
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
