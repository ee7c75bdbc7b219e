//! In-memory ledger for running the relayer without a chain.

use crate::cache::ObservationCache;
use crate::gateway::{LedgerGateway, SubmissionReceipt, UpdatePayload};
use crate::types::{FeedId, Observation, UnixTimestamp};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A submission recorded by [`DryRunLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub feed_ids: Vec<FeedId>,
    pub target_publish_times: Vec<Option<UnixTimestamp>>,
    pub fee: u128,
}

/// Applies submitted updates instantly by copying the latest source
/// observation of each feed. The fee is one unit per update blob.
#[derive(Debug)]
pub struct DryRunLedger {
    source: Arc<ObservationCache>,
    on_chain: Mutex<HashMap<FeedId, Observation>>,
    submissions: Mutex<Vec<RecordedSubmission>>,
}

impl DryRunLedger {
    pub fn new(source: Arc<ObservationCache>) -> Self {
        Self {
            source,
            on_chain: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Seeds the stored value of a feed.
    pub fn set_on_chain(&self, feed_id: FeedId, observation: Observation) {
        self.on_chain.lock().insert(feed_id, observation);
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl LedgerGateway for DryRunLedger {
    async fn query_on_chain(&self, feed_id: &FeedId) -> Result<Option<Observation>> {
        Ok(self.on_chain.lock().get(feed_id).copied())
    }

    async fn estimate_fee(&self, payload: &UpdatePayload) -> Result<u128> {
        Ok(payload.updates.len() as u128)
    }

    async fn submit(
        &self,
        payload: &UpdatePayload,
        feed_ids: &[FeedId],
        target_publish_times: &[Option<UnixTimestamp>],
        fee: u128,
    ) -> Result<SubmissionReceipt> {
        let mut applied = 0usize;
        {
            let mut on_chain = self.on_chain.lock();
            for feed_id in feed_ids {
                let Some(latest) = self.source.latest(feed_id) else {
                    continue;
                };
                let newer = on_chain
                    .get(feed_id)
                    .map_or(true, |current| latest.publish_time > current.publish_time);
                if newer {
                    on_chain.insert(*feed_id, latest);
                    applied += 1;
                }
            }
        }

        let mut submissions = self.submissions.lock();
        submissions.push(RecordedSubmission {
            feed_ids: feed_ids.to_vec(),
            target_publish_times: target_publish_times.to_vec(),
            fee,
        });
        let tx_hash = format!("dry-run-{}", submissions.len());

        info!(
            %tx_hash,
            feeds = feed_ids.len(),
            applied,
            payload_bytes = payload.byte_len(),
            "Dry-run submission applied"
        );
        Ok(SubmissionReceipt { tx_hash })
    }
}
