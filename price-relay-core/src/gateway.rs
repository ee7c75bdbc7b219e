use crate::types::{FeedId, Observation, UnixTimestamp};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::warn;

/// Serialized price update data as returned by the price service: one opaque
/// blob per message (e.g. one VAA per feed batch). Ledger gateways decide how
/// to wrap it into a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePayload {
    pub updates: Vec<Vec<u8>>,
}

impl UpdatePayload {
    pub fn new(updates: Vec<Vec<u8>>) -> Self {
        Self { updates }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.updates.iter().map(Vec::len).sum()
    }
}

/// Identifier of a broadcast transaction, as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub tx_hash: String,
}

/// Trait representing the upstream price service.
#[async_trait]
pub trait PriceSource: Send + Sync + Debug {
    /// One-shot query of the latest observation of each feed. Feeds the
    /// service does not know are omitted.
    async fn fetch_latest(&self, feed_ids: &[FeedId]) -> Result<Vec<(FeedId, Observation)>>;

    /// Fetches the signed update data that lets a ledger verify and store the
    /// latest prices of `feed_ids`.
    async fn fetch_update_payload(&self, feed_ids: &[FeedId]) -> Result<UpdatePayload>;
}

/// Trait representing the target ledger interaction layer.
///
/// Implementors provide the chain-specific logic for reading the stored
/// price of a feed and submitting update transactions.
#[async_trait]
pub trait LedgerGateway: Send + Sync + Debug {
    /// Reads the price currently stored on-chain for `feed_id`, `None` if the
    /// feed has never been pushed.
    async fn query_on_chain(&self, feed_id: &FeedId) -> Result<Option<Observation>>;

    /// Fee (in the ledger's smallest native unit) required to apply `payload`.
    async fn estimate_fee(&self, payload: &UpdatePayload) -> Result<u128>;

    /// Submits an update transaction for `feed_ids`.
    ///
    /// `target_publish_times[i]` is the on-chain publish time of `feed_ids[i]`
    /// that was observed when the push was decided (`None` when nothing was
    /// stored yet), so gateways supporting conditional updates can skip feeds
    /// that another pusher already refreshed.
    ///
    /// Success only means the transaction was broadcast, not confirmed.
    async fn submit(
        &self,
        payload: &UpdatePayload,
        feed_ids: &[FeedId],
        target_publish_times: &[Option<UnixTimestamp>],
        fee: u128,
    ) -> Result<SubmissionReceipt>;

    /// Reads several feeds. Feeds whose query fails are logged and left out.
    async fn query_on_chain_many(&self, feed_ids: &[FeedId]) -> HashMap<FeedId, Observation> {
        let mut results = HashMap::new();
        for feed_id in feed_ids {
            match self.query_on_chain(feed_id).await {
                Ok(Some(observation)) => {
                    results.insert(*feed_id, observation);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%feed_id, error = %e, "Getting on-chain price failed.");
                }
            }
        }
        results
    }
}
