//! HTTP client for the price service REST API.
//!
//! Used for one-shot queries: the latest price of a set of feeds and the
//! signed update data a ledger needs to store them. Both endpoints take the
//! feed ids as repeated `id` query parameters, hex encoded without `0x`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use price_relay_core::message::PriceFeedPayload;
use price_relay_core::{FeedId, Observation, PriceSource, UpdatePayload};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Returns a JSON array of price feeds.
pub const LATEST_PRICE_FEED_PATH: &str = "/latest_price_feed";
/// Returns a JSON array of base64 encoded signed update messages.
pub const LATEST_VAA_BYTES_PATH: &str = "/latest_vaa_bytes";
const ID_PARAM: &str = "id";

#[derive(Debug, Clone)]
pub struct HermesConfig {
    /// Base URL of the REST API, e.g. `https://xc-mainnet.pyth.network`.
    pub endpoint: String,
    /// Timeout of each request.
    pub timeout: Duration,
    /// Retries after a network error, a 5xx or a 429. Other client errors
    /// (such as unknown feed ids) fail immediately.
    pub retries: u32,
    /// Retry `n` waits `retry_base_delay * 2^n`.
    pub retry_base_delay: Duration,
}

impl HermesConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HermesClient {
    http: reqwest::Client,
    endpoint: String,
    retries: u32,
    retry_base_delay: Duration,
}

impl HermesClient {
    pub fn new(config: HermesConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!(
                "Invalid price service endpoint `{}`: expected an http:// or https:// URL",
                config.endpoint
            );
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint,
            retries: config.retries,
            retry_base_delay: config.retry_base_delay,
        })
    }

    /// Latest price feeds for `feed_ids`. Fails if the service rejects any id.
    pub async fn get_latest_price_feeds(&self, feed_ids: &[FeedId]) -> Result<Vec<PriceFeedPayload>> {
        if feed_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_with_ids(LATEST_PRICE_FEED_PATH, feed_ids).await
    }

    /// Base64 encoded signed update messages covering `feed_ids`.
    pub async fn get_latest_vaas(&self, feed_ids: &[FeedId]) -> Result<Vec<String>> {
        if feed_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_with_ids(LATEST_VAA_BYTES_PATH, feed_ids).await
    }

    async fn get_with_ids<T: DeserializeOwned>(&self, path: &str, feed_ids: &[FeedId]) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let query: Vec<(&str, String)> = feed_ids.iter().map(|id| (ID_PARAM, id.to_hex())).collect();

        let mut attempt = 0u32;
        loop {
            let error = match self.http.get(&url).query(&query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("Failed to decode response from {}", path));
                    }
                    let body = response.text().await.unwrap_or_default();
                    let error = anyhow!("{} returned {}: {}", path, status, body);
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    error
                }
                Err(e) => anyhow::Error::new(e).context(format!("Request to {} failed", path)),
            };

            if attempt >= self.retries {
                return Err(error.context(format!("Giving up after {} attempts", attempt + 1)));
            }
            let delay = self
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(attempt));
            warn!(
                path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Price service request failed. Retrying."
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl PriceSource for HermesClient {
    async fn fetch_latest(&self, feed_ids: &[FeedId]) -> Result<Vec<(FeedId, Observation)>> {
        let feeds = self.get_latest_price_feeds(feed_ids).await?;
        let mut observations = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let id = feed.id.clone();
            match feed.into_observation() {
                Ok(observation) => observations.push(observation),
                Err(e) => warn!(id = %id, error = %e, "Skipping malformed price feed"),
            }
        }
        debug!(count = observations.len(), "Fetched latest prices from price service");
        Ok(observations)
    }

    async fn fetch_update_payload(&self, feed_ids: &[FeedId]) -> Result<UpdatePayload> {
        let vaas = self.get_latest_vaas(feed_ids).await?;
        let updates = vaas
            .iter()
            .map(|vaa| STANDARD.decode(vaa).context("Price service returned invalid base64 update data"))
            .collect::<Result<Vec<_>>>()?;
        Ok(UpdatePayload::new(updates))
    }
}
