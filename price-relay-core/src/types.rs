use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length in bytes of a price feed identifier.
pub const FEED_ID_LEN: usize = 32;

pub type DurationInSeconds = u64;
pub type PctNumber = f64;
pub type UnixTimestamp = i64;

/// Identifier of a price feed.
///
/// Parsed once at the boundary from a hex string (an optional `0x`/`0X`
/// prefix is stripped, case is ignored). Downstream code only ever compares
/// the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId([u8; FEED_ID_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedIdError {
    #[error("invalid feed id length: expected {expected} hex chars, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex in feed id: {0}")]
    Hex(String),
}

impl FeedId {
    pub const fn from_bytes(bytes: [u8; FEED_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FEED_ID_LEN] {
        &self.0
    }

    /// Lowercase hex without a leading "0x", the form the price service expects.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for FeedId {
    type Err = FeedIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let stripped = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if stripped.len() != FEED_ID_LEN * 2 {
            return Err(FeedIdError::Length {
                expected: FEED_ID_LEN * 2,
                actual: stripped.len(),
            });
        }

        let mut bytes = [0u8; FEED_ID_LEN];
        hex::decode_to_slice(stripped, &mut bytes)
            .map_err(|e| FeedIdError::Hex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for FeedId {
    type Error = FeedIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeedId> for String {
    fn from(id: FeedId) -> Self {
        id.to_hex()
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({})", self.to_hex())
    }
}

/// A single price reading for a feed, from either the price service or the
/// target ledger. `price` and `conf` are fixed-point values scaled by `10^expo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub price: i64,
    pub conf: u64,
    pub expo: i32,
    pub publish_time: UnixTimestamp,
}

impl Observation {
    pub fn new(price: i64, conf: u64, expo: i32, publish_time: UnixTimestamp) -> Self {
        Self {
            price,
            conf,
            expo,
            publish_time,
        }
    }
}

/// The three staleness thresholds evaluated for a feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateThresholds {
    /// Publish time gap (seconds) between source and target.
    pub time_difference: DurationInSeconds,
    /// Relative price deviation of source vs target, in percent.
    pub price_deviation_pct: PctNumber,
    /// Source confidence interval relative to source price, in percent.
    pub confidence_ratio_pct: PctNumber,
}

/// Represents the configuration for a single price feed from the YAML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PriceConfig {
    /// User-defined alias for the price feed (e.g., "BTC/USD"). Used for logging.
    pub alias: String,
    /// The price feed identifier. Accepts hex with or without "0x".
    pub id: FeedId,

    // --- Main Update Triggers ---
    /// Time difference threshold (in seconds) to trigger an update.
    #[serde(rename = "time_difference")]
    pub time_difference_threshold: DurationInSeconds,
    /// Price deviation threshold (as a percentage) to trigger an update.
    #[serde(rename = "price_deviation")]
    pub price_deviation_threshold_pct: PctNumber,
    /// Confidence/price ratio threshold (as a percentage) to trigger an update.
    #[serde(rename = "confidence_ratio")]
    pub confidence_ratio_threshold_pct: PctNumber,

    // --- Early Update Triggers ---
    /// Optional configuration for early updates.
    #[serde(default)]
    pub early_update: Option<EarlyUpdateConfig>,
}

impl PriceConfig {
    pub fn thresholds(&self) -> UpdateThresholds {
        UpdateThresholds {
            time_difference: self.time_difference_threshold,
            price_deviation_pct: self.price_deviation_threshold_pct,
            confidence_ratio_pct: self.confidence_ratio_threshold_pct,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: UpdateThresholds) {
        self.time_difference_threshold = thresholds.time_difference;
        self.price_deviation_threshold_pct = thresholds.price_deviation_pct;
        self.confidence_ratio_threshold_pct = thresholds.confidence_ratio_pct;
    }
}

/// Optional configuration specific to early updates.
///
/// A feed that only meets its early thresholds is pushed together with a
/// batch that some other feed triggered, never on its own.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EarlyUpdateConfig {
    #[serde(rename = "time_difference")]
    pub time_difference_threshold: Option<DurationInSeconds>,
    #[serde(rename = "price_deviation")]
    pub price_deviation_threshold_pct: Option<PctNumber>,
    #[serde(rename = "confidence_ratio")]
    pub confidence_ratio_threshold_pct: Option<PctNumber>,
}

/// Enum indicating whether a price feed should be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCondition {
    /// This price feed *must* be updated (main thresholds met).
    Yes,
    /// This price feed *may* be updated as part of a larger batch (early update conditions met).
    Early,
    /// This price feed *should not* be updated (no conditions met).
    No,
}
