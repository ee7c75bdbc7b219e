//! Price service WebSocket message types.

use crate::error::DecodeError;
use crate::types::{FeedId, Observation, UnixTimestamp};
use serde::{Deserialize, Serialize};

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { ids: Vec<String> },
    Unsubscribe { ids: Vec<String> },
}

impl ClientMessage {
    pub fn subscribe(feed_ids: &[FeedId]) -> Self {
        Self::Subscribe {
            ids: feed_ids.iter().map(FeedId::to_hex).collect(),
        }
    }

    pub fn unsubscribe(feed_ids: &[FeedId]) -> Self {
        Self::Unsubscribe {
            ids: feed_ids.iter().map(FeedId::to_hex).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        status: ResponseStatus,
        #[serde(default)]
        error: Option<String>,
    },
    PriceUpdate {
        price_feed: PriceFeedPayload,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Price feed as served by the price service, both over the WebSocket and
/// from the REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedPayload {
    pub id: String,
    pub price: PricePayload,
    #[serde(default)]
    pub ema_price: Option<PricePayload>,
}

/// `price` and `conf` arrive as decimal strings to preserve precision.
#[derive(Debug, Clone, Deserialize)]
pub struct PricePayload {
    pub price: String,
    pub conf: String,
    pub expo: i32,
    pub publish_time: UnixTimestamp,
}

impl PricePayload {
    pub fn to_observation(&self) -> Result<Observation, DecodeError> {
        let price = self
            .price
            .trim()
            .parse::<i64>()
            .map_err(|_| DecodeError::Number {
                field: "price",
                value: self.price.clone(),
            })?;
        let conf = self
            .conf
            .trim()
            .parse::<u64>()
            .map_err(|_| DecodeError::Number {
                field: "conf",
                value: self.conf.clone(),
            })?;
        Ok(Observation::new(price, conf, self.expo, self.publish_time))
    }
}

impl PriceFeedPayload {
    pub fn into_observation(self) -> Result<(FeedId, Observation), DecodeError> {
        let feed_id: FeedId = self.id.parse()?;
        Ok((feed_id, self.price.to_observation()?))
    }
}
