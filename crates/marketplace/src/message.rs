//! Gossip message carried in an envelope's content
//!
//! Wire form:
//! `{"type":"marketplace","subtype":"price_update","data":{..},"timestamp":..,"sender":".."}`

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::types::{BluetoothTrader, MarketplaceAlert, MarketplacePrice, PriceRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of the outer `type` field
pub const MARKETPLACE_MESSAGE_TYPE: &str = "marketplace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipSubtype {
    PriceUpdate,
    PriceRequest,
    MarketplaceAlert,
    TraderAnnouncement,
}

/// Typed gossip payload
#[derive(Debug, Clone, PartialEq)]
pub enum GossipPayload {
    PriceUpdate(MarketplacePrice),
    PriceRequest(PriceRequest),
    MarketplaceAlert(MarketplaceAlert),
    TraderAnnouncement(BluetoothTrader),
}

impl GossipPayload {
    pub fn subtype(&self) -> GossipSubtype {
        match self {
            GossipPayload::PriceUpdate(_) => GossipSubtype::PriceUpdate,
            GossipPayload::PriceRequest(_) => GossipSubtype::PriceRequest,
            GossipPayload::MarketplaceAlert(_) => GossipSubtype::MarketplaceAlert,
            GossipPayload::TraderAnnouncement(_) => GossipSubtype::TraderAnnouncement,
        }
    }

    fn data(&self) -> MarketplaceResult<Value> {
        let data = match self {
            GossipPayload::PriceUpdate(price) => serde_json::to_value(price)?,
            GossipPayload::PriceRequest(request) => serde_json::to_value(request)?,
            GossipPayload::MarketplaceAlert(alert) => serde_json::to_value(alert)?,
            GossipPayload::TraderAnnouncement(trader) => serde_json::to_value(trader)?,
        };
        Ok(data)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    subtype: GossipSubtype,
    data: Value,
    timestamp: i64,
    sender: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    pub payload: GossipPayload,
    /// Send time in milliseconds since the epoch
    pub timestamp: i64,
    pub sender: String,
}

impl GossipMessage {
    pub fn new(payload: GossipPayload, sender: impl Into<String>, timestamp: i64) -> Self {
        Self {
            payload,
            timestamp,
            sender: sender.into(),
        }
    }

    pub fn encode(&self) -> MarketplaceResult<String> {
        let wire = WireMessage {
            kind: MARKETPLACE_MESSAGE_TYPE.to_string(),
            subtype: self.payload.subtype(),
            data: self.payload.data()?,
            timestamp: self.timestamp,
            sender: self.sender.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(content: &str) -> MarketplaceResult<Self> {
        let wire: WireMessage = serde_json::from_str(content)
            .map_err(|e| MarketplaceError::MalformedEnvelope(e.to_string()))?;

        if wire.kind != MARKETPLACE_MESSAGE_TYPE {
            return Err(MarketplaceError::MalformedEnvelope(format!(
                "unexpected message type: {}",
                wire.kind
            )));
        }

        let malformed = |e: serde_json::Error| {
            MarketplaceError::MalformedEnvelope(format!("{:?} payload: {}", wire.subtype, e))
        };
        let payload = match wire.subtype {
            GossipSubtype::PriceUpdate => {
                GossipPayload::PriceUpdate(serde_json::from_value(wire.data).map_err(malformed)?)
            }
            GossipSubtype::PriceRequest => {
                GossipPayload::PriceRequest(serde_json::from_value(wire.data).map_err(malformed)?)
            }
            GossipSubtype::MarketplaceAlert => GossipPayload::MarketplaceAlert(
                serde_json::from_value(wire.data).map_err(malformed)?,
            ),
            GossipSubtype::TraderAnnouncement => GossipPayload::TraderAnnouncement(
                serde_json::from_value(wire.data).map_err(malformed)?,
            ),
        };

        Ok(Self {
            payload,
            timestamp: wire.timestamp,
            sender: wire.sender,
        })
    }
}
