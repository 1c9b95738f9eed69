//! Marketplace domain records exchanged over the mesh

use crate::error::MarketplaceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Common view of a stored record
pub trait Record: Clone + PartialEq + Send + Sync + 'static {
    /// Primary key inside its map
    fn key(&self) -> &str;

    /// Epoch milliseconds used for freshness and upsert ordering
    fn timestamp(&self) -> i64;
}

/// Where a price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    #[default]
    User,
    Verified,
    MarketData,
}

/// A commodity price observed at a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplacePrice {
    pub id: String,
    pub commodity: String,
    pub price: f64,
    pub unit: String,
    pub location: String,
    #[serde(default)]
    pub county: String,
    #[serde(default)]
    pub market: String,
    pub timestamp: i64,
    #[serde(default)]
    pub source: PriceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_contact: Option<String>,
}

impl MarketplacePrice {
    /// Draft price; id and timestamp are assigned when it is broadcast
    pub fn new(
        commodity: impl Into<String>,
        price: f64,
        unit: impl Into<String>,
        location: impl Into<String>,
        county: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            commodity: commodity.into(),
            price,
            unit: unit.into(),
            location: location.into(),
            county: county.into(),
            market: String::new(),
            timestamp: 0,
            source: PriceSource::User,
            quality: None,
            seller_id: None,
            seller_contact: None,
        }
    }

    pub fn with_market(mut self, market: impl Into<String>) -> Self {
        self.market = market.into();
        self
    }

    pub fn with_source(mut self, source: PriceSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    pub fn with_seller(mut self, seller_id: impl Into<String>, contact: Option<String>) -> Self {
        self.seller_id = Some(seller_id.into());
        self.seller_contact = contact;
        self
    }
}

impl Record for MarketplacePrice {
    fn key(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PriceDrop,
    PriceRise,
    HighDemand,
    LowSupply,
    BuyerRequest,
    SellerOffer,
}

/// A market condition or trade request broadcast to nearby traders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceAlert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub commodity: String,
    pub location: String,
    #[serde(default)]
    pub county: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub timestamp: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

impl MarketplaceAlert {
    pub fn new(
        alert_type: AlertType,
        commodity: impl Into<String>,
        location: impl Into<String>,
        county: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            alert_type,
            commodity: commodity.into(),
            location: location.into(),
            county: county.into(),
            message: message.into(),
            threshold: None,
            timestamp: 0,
            user_id: String::new(),
            contact: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }
}

impl Record for MarketplaceAlert {
    fn key(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderRole {
    Buyer,
    Seller,
    Transporter,
    ServiceProvider,
}

impl TraderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraderRole::Buyer => "buyer",
            TraderRole::Seller => "seller",
            TraderRole::Transporter => "transporter",
            TraderRole::ServiceProvider => "service_provider",
        }
    }
}

impl fmt::Display for TraderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraderRole {
    type Err = MarketplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buyer" => Ok(TraderRole::Buyer),
            "seller" => Ok(TraderRole::Seller),
            "transporter" => Ok(TraderRole::Transporter),
            "service_provider" | "service-provider" => Ok(TraderRole::ServiceProvider),
            other => Err(MarketplaceError::ValidationFailed(format!(
                "unknown trader role: {}",
                other
            ))),
        }
    }
}

/// Presence record for a trader reachable over the mesh; one per device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothTrader {
    pub name: String,
    #[serde(rename = "type")]
    pub role: TraderRole,
    pub location: String,
    #[serde(default)]
    pub county: String,
    pub commodities: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub last_seen: i64,
    pub device_id: String,
}

impl BluetoothTrader {
    pub fn new(
        name: impl Into<String>,
        role: TraderRole,
        location: impl Into<String>,
        county: impl Into<String>,
        commodities: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            location: location.into(),
            county: county.into(),
            commodities,
            services: Vec::new(),
            contact: String::new(),
            rating: None,
            last_seen: 0,
            device_id: String::new(),
        }
    }

    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = contact.into();
        self
    }
}

impl Record for BluetoothTrader {
    fn key(&self) -> &str {
        &self.device_id
    }

    fn timestamp(&self) -> i64 {
        self.last_seen
    }
}

/// Ask nearby peers for prices of a commodity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRequest {
    pub commodity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}
