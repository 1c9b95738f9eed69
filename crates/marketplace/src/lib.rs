//! Offline marketplace gossip over the BLE mesh
//!
//! Prices, alerts and trader presence records are flooded through the mesh
//! as typed gossip messages, kept in per-type record stores and queried with
//! freshness windows of 24 hours, 6 hours and 30 minutes respectively.

pub mod error;
pub mod message;
pub mod query;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use error::{MarketplaceError, MarketplaceResult};
pub use message::{GossipMessage, GossipPayload, GossipSubtype};
pub use service::MarketplaceService;
pub use store::RecordStore;
pub use types::{
    AlertType, BluetoothTrader, MarketplaceAlert, MarketplacePrice, PriceRequest, PriceSource,
    Record, TraderRole,
};
