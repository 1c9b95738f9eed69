//! BLE mesh networking for offline peer-to-peer messaging
//!
//! This crate implements flood relay over short-range radio links with
//! seen-set deduplication, hop limits and a pending-delivery queue for
//! directed envelopes whose recipient is not connected yet.

pub mod adapter;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod loopback;
pub mod router;
pub mod store_forward;

// Re-export main types
pub use adapter::{
    BtleplugTransport, DeviceId, DeviceInfo, DiscoveredPeer, RadioTransport, TransportEvent,
    DEVICE_INFO_CHARACTERISTIC_UUID, MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID,
};
pub use dedup::SeenCache;
pub use envelope::{Envelope, EnvelopeId, DEFAULT_TTL};
pub use error::{MeshError, MeshResult};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use router::{MeshRouter, MessageHandler, PeerConnection, PeerState};
pub use store_forward::StoreForwardQueue;
