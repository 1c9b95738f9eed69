//! Envelope: the unit exchanged between directly connected peers

use crate::adapter::DeviceId;
use crate::error::{MeshError, MeshResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique envelope identifier
pub type EnvelopeId = Uuid;

/// Hop limit assumed for envelopes that arrive without one
pub const DEFAULT_TTL: u8 = 7;

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

/// A mesh envelope
///
/// Immutable once created; relays only ever lower `ttl` on the copy they
/// forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub content: String,
    /// Creation time in milliseconds since the epoch
    pub timestamp: i64,
    /// Originating device
    pub sender: DeviceId,
    /// `None` broadcasts to every connected peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<DeviceId>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
}

impl Envelope {
    /// Create a new envelope stamped with a fresh id and the current time
    pub fn new(
        sender: DeviceId,
        recipient: Option<DeviceId>,
        content: impl Into<String>,
        ttl: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            sender,
            recipient,
            encrypted: false,
            ttl,
        }
    }

    /// Whether this device should hand the envelope to its handlers
    pub fn is_addressed_to(&self, device: &str) -> bool {
        match &self.recipient {
            None => true,
            Some(recipient) => recipient == device,
        }
    }

    /// Copy for the next hop, or `None` once the hop limit is spent
    pub fn next_hop(&self) -> Option<Envelope> {
        if self.ttl == 0 {
            return None;
        }

        let mut forwarded = self.clone();
        forwarded.ttl -= 1;
        Some(forwarded)
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))
    }
}
