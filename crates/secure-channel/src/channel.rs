//! Point-to-point encrypted exchange over the radio transport

use crate::error::{SecureChannelError, SecureChannelResult};
use crate::message::{open, seal, SecureMessage, SessionKey};
use ble_mesh::{DeviceId, DiscoveredPeer, RadioTransport, SERVICE_UUID};
use lru::LruCache;
use shared::clock::Clock;
use shared::config::SecureChannelConfig;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Characteristic carrying sealed messages, separate from the relay's
/// plaintext message characteristic
pub const SECURE_MESSAGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Encrypted channel between two peers sharing a [`SessionKey`]
pub struct SecureChannel {
    transport: Arc<dyn RadioTransport>,
    config: SecureChannelConfig,
    clock: Arc<dyn Clock>,
    /// Nonces of accepted messages, with their timestamps
    accepted: Mutex<LruCache<String, i64>>,
}

impl SecureChannel {
    pub fn new(
        transport: Arc<dyn RadioTransport>,
        config: SecureChannelConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.nonce_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            transport,
            config,
            clock,
            accepted: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Coarse admission filter: the peer must advertise the marketplace service
    pub fn validate_device(&self, peer: &DiscoveredPeer) -> bool {
        let valid = peer.advertises(&SERVICE_UUID);
        if !valid {
            debug!(peer = %peer.id, "Peer does not advertise the marketplace service");
        }
        valid
    }

    /// Seal `message` and write it to `peer`
    pub async fn send_secure_message(
        &self,
        peer: &DeviceId,
        message: impl AsRef<[u8]>,
        key: &SessionKey,
    ) -> SecureChannelResult<SecureMessage> {
        let sealed = seal(message.as_ref(), key, self.clock.now_millis())?;

        self.transport
            .write(
                peer,
                SERVICE_UUID,
                SECURE_MESSAGE_CHARACTERISTIC_UUID,
                &sealed.to_bytes()?,
            )
            .await?;

        debug!(peer = %peer, timestamp = sealed.timestamp, "Sent secure message");
        Ok(sealed)
    }

    /// Read the latest sealed message from `peer` and open it
    pub async fn receive_secure_message(
        &self,
        peer: &DeviceId,
        key: &SessionKey,
    ) -> SecureChannelResult<Vec<u8>> {
        let raw = self
            .transport
            .read(peer, SERVICE_UUID, SECURE_MESSAGE_CHARACTERISTIC_UUID)
            .await?;

        if raw.is_empty() {
            return Err(SecureChannelError::MalformedMessage(format!(
                "no secure message from {}",
                peer
            )));
        }

        let message = SecureMessage::from_bytes(&raw)?;
        self.accept(&message, key).await.map_err(|e| {
            warn!(peer = %peer, error = %e, "Rejected secure message");
            e
        })
    }

    /// Open a message received by any path, rejecting nonces already accepted
    ///
    /// The nonce cache never evicts an entry that is still inside the replay
    /// window. Once `nonce_cache_size` messages have been accepted within one
    /// window, further messages are rejected until the oldest entry ages out.
    pub async fn accept(&self, message: &SecureMessage, key: &SessionKey) -> SecureChannelResult<Vec<u8>> {
        let now = self.clock.now_millis();
        let plaintext = open(message, key, now, self.config.replay_window)?;

        let window_ms = self.config.replay_window.as_millis() as i64;
        let mut accepted = self.accepted.lock().await;
        if let Some(seen_at) = accepted.peek(&message.nonce) {
            if now.saturating_sub(*seen_at) <= window_ms {
                return Err(SecureChannelError::ReplayRejected(
                    "nonce already accepted".to_string(),
                ));
            }
        }

        if accepted.len() == accepted.cap().get() && !accepted.contains(&message.nonce) {
            if let Some((_, oldest)) = accepted.peek_lru() {
                if now.saturating_sub(*oldest) <= window_ms {
                    warn!(capacity = accepted.cap().get(), "Nonce cache full inside the replay window");
                    return Err(SecureChannelError::ReplayRejected(
                        "nonce cache saturated".to_string(),
                    ));
                }
            }
        }
        accepted.put(message.nonce.clone(), now);

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble_mesh::MESSAGE_CHARACTERISTIC_UUID;
    use shared::clock::ManualClock;
    use std::time::Duration;

    fn channel(clock: Arc<ManualClock>) -> SecureChannel {
        let hub = ble_mesh::LoopbackHub::new();
        SecureChannel::new(
            Arc::new(hub.transport("solo")),
            SecureChannelConfig::default(),
            clock,
        )
    }

    #[test]
    fn test_validate_device() {
        let channel = channel(Arc::new(ManualClock::starting_now()));
        let mut peer = DiscoveredPeer {
            id: "p".to_string(),
            name: None,
            services: vec![SERVICE_UUID],
            rssi: Some(-60),
        };
        assert!(channel.validate_device(&peer));

        peer.services = vec![MESSAGE_CHARACTERISTIC_UUID];
        assert!(!channel.validate_device(&peer));
    }

    #[tokio::test]
    async fn test_accept_rejects_reused_nonce() {
        let clock = Arc::new(ManualClock::starting_now());
        let channel = channel(clock.clone());
        let key = SessionKey::generate();

        let sealed = seal(b"offer", &key, clock.now_millis()).unwrap();
        assert_eq!(channel.accept(&sealed, &key).await.unwrap(), b"offer");

        clock.advance(Duration::from_secs(30));
        assert!(matches!(
            channel.accept(&sealed, &key).await,
            Err(SecureChannelError::ReplayRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_full_nonce_cache_never_forgets_live_nonces() {
        let clock = Arc::new(ManualClock::starting_now());
        let hub = ble_mesh::LoopbackHub::new();
        let channel = SecureChannel::new(
            Arc::new(hub.transport("solo")),
            SecureChannelConfig {
                nonce_cache_size: 2,
                ..SecureChannelConfig::default()
            },
            clock.clone(),
        );
        let key = SessionKey::generate();

        let first = seal(b"one", &key, clock.now_millis()).unwrap();
        let second = seal(b"two", &key, clock.now_millis()).unwrap();
        let third = seal(b"three", &key, clock.now_millis()).unwrap();
        assert!(channel.accept(&first, &key).await.is_ok());
        assert!(channel.accept(&second, &key).await.is_ok());

        // Admitting a third would evict a nonce that is still replayable
        assert!(matches!(
            channel.accept(&third, &key).await,
            Err(SecureChannelError::ReplayRejected(_))
        ));
        assert!(matches!(
            channel.accept(&first, &key).await,
            Err(SecureChannelError::ReplayRejected(_))
        ));

        clock.advance(Duration::from_secs(5 * 60 + 1));
        let fresh = seal(b"four", &key, clock.now_millis()).unwrap();
        assert_eq!(channel.accept(&fresh, &key).await.unwrap(), b"four");
    }

    #[tokio::test]
    async fn test_forged_message_does_not_poison_nonce_cache() {
        let clock = Arc::new(ManualClock::starting_now());
        let channel = channel(clock.clone());
        let key = SessionKey::generate();

        let sealed = seal(b"offer", &key, clock.now_millis()).unwrap();
        assert!(matches!(
            channel.accept(&sealed, &SessionKey::generate()).await,
            Err(SecureChannelError::DecryptionFailed(_))
        ));
        assert!(channel.accept(&sealed, &key).await.is_ok());
    }
}
