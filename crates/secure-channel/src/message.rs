//! Sealed message wire form and the AES-256-GCM seal/open primitives

use crate::error::{SecureChannelError, SecureChannelResult};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroize;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM initialization vector length in bytes
pub const IV_LEN: usize = 12;

/// Length of the per-message anti-replay nonce in bytes
pub const NONCE_LEN: usize = 16;

/// Wire form of a sealed message
///
/// `signature` carries the AES-GCM IV; `nonce` is a separate random value
/// used for replay detection. Binary fields are base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMessage {
    pub data: String,
    /// Sealing time in milliseconds since the epoch
    pub timestamp: i64,
    pub signature: String,
    pub nonce: String,
}

impl SecureMessage {
    pub fn to_bytes(&self) -> SecureChannelResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SecureChannelResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Symmetric AES-256 key shared by two peers; wiped from memory on drop
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> SecureChannelResult<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            SecureChannelError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> SecureChannelResult<Self> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SecureChannelError::InvalidKey(e.to_string()))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> SecureChannelResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| SecureChannelError::InvalidKey(format!("Failed to create cipher: {}", e)))
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Timestamp and nonce are authenticated alongside the ciphertext
fn associated_data(timestamp: i64, nonce: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + nonce.len());
    aad.extend_from_slice(&timestamp.to_be_bytes());
    aad.extend_from_slice(nonce);
    aad
}

/// Encrypt `plaintext` under `key`, stamped with `now_millis`
pub fn seal(plaintext: &[u8], key: &SessionKey, now_millis: i64) -> SecureChannelResult<SecureMessage> {
    let cipher = key.cipher()?;

    let mut iv = [0u8; IV_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut iv);
    rng.fill_bytes(&mut nonce);

    let aad = associated_data(now_millis, &nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| SecureChannelError::EncryptionFailed(e.to_string()))?;

    Ok(SecureMessage {
        data: STANDARD.encode(ciphertext),
        timestamp: now_millis,
        signature: STANDARD.encode(iv),
        nonce: STANDARD.encode(nonce),
    })
}

/// Reject messages further than `window` from `now_millis` in either direction
pub fn check_freshness(timestamp: i64, now_millis: i64, window: Duration) -> SecureChannelResult<()> {
    let window_ms = window.as_millis() as i64;
    let age_ms = now_millis.saturating_sub(timestamp);

    if age_ms > window_ms {
        return Err(SecureChannelError::ReplayRejected(format!(
            "message is {} ms old, window is {} ms",
            age_ms, window_ms
        )));
    }
    if -age_ms > window_ms {
        return Err(SecureChannelError::ReplayRejected(format!(
            "message is {} ms in the future",
            -age_ms
        )));
    }
    Ok(())
}

/// Verify freshness, then authenticate and decrypt
pub fn open(
    message: &SecureMessage,
    key: &SessionKey,
    now_millis: i64,
    window: Duration,
) -> SecureChannelResult<Vec<u8>> {
    check_freshness(message.timestamp, now_millis, window)?;

    let ciphertext = STANDARD.decode(&message.data)?;
    let iv = STANDARD.decode(&message.signature)?;
    let nonce = STANDARD.decode(&message.nonce)?;

    if iv.len() != IV_LEN {
        return Err(SecureChannelError::MalformedMessage(format!(
            "IV must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }

    let aad = associated_data(message.timestamp, &nonce);
    key.cipher()?
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| SecureChannelError::DecryptionFailed("authentication tag mismatch".to_string()))
}
