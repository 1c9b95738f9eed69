//! Error types for the secure channel

use ble_mesh::MeshError;
use thiserror::Error;

pub type SecureChannelResult<T> = Result<T, SecureChannelError>;

#[derive(Error, Debug)]
pub enum SecureChannelError {
    #[error("Replay rejected: {0}")]
    ReplayRejected(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Malformed secure message: {0}")]
    MalformedMessage(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Transport error: {0}")]
    Transport(#[from] MeshError),
}

impl From<serde_json::Error> for SecureChannelError {
    fn from(err: serde_json::Error) -> Self {
        SecureChannelError::MalformedMessage(err.to_string())
    }
}

impl From<base64::DecodeError> for SecureChannelError {
    fn from(err: base64::DecodeError) -> Self {
        SecureChannelError::MalformedMessage(format!("invalid base64: {}", err))
    }
}
