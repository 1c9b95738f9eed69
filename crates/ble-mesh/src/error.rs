//! Error types for BLE mesh operations

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during BLE mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Radio transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("BLE connection failed: {0}")]
    ConnectionFailed(String),

    #[error("BLE adapter error: {0}")]
    AdapterError(String),

    #[error("Write failed: {0}")]
    TransmissionFailed(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Pending delivery queue full for {0}")]
    QueueFull(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError(err.to_string())
    }
}

impl From<btleplug::Error> for MeshError {
    fn from(err: btleplug::Error) -> Self {
        MeshError::AdapterError(err.to_string())
    }
}
