//! Error types for the marketplace gossip layer

use thiserror::Error;

pub type MarketplaceResult<T> = Result<T, MarketplaceError>;

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MarketplaceError {
    fn from(err: serde_json::Error) -> Self {
        MarketplaceError::Serialization(err.to_string())
    }
}
