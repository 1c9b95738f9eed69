//! Validation for marketplace records
//!
//! Local drafts are checked for required fields before they are stored or
//! broadcast. Records received from peers additionally must not be dated
//! beyond the allowed clock skew.

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::types::{BluetoothTrader, MarketplaceAlert, MarketplacePrice, Record};
use std::time::Duration;

fn require(field: &str, value: &str) -> MarketplaceResult<()> {
    if value.trim().is_empty() {
        return Err(MarketplaceError::ValidationFailed(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn require_finite(field: &str, value: f64) -> MarketplaceResult<()> {
    if !value.is_finite() {
        return Err(MarketplaceError::ValidationFailed(format!(
            "{} must be a finite number (got: {})",
            field, value
        )));
    }
    Ok(())
}

pub fn validate_price(price: &MarketplacePrice) -> MarketplaceResult<()> {
    require("commodity", &price.commodity)?;
    require("unit", &price.unit)?;
    require("location", &price.location)?;
    require_finite("price", price.price)?;

    if price.price <= 0.0 {
        return Err(MarketplaceError::ValidationFailed(format!(
            "price must be positive (got: {})",
            price.price
        )));
    }
    Ok(())
}

pub fn validate_alert(alert: &MarketplaceAlert) -> MarketplaceResult<()> {
    require("commodity", &alert.commodity)?;
    require("message", &alert.message)?;
    require("location", &alert.location)?;

    if let Some(threshold) = alert.threshold {
        require_finite("threshold", threshold)?;
    }
    Ok(())
}

pub fn validate_trader(trader: &BluetoothTrader) -> MarketplaceResult<()> {
    require("name", &trader.name)?;
    require("deviceId", &trader.device_id)?;

    if trader.commodities.iter().all(|c| c.trim().is_empty()) {
        return Err(MarketplaceError::ValidationFailed(
            "commodities must not be empty".to_string(),
        ));
    }

    if let Some(rating) = trader.rating {
        require_finite("rating", rating)?;
    }
    Ok(())
}

/// Checks applied to every record received from a peer
pub struct RemoteRecordValidator {
    max_clock_skew_ms: i64,
}

impl RemoteRecordValidator {
    pub fn new(max_clock_skew: Duration) -> Self {
        Self {
            max_clock_skew_ms: max_clock_skew.as_millis() as i64,
        }
    }

    pub fn price(&self, price: &MarketplacePrice, now: i64) -> MarketplaceResult<()> {
        require("id", &price.id)?;
        validate_price(price)?;
        self.check_timestamp(price, now)
    }

    pub fn alert(&self, alert: &MarketplaceAlert, now: i64) -> MarketplaceResult<()> {
        require("id", &alert.id)?;
        validate_alert(alert)?;
        self.check_timestamp(alert, now)
    }

    pub fn trader(&self, trader: &BluetoothTrader, now: i64) -> MarketplaceResult<()> {
        validate_trader(trader)?;
        self.check_timestamp(trader, now)
    }

    fn check_timestamp<R: Record>(&self, record: &R, now: i64) -> MarketplaceResult<()> {
        let timestamp = record.timestamp();
        if timestamp <= 0 {
            return Err(MarketplaceError::ValidationFailed(format!(
                "invalid timestamp: {}",
                timestamp
            )));
        }
        if timestamp > now.saturating_add(self.max_clock_skew_ms) {
            return Err(MarketplaceError::ValidationFailed(format!(
                "future timestamp (record: {}, now: {})",
                timestamp, now
            )));
        }
        Ok(())
    }
}
