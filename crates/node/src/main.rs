use anyhow::{Context, Result};
use ble_mesh::{BtleplugTransport, MeshRouter};
use marketplace::{BluetoothTrader, MarketplaceService, TraderRole};
use shared::clock::SystemClock;
use shared::config::{Config, ProfileConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::init_from_env();

    tracing::info!("Starting Soko mesh node");

    let config = Config::from_env()?;
    tracing::info!(device_id = %config.mesh.device_id, "Configuration loaded successfully");

    let router = MeshRouter::new(Arc::new(BtleplugTransport::new()), config.mesh.clone());
    let service = MarketplaceService::new(router.clone(), config.gossip.clone(), Arc::new(SystemClock)).await;

    service.on_prices_update(|prices| tracing::info!(count = prices.len(), "Price board updated"));
    service.on_alerts_update(|alerts| tracing::info!(count = alerts.len(), "Alerts updated"));
    service.on_traders_update(|traders| tracing::info!(count = traders.len(), "Nearby traders updated"));

    if router.initialize().await {
        tracing::info!("Mesh relay started");
    } else {
        // Marketplace still answers local queries without a radio
        tracing::warn!("Bluetooth unavailable, mesh features disabled");
    }

    if let Some(profile) = &config.profile {
        let trader = trader_from_profile(profile)?;
        match service.announce_trader(trader).await {
            Ok(announced) => tracing::info!(name = %announced.name, role = %announced.role, "Trader profile announced"),
            Err(e) => tracing::warn!(error = %e, "Trader profile rejected"),
        }
    }

    service.start().await;
    tracing::info!("Marketplace gossip started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    service.shutdown().await;
    router.disconnect().await;

    Ok(())
}

fn trader_from_profile(profile: &ProfileConfig) -> Result<BluetoothTrader> {
    let role: TraderRole = profile
        .role
        .parse()
        .with_context(|| format!("Invalid TRADER_ROLE '{}'", profile.role))?;

    Ok(BluetoothTrader::new(
        profile.name.clone(),
        role,
        profile.location.clone(),
        profile.county.clone(),
        profile.commodities.clone(),
    )
    .with_services(profile.services.clone())
    .with_contact(profile.contact.clone()))
}
