//! Marketplace gossip service
//!
//! Turns mesh envelopes into price, alert and trader records, answers price
//! requests from peers and keeps this device's presence and recent prices
//! circulating on two timers.

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::message::{GossipMessage, GossipPayload};
use crate::query;
use crate::store::RecordStore;
use crate::types::{
    BluetoothTrader, MarketplaceAlert, MarketplacePrice, PriceRequest, TraderRole,
};
use crate::validation::{validate_alert, validate_price, validate_trader, RemoteRecordValidator};
use ble_mesh::{Envelope, MeshRouter};
use shared::clock::Clock;
use shared::config::GossipConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Lifecycle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    timers_started: bool,
}

/// Gossip layer on top of a [`MeshRouter`]
///
/// Cheap to clone; all clones share the same record stores.
#[derive(Clone)]
pub struct MarketplaceService {
    router: MeshRouter,
    config: Arc<GossipConfig>,
    clock: Arc<dyn Clock>,
    validator: Arc<RemoteRecordValidator>,
    prices: RecordStore<MarketplacePrice>,
    alerts: RecordStore<MarketplaceAlert>,
    traders: RecordStore<BluetoothTrader>,
    /// Local trader profile re-announced on the announce timer
    profile: Arc<RwLock<Option<BluetoothTrader>>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl MarketplaceService {
    /// Create the service and subscribe it to the router's envelopes
    pub async fn new(router: MeshRouter, config: GossipConfig, clock: Arc<dyn Clock>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        router
            .on_message(move |envelope| {
                if inbound_tx.send(envelope.clone()).is_err() {
                    debug!(envelope_id = %envelope.id, "Marketplace stopped, dropping envelope");
                }
            })
            .await;

        let shutdown = CancellationToken::new();
        let service = Self {
            router,
            validator: Arc::new(RemoteRecordValidator::new(config.max_clock_skew)),
            config: Arc::new(config),
            clock,
            prices: RecordStore::spawn("prices"),
            alerts: RecordStore::spawn("alerts"),
            traders: RecordStore::spawn("traders"),
            profile: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                shutdown: shutdown.clone(),
                tasks: Vec::new(),
                timers_started: false,
            })),
        };

        let inbound = tokio::spawn(service.clone().run_inbound(inbound_rx, shutdown));
        service.lifecycle.lock().await.tasks.push(inbound);

        info!(device_id = %service.device_id(), "Marketplace service created");
        service
    }

    pub fn device_id(&self) -> &str {
        self.router.device_id()
    }

    /// Validate, stamp, store and broadcast a price
    pub async fn broadcast_price(&self, mut price: MarketplacePrice) -> MarketplaceResult<MarketplacePrice> {
        validate_price(&price)?;
        price.id = Uuid::new_v4().to_string();
        price.timestamp = self.clock.now_millis();

        self.prices.upsert(price.clone()).await;
        let delivered = self.send_payload(GossipPayload::PriceUpdate(price.clone())).await;

        info!(
            price_id = %price.id,
            commodity = %price.commodity,
            price = price.price,
            delivered,
            "Broadcast price"
        );
        Ok(price)
    }

    pub async fn broadcast_alert(&self, mut alert: MarketplaceAlert) -> MarketplaceResult<MarketplaceAlert> {
        validate_alert(&alert)?;
        alert.id = Uuid::new_v4().to_string();
        alert.timestamp = self.clock.now_millis();
        if alert.user_id.trim().is_empty() {
            alert.user_id = self.device_id().to_string();
        }

        self.alerts.upsert(alert.clone()).await;
        let delivered = self
            .send_payload(GossipPayload::MarketplaceAlert(alert.clone()))
            .await;

        info!(alert_id = %alert.id, alert_type = ?alert.alert_type, delivered, "Broadcast alert");
        Ok(alert)
    }

    /// Announce this device's trader profile; it is re-announced on the
    /// announce timer once [`start`](Self::start) has been called
    pub async fn announce_trader(&self, mut trader: BluetoothTrader) -> MarketplaceResult<BluetoothTrader> {
        trader.device_id = self.device_id().to_string();
        trader.last_seen = self.clock.now_millis();
        validate_trader(&trader)?;

        *self.profile.write().await = Some(trader.clone());
        self.traders.upsert(trader.clone()).await;
        let delivered = self
            .send_payload(GossipPayload::TraderAnnouncement(trader.clone()))
            .await;

        debug!(name = %trader.name, role = %trader.role, delivered, "Announced trader profile");
        Ok(trader)
    }

    /// Ask peers for fresh prices of `commodity`
    pub async fn request_prices(&self, commodity: &str, location: Option<&str>) -> MarketplaceResult<()> {
        if commodity.trim().is_empty() {
            return Err(MarketplaceError::ValidationFailed(
                "commodity must not be empty".to_string(),
            ));
        }

        let request = PriceRequest {
            commodity: commodity.to_string(),
            location: location.map(str::to_string),
        };
        let delivered = self.send_payload(GossipPayload::PriceRequest(request)).await;

        debug!(commodity, location, delivered, "Requested prices");
        Ok(())
    }

    pub async fn get_prices_nearby(
        &self,
        commodity: Option<&str>,
        location: Option<&str>,
    ) -> Vec<MarketplacePrice> {
        query::prices_nearby(
            self.prices.snapshot().await,
            commodity,
            location,
            self.clock.now_millis(),
            self.config.price_freshness,
        )
    }

    pub async fn get_alerts_nearby(
        &self,
        commodity: Option<&str>,
        location: Option<&str>,
    ) -> Vec<MarketplaceAlert> {
        query::alerts_nearby(
            self.alerts.snapshot().await,
            commodity,
            location,
            self.clock.now_millis(),
            self.config.alert_freshness,
        )
    }

    pub async fn find_traders(
        &self,
        role: Option<TraderRole>,
        commodity: Option<&str>,
        location: Option<&str>,
    ) -> Vec<BluetoothTrader> {
        query::traders_matching(
            self.traders.snapshot().await,
            role,
            commodity,
            location,
            self.clock.now_millis(),
            self.config.trader_freshness,
        )
    }

    pub fn on_prices_update<F>(&self, listener: F)
    where
        F: Fn(&[MarketplacePrice]) + Send + Sync + 'static,
    {
        self.prices.subscribe(listener);
    }

    pub fn on_alerts_update<F>(&self, listener: F)
    where
        F: Fn(&[MarketplaceAlert]) + Send + Sync + 'static,
    {
        self.alerts.subscribe(listener);
    }

    pub fn on_traders_update<F>(&self, listener: F)
    where
        F: Fn(&[BluetoothTrader]) + Send + Sync + 'static,
    {
        self.traders.subscribe(listener);
    }

    /// Launch the announce and reshare timers
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.shutdown.is_cancelled() {
            warn!("Marketplace service already shut down, not starting timers");
            return;
        }
        if lifecycle.timers_started {
            return;
        }
        lifecycle.timers_started = true;

        let token = lifecycle.shutdown.clone();
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_announce(token.clone())));
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_reshare(token)));

        info!(
            announce_interval = ?self.config.announce_interval,
            reshare_interval = ?self.config.reshare_interval,
            "Marketplace gossip started"
        );
    }

    /// Stop the timers and the inbound task
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.shutdown.cancel();
        for task in lifecycle.tasks.drain(..) {
            task.abort();
        }
        info!("Marketplace service shut down");
    }

    /// Re-broadcast the newest prices seen within the reshare window;
    /// returns how many were sent
    pub async fn reshare_recent_prices(&self) -> usize {
        let recent = query::recent_prices(
            self.prices.snapshot().await,
            self.clock.now_millis(),
            self.config.reshare_window,
            self.config.reshare_limit,
        );

        let count = recent.len();
        for price in recent {
            self.send_payload(GossipPayload::PriceUpdate(price)).await;
        }

        if count > 0 {
            debug!(count, "Reshared recent prices");
        }
        count
    }

    async fn reannounce(&self) {
        let profile = self.profile.read().await.clone();
        if let Some(profile) = profile {
            if let Err(e) = self.announce_trader(profile).await {
                warn!(error = %e, "Failed to re-announce trader profile");
            }
        }
    }

    async fn send_payload(&self, payload: GossipPayload) -> bool {
        let message = GossipMessage::new(payload, self.device_id(), self.clock.now_millis());
        match message.encode() {
            Ok(content) => self.router.send_message(content, None).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode gossip message");
                false
            }
        }
    }

    async fn run_inbound(self, mut inbound: mpsc::UnboundedReceiver<Envelope>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
            }
        }
        debug!("Marketplace inbound loop stopped");
    }

    async fn run_announce(self, token: CancellationToken) {
        let Some(mut ticker) = timer(self.config.announce_interval, Instant::now()) else {
            warn!("Announce interval is zero, announce timer disabled");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.reannounce().await,
            }
        }
    }

    async fn run_reshare(self, token: CancellationToken) {
        let period = self.config.reshare_interval;
        let Some(mut ticker) = timer(period, Instant::now() + period) else {
            warn!("Reshare interval is zero, reshare timer disabled");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.reshare_recent_prices().await;
                }
            }
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let message = match GossipMessage::decode(&envelope.content) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    envelope_id = %envelope.id,
                    sender = %envelope.sender,
                    error = %e,
                    "Dropping undecodable marketplace envelope"
                );
                return;
            }
        };

        let now = self.clock.now_millis();
        match message.payload {
            GossipPayload::PriceUpdate(price) => {
                if let Err(e) = self.validator.price(&price, now) {
                    warn!(sender = %message.sender, price_id = %price.id, error = %e, "Rejecting invalid price");
                    return;
                }
                if self.prices.upsert(price).await {
                    debug!(sender = %message.sender, "Stored remote price");
                }
            }
            GossipPayload::PriceRequest(request) => {
                self.answer_price_request(&message.sender, request).await;
            }
            GossipPayload::MarketplaceAlert(alert) => {
                if let Err(e) = self.validator.alert(&alert, now) {
                    warn!(sender = %message.sender, alert_id = %alert.id, error = %e, "Rejecting invalid alert");
                    return;
                }
                if self.alerts.upsert(alert).await {
                    debug!(sender = %message.sender, "Stored remote alert");
                }
            }
            GossipPayload::TraderAnnouncement(trader) => {
                if trader.device_id == self.device_id() {
                    debug!("Ignoring announcement claiming this device");
                    return;
                }
                if trader.device_id != message.sender {
                    warn!(sender = %message.sender, device_id = %trader.device_id, "Rejecting announcement for another device");
                    return;
                }
                if let Err(e) = self.validator.trader(&trader, now) {
                    warn!(sender = %message.sender, device_id = %trader.device_id, error = %e, "Rejecting invalid trader");
                    return;
                }
                if self.traders.upsert(trader).await {
                    debug!(sender = %message.sender, "Stored trader announcement");
                }
            }
        }
    }

    async fn answer_price_request(&self, requester: &str, request: PriceRequest) {
        if requester == self.device_id() {
            debug!("Ignoring own price request");
            return;
        }
        if request.commodity.trim().is_empty() {
            warn!(requester, "Ignoring price request without commodity");
            return;
        }

        let matches = self
            .get_prices_nearby(Some(&request.commodity), request.location.as_deref())
            .await;
        let replies: Vec<MarketplacePrice> = matches
            .into_iter()
            .take(self.config.request_reply_limit)
            .collect();

        if replies.is_empty() {
            debug!(requester, commodity = %request.commodity, "No prices to answer request");
            return;
        }

        let count = replies.len();
        for price in replies {
            self.send_payload(GossipPayload::PriceUpdate(price)).await;
        }
        info!(requester, commodity = %request.commodity, count, "Answered price request");
    }
}

/// Interval first firing at `start`, or `None` for a zero period
fn timer(period: Duration, start: Instant) -> Option<tokio::time::Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}
