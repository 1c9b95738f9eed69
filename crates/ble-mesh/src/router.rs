//! Mesh relay engine: peer lifecycle, flood relay with deduplication and
//! pending deliveries

use crate::adapter::{
    DeviceId, DeviceInfo, DiscoveredPeer, RadioTransport, TransportEvent,
    DEVICE_INFO_CHARACTERISTIC_UUID, MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use crate::dedup::SeenCache;
use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use crate::store_forward::StoreForwardQueue;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use shared::config::MeshConfig;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the channel carrying transport events to the relay loop
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the per-scan discovery channel
const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked once per received envelope
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Connection lifecycle of a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Peer connection information
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: DeviceId,
    pub name: Option<String>,
    /// Logical device id published on the device-info characteristic
    pub remote_device_id: Option<String>,
    pub state: PeerState,
    pub last_seen: DateTime<Utc>,
}

impl PeerConnection {
    fn discovered(peer: &DiscoveredPeer) -> Self {
        Self {
            peer_id: peer.id.clone(),
            name: peer.name.clone(),
            remote_device_id: None,
            state: PeerState::Discovered,
            last_seen: Utc::now(),
        }
    }

    /// Whether `recipient` names this peer by transport or logical id
    fn answers_to(&self, recipient: &str) -> bool {
        self.peer_id == recipient || self.remote_device_id.as_deref() == Some(recipient)
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// BLE mesh router with flood relay
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct MeshRouter {
    device_id: DeviceId,
    config: Arc<MeshConfig>,
    transport: Arc<dyn RadioTransport>,
    peers: Arc<DashMap<DeviceId, PeerConnection>>,
    seen: Arc<Mutex<SeenCache>>,
    store_forward: Arc<Mutex<StoreForwardQueue>>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl MeshRouter {
    pub fn new(transport: Arc<dyn RadioTransport>, config: MeshConfig) -> Self {
        let seen = SeenCache::new(config.seen_cache_size, config.seen_window);
        let store_forward =
            StoreForwardQueue::new(config.pending_queue_size, config.pending_max_age);

        info!("MeshRouter created with device_id: {}", config.device_id);

        Self {
            device_id: config.device_id.clone(),
            config: Arc::new(config),
            transport,
            peers: Arc::new(DashMap::new()),
            seen: Arc::new(Mutex::new(seen)),
            store_forward: Arc::new(Mutex::new(store_forward)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Bring up the radio and start discovery
    ///
    /// Returns `false` when the platform cannot provide radio access; the
    /// rest of the application keeps working without the mesh.
    pub async fn initialize(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.shutdown.is_some() {
            debug!("MeshRouter already initialized");
            return true;
        }

        let (events_tx, events_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        if let Err(e) = self.transport.start(events_tx).await {
            warn!(error = %e, "Radio transport unavailable, mesh disabled");
            return false;
        }

        let info = DeviceInfo {
            device_id: self.device_id.clone(),
            name: self.config.device_name.clone(),
        };
        if let Err(e) = self.transport.set_device_info(info).await {
            warn!(error = %e, "Failed to publish device info");
        }

        let token = CancellationToken::new();
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_inbound(events_rx, token.clone())));
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_discovery(token.clone())));
        lifecycle.shutdown = Some(token);

        info!(device_id = %self.device_id, "Mesh router initialized");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.shutdown.is_some()
    }

    /// Register a callback for every envelope delivered to this device
    ///
    /// Handlers run in arrival order on the relay task and must not block.
    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.handlers.write().await.push(Arc::new(handler));
    }

    /// Send `content` to `recipient`, or to every connected peer when `None`
    ///
    /// A directed message to a peer that is not connected is queued until it
    /// connects and `false` is returned. A broadcast returns `true` only if
    /// every per-peer write succeeded.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        recipient: Option<DeviceId>,
    ) -> bool {
        let envelope = Envelope::new(
            self.device_id.clone(),
            recipient,
            content,
            self.config.message_ttl,
        );
        self.send_envelope(envelope).await
    }

    /// Send a prepared envelope originated by this device
    pub async fn send_envelope(&self, envelope: Envelope) -> bool {
        // Our own id must never come back to us as new
        self.seen.lock().await.insert(envelope.id);

        let Some(recipient) = envelope.recipient.clone() else {
            return self.broadcast(&envelope, None).await;
        };

        match self.resolve_connected(&recipient) {
            Some((peer, remote)) => match self.write_to(&peer, &readdress(&envelope, remote)).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %peer, envelope_id = %envelope.id, error = %e, "Direct send failed");
                    false
                }
            },
            None => {
                debug!(recipient = %recipient, envelope_id = %envelope.id, "Recipient not connected, queueing");
                if let Err(e) = self.store_forward.lock().await.store(&recipient, envelope) {
                    warn!(recipient = %recipient, error = %e, "Failed to queue envelope");
                }
                false
            }
        }
    }

    /// Tear down every connection and clear in-memory state
    pub async fn disconnect(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if let Some(token) = lifecycle.shutdown.take() {
                token.cancel();
            }
            for task in lifecycle.tasks.drain(..) {
                task.abort();
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            debug!(error = %e, "Failed to stop scan during disconnect");
        }

        let peers: Vec<DeviceId> = self.peers.iter().map(|p| p.key().clone()).collect();
        for peer in peers {
            if let Err(e) = self.transport.disconnect(&peer).await {
                debug!(peer = %peer, error = %e, "Disconnect failed");
            }
        }

        self.peers.clear();
        self.store_forward.lock().await.clear();
        self.seen.lock().await.clear();

        info!(device_id = %self.device_id, "Mesh router disconnected");
    }

    /// Connect to a discovered peer, subscribe to its messages and flush
    /// anything queued for it
    pub async fn connect_peer(&self, peer: &DiscoveredPeer) -> MeshResult<()> {
        let result = tokio::time::timeout(self.config.connect_timeout, self.establish(&peer.id))
            .await
            .unwrap_or_else(|_| {
                Err(MeshError::ConnectionFailed(format!(
                    "timed out connecting to {}",
                    peer.id
                )))
            });

        match result {
            Ok(remote_device_id) => {
                {
                    let mut entry = self
                        .peers
                        .entry(peer.id.clone())
                        .or_insert_with(|| PeerConnection::discovered(peer));
                    entry.state = PeerState::Connected;
                    entry.remote_device_id = remote_device_id.clone();
                    entry.last_seen = Utc::now();
                }
                info!(peer = %peer.id, remote_device_id = ?remote_device_id, "Peer connected");

                self.flush_pending(&peer.id, remote_device_id.as_deref())
                    .await;
                Ok(())
            }
            Err(e) => {
                if let Some(mut entry) = self.peers.get_mut(&peer.id) {
                    entry.state = PeerState::Error;
                }
                warn!(peer = %peer.id, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// Peers currently in the `Connected` state
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.peers
            .iter()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn peer_state(&self, peer: &str) -> Option<PeerState> {
        self.peers.get(peer).map(|p| p.state)
    }

    pub fn peers(&self) -> Vec<PeerConnection> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Envelopes waiting for `recipient` to connect
    pub async fn pending_count(&self, recipient: &DeviceId) -> usize {
        self.store_forward.lock().await.get_queue_size(recipient)
    }

    async fn run_inbound(self, mut events: mpsc::Receiver<TransportEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Data { peer, characteristic, bytes }) => {
                        if characteristic != MESSAGE_CHARACTERISTIC_UUID {
                            debug!(peer = %peer, %characteristic, "Ignoring data on foreign characteristic");
                            continue;
                        }
                        self.handle_frame(&peer, &bytes).await;
                    }
                    Some(TransportEvent::Disconnected { peer }) => self.mark_disconnected(&peer),
                    None => break,
                },
            }
        }
        debug!("Relay loop stopped");
    }

    /// Scan for a window, pause, repeat until cancelled
    async fn run_discovery(self, token: CancellationToken) {
        loop {
            let (tx, mut rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);

            match self.transport.start_scan(SERVICE_UUID, tx).await {
                Ok(()) => {
                    let window = tokio::time::sleep(self.config.scan_window);
                    tokio::pin!(window);
                    let mut scanning = true;

                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = &mut window => break,
                            discovered = rx.recv(), if scanning => match discovered {
                                Some(peer) => self.on_discovered(peer).await,
                                None => scanning = false,
                            },
                        }
                    }

                    if let Err(e) = self.transport.stop_scan().await {
                        warn!(error = %e, "Failed to stop scan");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to start scan"),
            }

            {
                let mut store_forward = self.store_forward.lock().await;
                store_forward.cleanup_expired();
                if store_forward.recipient_count() > 0 {
                    debug!(
                        pending = store_forward.total_envelopes(),
                        recipients = store_forward.recipient_count(),
                        "Pending deliveries waiting for offline peers"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.scan_pause) => {}
            }
        }
    }

    async fn on_discovered(&self, peer: DiscoveredPeer) {
        if !peer.advertises(&SERVICE_UUID) {
            debug!(peer = %peer.id, "Peer does not advertise the marketplace service");
            return;
        }

        {
            let mut entry = self
                .peers
                .entry(peer.id.clone())
                .or_insert_with(|| PeerConnection::discovered(&peer));

            if matches!(entry.state, PeerState::Connecting | PeerState::Connected) {
                entry.last_seen = Utc::now();
                return;
            }
            entry.state = PeerState::Connecting;
        }

        debug!(peer = %peer.id, "Discovered peer, connecting");
        // Failures are logged and retried on a later scan
        let _ = self.connect_peer(&peer).await;
    }

    async fn establish(&self, peer: &DeviceId) -> MeshResult<Option<String>> {
        self.transport.connect(peer).await?;
        self.transport
            .subscribe(peer, SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID)
            .await?;

        let remote = match self
            .transport
            .read(peer, SERVICE_UUID, DEVICE_INFO_CHARACTERISTIC_UUID)
            .await
        {
            Ok(raw) => match serde_json::from_slice::<DeviceInfo>(&raw) {
                Ok(info) => Some(info.device_id),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Unreadable device info");
                    None
                }
            },
            Err(e) => {
                debug!(peer = %peer, error = %e, "Device info not available");
                None
            }
        };

        Ok(remote)
    }

    async fn flush_pending(&self, peer: &DeviceId, remote_device_id: Option<&str>) {
        let pending = {
            let mut store_forward = self.store_forward.lock().await;
            let mut pending = store_forward.retrieve(peer);
            if let Some(remote) = remote_device_id.filter(|r| *r != peer.as_str()) {
                pending.extend(store_forward.retrieve(&remote.to_string()));
            }
            pending
        };

        for envelope in pending {
            let envelope = readdress(&envelope, remote_device_id.map(str::to_string));
            if let Err(e) = self.write_to(peer, &envelope).await {
                warn!(peer = %peer, envelope_id = %envelope.id, error = %e, "Pending delivery failed");
            }
        }
    }

    fn mark_disconnected(&self, peer: &DeviceId) {
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.state = PeerState::Disconnected;
            info!(peer = %peer, "Peer disconnected");
        }
    }

    /// Connected peer answering to `recipient`, with its logical id if known
    fn resolve_connected(&self, recipient: &str) -> Option<(DeviceId, Option<String>)> {
        self.peers
            .iter()
            .find(|p| p.state == PeerState::Connected && p.answers_to(recipient))
            .map(|p| (p.peer_id.clone(), p.remote_device_id.clone()))
    }

    /// Receive, deliver and relay one frame from `from`
    async fn handle_frame(&self, from: &DeviceId, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        if let Some(mut entry) = self.peers.get_mut(from) {
            entry.last_seen = Utc::now();
        }

        if !self.seen.lock().await.insert(envelope.id) {
            debug!(envelope_id = %envelope.id, peer = %from, "Duplicate envelope, discarding");
            return;
        }

        if envelope.sender == self.device_id {
            debug!(envelope_id = %envelope.id, "Own envelope echoed back, discarding");
            return;
        }

        debug!(envelope_id = %envelope.id, sender = %envelope.sender, peer = %from, ttl = envelope.ttl, "Received envelope");

        if envelope.is_addressed_to(&self.device_id) {
            self.dispatch(&envelope).await;
        }

        if envelope.recipient.as_deref() == Some(self.device_id.as_str()) {
            return;
        }

        self.relay(&envelope, from).await;
    }

    async fn dispatch(&self, envelope: &Envelope) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers.iter() {
            handler(envelope);
        }
    }

    /// Forward to every connected peer except `from`
    async fn relay(&self, envelope: &Envelope, from: &DeviceId) {
        let Some(forwarded) = envelope.next_hop() else {
            debug!(envelope_id = %envelope.id, "TTL exhausted, not forwarding");
            return;
        };

        if let Some(recipient) = forwarded.recipient.clone() {
            if let Some((peer, remote)) = self.resolve_connected(&recipient) {
                if peer != *from {
                    if let Err(e) = self.write_to(&peer, &readdress(&forwarded, remote)).await {
                        warn!(peer = %peer, envelope_id = %forwarded.id, error = %e, "Failed to forward directed envelope");
                    }
                }
                return;
            }

            if let Err(e) = self
                .store_forward
                .lock()
                .await
                .store(&recipient, forwarded.clone())
            {
                debug!(recipient = %recipient, error = %e, "Not queueing relayed envelope");
            }
        }

        self.broadcast(&forwarded, Some(from)).await;
    }

    /// Write to all connected peers (minus `exclude`); `true` if every write succeeded
    async fn broadcast(&self, envelope: &Envelope, exclude: Option<&DeviceId>) -> bool {
        let targets: Vec<DeviceId> = self
            .connected_peers()
            .into_iter()
            .filter(|peer| Some(peer) != exclude)
            .collect();

        if targets.is_empty() {
            debug!(envelope_id = %envelope.id, "No peers available for broadcast");
            return true;
        }

        let results = join_all(targets.iter().map(|peer| self.write_to(peer, envelope))).await;

        let mut all_ok = true;
        for (peer, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %peer, envelope_id = %envelope.id, error = %e, "Failed to send envelope to peer");
                all_ok = false;
            }
        }

        debug!(envelope_id = %envelope.id, peers = targets.len(), all_ok, "Broadcast complete");
        all_ok
    }

    async fn write_to(&self, peer: &DeviceId, envelope: &Envelope) -> MeshResult<()> {
        let bytes = envelope.to_bytes()?;

        tokio::time::timeout(
            self.config.write_timeout,
            self.transport
                .write(peer, SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID, &bytes),
        )
        .await
        .map_err(|_| MeshError::TransmissionFailed(format!("write to {} timed out", peer)))?
    }
}

/// Name the recipient by the logical id it matches on receipt
///
/// A transport peer id is only meaningful to the sending side, so a
/// directed envelope is rewritten to the device id the peer published
/// before it goes over the air.
fn readdress(envelope: &Envelope, remote_device_id: Option<String>) -> Envelope {
    match remote_device_id {
        Some(remote) if envelope.recipient.is_some() && envelope.recipient.as_ref() != Some(&remote) => {
            Envelope {
                recipient: Some(remote),
                ..envelope.clone()
            }
        }
        _ => envelope.clone(),
    }
}
