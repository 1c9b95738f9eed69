//! In-process radio transport
//!
//! A [`LoopbackHub`] holds a set of simulated devices and the radio links
//! between them. Each device gets a [`LoopbackTransport`] that behaves like a
//! BLE central: it only discovers linked, powered peers, must connect before
//! writing, and a write to a peer surfaces as a [`TransportEvent::Data`] on
//! that peer's event sink. Used for local simulations and the mesh tests.

use crate::adapter::{
    DeviceId, DeviceInfo, DiscoveredPeer, RadioTransport, TransportEvent,
    DEVICE_INFO_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct NodeState {
    powered: bool,
    events: Option<mpsc::Sender<TransportEvent>>,
    info: Option<DeviceInfo>,
    /// Peers this node has opened a connection to
    connections: HashSet<DeviceId>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<DeviceId, NodeState>,
    links: HashSet<(DeviceId, DeviceId)>,
    /// Last value written per (writer, target, characteristic)
    mailboxes: HashMap<(DeviceId, DeviceId, Uuid), Vec<u8>>,
}

impl HubState {
    fn linked(&self, a: &str, b: &str) -> bool {
        self.links.contains(&link_key(a, b))
    }

    fn node(&self, id: &str) -> MeshResult<&NodeState> {
        self.nodes
            .get(id)
            .ok_or_else(|| MeshError::DeviceNotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> MeshResult<&mut NodeState> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| MeshError::DeviceNotFound(id.to_string()))
    }

    /// Both ends linked, powered and started
    fn reachable(&self, from: &str, to: &str) -> bool {
        let started = |id: &str| {
            self.nodes
                .get(id)
                .map(|n| n.powered && n.events.is_some())
                .unwrap_or(false)
        };
        self.linked(from, to) && started(from) && started(to)
    }
}

fn link_key(a: &str, b: &str) -> (DeviceId, DeviceId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared radio medium for a set of simulated devices
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a powered device and return its transport
    pub fn transport(&self, id: impl Into<DeviceId>) -> LoopbackTransport {
        let id = id.into();
        self.lock().nodes.entry(id.clone()).or_default().powered = true;

        LoopbackTransport {
            id,
            hub: self.clone(),
        }
    }

    /// Put two devices in radio range of each other
    pub fn link(&self, a: &str, b: &str) {
        self.lock().links.insert(link_key(a, b));
    }

    /// Take two devices out of range, dropping any connection between them
    pub fn unlink(&self, a: &str, b: &str) {
        let sinks = {
            let mut state = self.lock();
            state.links.remove(&link_key(a, b));

            let mut sinks = Vec::new();
            for (this, other) in [(a, b), (b, a)] {
                if let Some(node) = state.nodes.get_mut(this) {
                    if node.connections.remove(other) {
                        if let Some(events) = node.events.clone() {
                            sinks.push((events, other.to_string()));
                        }
                    }
                }
            }
            sinks
        };

        for (events, peer) in sinks {
            if events
                .try_send(TransportEvent::Disconnected { peer: peer.clone() })
                .is_err()
            {
                debug!("Could not report loss of {} to a full or closed sink", peer);
            }
        }
    }

    /// Simulate the radio being switched on or off
    pub fn set_powered(&self, id: &str, powered: bool) {
        let mut state = self.lock();
        let node = state.nodes.entry(id.to_string()).or_default();
        node.powered = powered;
        if !powered {
            node.events = None;
            node.connections.clear();
        }
    }

    /// Peers `id` currently holds a connection to
    pub fn connections(&self, id: &str) -> Vec<DeviceId> {
        self.lock()
            .nodes
            .get(id)
            .map(|n| n.connections.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One simulated device's view of the [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackTransport {
    id: DeviceId,
    hub: LoopbackHub,
}

impl LoopbackTransport {
    fn require_connection(state: &HubState, from: &str, to: &str) -> MeshResult<()> {
        let node = state.node(from)?;
        if !node.connections.contains(to) || !state.reachable(from, to) {
            return Err(MeshError::ConnectionFailed(format!(
                "{} is not connected to {}",
                from, to
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RadioTransport for LoopbackTransport {
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> MeshResult<()> {
        let mut state = self.hub.lock();
        let node = state.node_mut(&self.id)?;

        if !node.powered {
            return Err(MeshError::TransportUnavailable(format!(
                "radio on {} is powered off",
                self.id
            )));
        }

        node.events = Some(events);
        Ok(())
    }

    async fn set_device_info(&self, info: DeviceInfo) -> MeshResult<()> {
        self.hub.lock().node_mut(&self.id)?.info = Some(info);
        Ok(())
    }

    async fn start_scan(
        &self,
        service: Uuid,
        discovered: mpsc::Sender<DiscoveredPeer>,
    ) -> MeshResult<()> {
        let found: Vec<DiscoveredPeer> = {
            let state = self.hub.lock();
            state
                .nodes
                .iter()
                .filter(|(id, _)| **id != self.id && state.reachable(&self.id, id))
                .map(|(id, node)| DiscoveredPeer {
                    id: id.clone(),
                    name: node.info.as_ref().map(|i| i.name.clone()),
                    services: vec![SERVICE_UUID],
                    rssi: Some(-50),
                })
                .filter(|peer| peer.advertises(&service))
                .collect()
        };

        for peer in found {
            if discovered.send(peer).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn connect(&self, peer: &DeviceId) -> MeshResult<()> {
        let mut state = self.hub.lock();

        if !state.reachable(&self.id, peer) {
            return Err(MeshError::ConnectionFailed(format!(
                "{} is out of range of {}",
                peer, self.id
            )));
        }

        state.node_mut(&self.id)?.connections.insert(peer.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        peer: &DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> MeshResult<()> {
        // Writes from the peer always reach our sink; only the link matters
        Self::require_connection(&self.hub.lock(), &self.id, peer)
    }

    async fn write(
        &self,
        peer: &DeviceId,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> MeshResult<()> {
        let events = {
            let mut state = self.hub.lock();
            Self::require_connection(&state, &self.id, peer)?;

            state
                .mailboxes
                .insert((self.id.clone(), peer.clone(), characteristic), data.to_vec());

            state
                .node(peer)?
                .events
                .clone()
                .ok_or_else(|| MeshError::DeviceNotFound(peer.clone()))?
        };

        events
            .send(TransportEvent::Data {
                peer: self.id.clone(),
                characteristic,
                bytes: data.to_vec(),
            })
            .await
            .map_err(|_| MeshError::TransmissionFailed(format!("{} stopped receiving", peer)))
    }

    async fn read(
        &self,
        peer: &DeviceId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> MeshResult<Vec<u8>> {
        let state = self.hub.lock();
        Self::require_connection(&state, &self.id, peer)?;

        if characteristic == DEVICE_INFO_CHARACTERISTIC_UUID {
            let info = state
                .node(peer)?
                .info
                .as_ref()
                .ok_or(MeshError::CharacteristicNotFound(characteristic))?;
            return Ok(serde_json::to_vec(info)?);
        }

        Ok(state
            .mailboxes
            .get(&(peer.clone(), self.id.clone(), characteristic))
            .cloned()
            .unwrap_or_default())
    }

    async fn disconnect(&self, peer: &DeviceId) -> MeshResult<()> {
        let mut state = self.hub.lock();
        if !state.node_mut(&self.id)?.connections.remove(peer) {
            return Err(MeshError::DeviceNotFound(peer.clone()));
        }
        Ok(())
    }
}
