//! BLE transport abstraction (§ external interfaces) plus an in-process
//! mesh simulator used by tests and the demo binary in place of real
//! hardware.

use crate::error::TransportError;
use crate::types::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fan out `frame` to every currently connected peer except `exclude`,
    /// if given (used for split-horizon relay).
    async fn broadcast(&self, frame: Vec<u8>, exclude: Option<PeerId>) -> Result<(), TransportError>;

    /// Deliver `frame` to a single peer via next-hop routing.
    async fn send(&self, frame: Vec<u8>, to: PeerId) -> Result<(), TransportError>;

    fn connected_peers(&self) -> Vec<PeerId>;
}

/// Shared wiring for an in-process mesh: call [`Self::add_device`] for each
/// simulated device, then [`Self::connect`] to add edges. Topology lookups
/// happen live, so edges may be added after devices start sending.
#[derive(Default)]
pub struct InProcessMeshFabric {
    links: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<(PeerId, Vec<u8>)>>>>,
    topology: Arc<Mutex<HashMap<PeerId, Vec<PeerId>>>>,
}

impl InProcessMeshFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device and returns its transport handle plus the
    /// receiver it should poll for inbound frames.
    pub fn add_device(&self, id: PeerId) -> (InProcessMesh, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().insert(id, tx);
        self.topology.lock().unwrap().entry(id).or_default();
        let handle = InProcessMesh {
            self_id: id,
            links: self.links.clone(),
            topology: self.topology.clone(),
        };
        (handle, rx)
    }

    /// Wires a bidirectional edge between two registered devices.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        self.topology.lock().unwrap().entry(a).or_default().push(b);
        self.topology.lock().unwrap().entry(b).or_default().push(a);
    }
}

/// One device's view of an [`InProcessMeshFabric`]: it only ever reaches
/// its direct neighbors, matching the partially-connected topology BLE
/// implies.
pub struct InProcessMesh {
    self_id: PeerId,
    links: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<(PeerId, Vec<u8>)>>>>,
    topology: Arc<Mutex<HashMap<PeerId, Vec<PeerId>>>>,
}

impl InProcessMesh {
    fn neighbors(&self) -> Vec<PeerId> {
        self.topology.lock().unwrap().get(&self.self_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InProcessMesh {
    async fn broadcast(&self, frame: Vec<u8>, exclude: Option<PeerId>) -> Result<(), TransportError> {
        let links = self.links.lock().unwrap();
        for peer in self.neighbors() {
            if Some(peer) == exclude {
                continue;
            }
            if let Some(tx) = links.get(&peer) {
                let _ = tx.send((self.self_id, frame.clone()));
            }
        }
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>, to: PeerId) -> Result<(), TransportError> {
        if !self.neighbors().contains(&to) {
            return Err(TransportError::NoRoute);
        }
        let links = self.links.lock().unwrap();
        match links.get(&to) {
            Some(tx) => tx.send((self.self_id, frame)).map_err(|e| TransportError::WriteFailed(e.to_string())),
            None => Err(TransportError::NoRoute),
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.neighbors()
    }
}
