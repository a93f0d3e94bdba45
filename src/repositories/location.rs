//! Live location broadcasting: send-on-interval and latest-per-peer state.

use crate::codec;
use crate::error::TransportError;
use crate::group::{self, FluxonGroup, MessageType};
use crate::identity::Identity;
use crate::relay::MeshRelay;
use crate::transport::Transport;
use crate::types::{LocationUpdate, PacketType, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::instrument;

/// Holds the latest [`LocationUpdate`] seen per peer; older updates from
/// the same peer simply replace the map entry rather than accumulating.
pub struct LocationRepository {
    latest: HashMap<PeerId, LocationUpdate>,
    broadcasting: bool,
    permission_granted: bool,
}

impl LocationRepository {
    pub fn new() -> Self {
        Self { latest: HashMap::new(), broadcasting: false, permission_granted: false }
    }

    pub fn set_broadcasting(&mut self, on: bool) {
        self.broadcasting = on;
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting
    }

    /// Host apps call this from their location-permission callback. The
    /// interval driver in [`spawn_broadcast_loop`] only sends while both
    /// this and [`Self::is_broadcasting`] hold.
    pub fn set_permission_granted(&mut self, granted: bool) {
        self.permission_granted = granted;
    }

    pub fn permission_granted(&self) -> bool {
        self.permission_granted
    }

    fn should_broadcast(&self) -> bool {
        self.broadcasting && self.permission_granted
    }

    pub fn latest_for(&self, peer: &PeerId) -> Option<&LocationUpdate> {
        self.latest.get(peer)
    }

    pub fn all_latest(&self) -> impl Iterator<Item = (&PeerId, &LocationUpdate)> {
        self.latest.iter()
    }

    #[instrument(skip(self, relay, identity, group))]
    pub async fn broadcast_once<T: Transport>(
        &self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        update: LocationUpdate,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        if !self.broadcasting {
            return Ok(());
        }
        let self_id = identity.peer_id().map_err(|_| TransportError::Unavailable)?;
        let plaintext = codec::encode_location(&update);
        let ciphertext = group::encrypt(group, MessageType::Location, &plaintext).map_err(|_| TransportError::Unavailable)?;
        let packet = codec::build_packet(
            PacketType::Location,
            self_id,
            PeerId::BROADCAST,
            crate::config::MeshConfig::default().max_ttl,
            ciphertext,
            now_ms,
        )
        .map_err(|_| TransportError::Unavailable)?;
        relay.broadcast(packet, identity).await
    }

    pub fn receive(&mut self, group: Option<&FluxonGroup>, sender: PeerId, ciphertext: &[u8]) -> Option<&LocationUpdate> {
        let plaintext = group::decrypt(group, MessageType::Location, ciphertext).ok()?;
        let update = codec::decode_location(&plaintext)?;
        self.latest.insert(sender, update);
        self.latest.get(&sender)
    }
}

/// Drives the repository's automatic broadcast, ticking every `interval`
/// and calling `current_position` for a fresh fix each time. Sends nothing
/// while broadcasting is off or location permission has not been granted —
/// `current_position` returning `None` (e.g. no fix yet) is also a no-op
/// tick, never an error. The returned handle should be aborted on disposal.
pub fn spawn_broadcast_loop<T: Transport + 'static>(
    repo: Arc<Mutex<LocationRepository>>,
    relay: Arc<MeshRelay<T>>,
    identity: Arc<Identity>,
    group: Arc<Mutex<Option<FluxonGroup>>>,
    interval: Duration,
    current_position: impl Fn() -> Option<LocationUpdate> + Send + Sync + 'static,
    now_ms_fn: impl Fn() -> u64 + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            let should_send = repo.lock().await.should_broadcast();
            if !should_send {
                continue;
            }
            let Some(update) = current_position() else { continue };
            let group_guard = group.lock().await;
            let repo_guard = repo.lock().await;
            if let Err(e) = repo_guard.broadcast_once(&relay, &identity, group_guard.as_ref(), update, now_ms_fn()).await {
                tracing::warn!(error = %e, "location interval broadcast failed");
            }
        }
    })
}

impl Default for LocationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_update_replaces_older_for_same_peer() {
        let mut repo = LocationRepository::new();
        let peer = PeerId([1u8; 32]);
        let a = LocationUpdate { lat: 1.0, lon: 1.0, accuracy: 5.0, altitude: 0.0, speed: 0.0, bearing: 0.0 };
        let b = LocationUpdate { lat: 2.0, lon: 2.0, accuracy: 5.0, altitude: 0.0, speed: 0.0, bearing: 0.0 };
        repo.latest.insert(peer, a);
        repo.latest.insert(peer, b);
        assert_eq!(repo.latest_for(&peer).unwrap().lat, 2.0);
        assert_eq!(repo.all_latest().count(), 1);
    }

    #[test]
    fn broadcast_requires_both_enabled_and_permission() {
        let mut repo = LocationRepository::new();
        assert!(!repo.should_broadcast());
        repo.set_broadcasting(true);
        assert!(!repo.should_broadcast(), "permission not yet granted");
        repo.set_permission_granted(true);
        assert!(repo.should_broadcast());
        repo.set_broadcasting(false);
        assert!(!repo.should_broadcast(), "broadcasting turned back off");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_loop_sends_only_while_enabled_and_permitted() {
        use crate::config::MeshConfig;
        use crate::identity::Identity;
        use crate::keystore::MemoryKeystore;
        use crate::transport::InProcessMeshFabric;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fabric = InProcessMeshFabric::new();
        let ks = MemoryKeystore::new();
        let mut identity = Identity::new(10);
        identity.initialize(&ks).await.unwrap();
        let peer_id = identity.peer_id().unwrap();
        let (transport, _rx) = fabric.add_device(peer_id);
        let config = MeshConfig::default();
        let relay = Arc::new(MeshRelay::new(peer_id, &config, transport));

        let repo = Arc::new(Mutex::new(LocationRepository::new()));
        let group: Arc<Mutex<Option<FluxonGroup>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_closure = calls.clone();

        let handle = spawn_broadcast_loop(
            repo.clone(),
            relay,
            Arc::new(identity),
            group,
            Duration::from_secs(1),
            move || {
                calls_for_closure.fetch_add(1, Ordering::SeqCst);
                None::<LocationUpdate>
            },
            || 0u64,
        );

        time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "nothing polled while broadcasting is disabled");

        {
            let mut guard = repo.lock().await;
            guard.set_broadcasting(true);
            guard.set_permission_granted(true);
        }
        time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(calls.load(Ordering::SeqCst) >= 2, "position polled once enabled and permitted");

        handle.abort();
    }
}
