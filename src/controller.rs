//! The mesh-core handle: owns the group, the relay, and every feature
//! repository, and runs the inbound data flow that turns a raw
//! [`InboundDelivery`] into a repository update plus an auto-ack.
//!
//! Grounded on the teacher's `main.rs` `Node::handle_event`, which drains a
//! `Network`'s event channel and dispatches each `NetEvent` variant to a
//! handler method; here the channel is [`MeshRelay::subscribe`] and the
//! variants are [`PacketType`].

use crate::codec;
use crate::group::{self, FluxonGroup, MessageType};
use crate::identity::Identity;
use crate::receipts::ReceiptEngine;
use crate::relay::{InboundDelivery, MeshRelay};
use crate::repositories::chat::ChatRepository;
use crate::repositories::emergency::EmergencyRepository;
use crate::repositories::location::{self, LocationRepository};
use crate::transport::Transport;
use crate::types::{LocationUpdate, PacketType, PeerId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{instrument, trace};

/// Single owner of the group key, the repositories, and the receipt engine
/// for one running device. Host apps construct one per active session and
/// call [`Self::spawn_demux`] once to start the inbound pipeline.
pub struct MeshController<T: Transport> {
    identity: Arc<Identity>,
    relay: Arc<MeshRelay<T>>,
    group: Arc<Mutex<Option<FluxonGroup>>>,
    chat: Arc<Mutex<ChatRepository>>,
    location: Arc<Mutex<LocationRepository>>,
    emergency: Arc<Mutex<EmergencyRepository>>,
    receipts: Arc<ReceiptEngine>,
}

impl<T: Transport + 'static> MeshController<T> {
    pub fn new(
        identity: Arc<Identity>,
        relay: Arc<MeshRelay<T>>,
        group: Arc<Mutex<Option<FluxonGroup>>>,
        chat: Arc<Mutex<ChatRepository>>,
        location: Arc<Mutex<LocationRepository>>,
        emergency: Arc<Mutex<EmergencyRepository>>,
        receipts: Arc<ReceiptEngine>,
    ) -> Arc<Self> {
        Arc::new(Self { identity, relay, group, chat, location, emergency, receipts })
    }

    pub fn chat(&self) -> &Arc<Mutex<ChatRepository>> {
        &self.chat
    }

    pub fn location(&self) -> &Arc<Mutex<LocationRepository>> {
        &self.location
    }

    pub fn emergency(&self) -> &Arc<Mutex<EmergencyRepository>> {
        &self.emergency
    }

    pub fn receipts(&self) -> &Arc<ReceiptEngine> {
        &self.receipts
    }

    pub fn group(&self) -> &Arc<Mutex<Option<FluxonGroup>>> {
        &self.group
    }

    /// Spawns the task that drains [`MeshRelay::subscribe`] and runs
    /// [`Self::handle_delivery`] on every inbound packet. The returned
    /// handle should be aborted on disposal.
    pub fn spawn_demux(self: &Arc<Self>, now_ms_fn: impl Fn() -> u64 + Send + Sync + 'static) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        let mut deliveries = self.relay.subscribe();
        tokio::spawn(async move {
            loop {
                match deliveries.recv().await {
                    Ok(delivery) => controller.handle_delivery(delivery, now_ms_fn()).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "demux lagged behind the relay's delivery stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Runs the inbound data flow: decrypt-and-route by packet type, then
    /// auto-ack a successfully applied Chat/Location/Emergency delivery, or
    /// apply an incoming Ack's receipt(s) to our own sent history.
    #[instrument(skip(self, delivery))]
    async fn handle_delivery(&self, delivery: InboundDelivery, now_ms: u64) {
        let packet = delivery.packet;
        let group_guard = self.group.lock().await;
        let group_ref = group_guard.as_ref();

        match packet.packet_type {
            PacketType::Chat => {
                let applied = {
                    let mut chat = self.chat.lock().await;
                    chat.receive(group_ref, packet.source_id, packet.timestamp, &packet.payload).is_some()
                };
                if applied {
                    self.ack_delivery(group_ref, packet.source_id, packet.timestamp, now_ms).await;
                }
            }
            PacketType::Location => {
                let mut loc = self.location.lock().await;
                loc.receive(group_ref, packet.source_id, &packet.payload);
            }
            PacketType::Emergency => {
                let applied = {
                    let mut emergency = self.emergency.lock().await;
                    emergency.receive(group_ref, packet.source_id, packet.timestamp, &packet.payload).is_some()
                };
                if applied {
                    self.ack_delivery(group_ref, packet.source_id, packet.timestamp, now_ms).await;
                }
            }
            PacketType::Ack => {
                self.apply_incoming_ack(group_ref, packet.source_id, &packet.payload).await;
            }
            PacketType::NoiseEncrypted => {
                trace!("noise-encrypted 1:1 frames are out of the mesh-core's demux scope");
            }
        }
    }

    async fn ack_delivery(&self, group: Option<&FluxonGroup>, original_sender: PeerId, original_timestamp: u64, now_ms: u64) {
        if let Err(e) = self
            .receipts
            .ack_delivery(&self.relay, &self.identity, group, original_sender, original_timestamp, now_ms)
            .await
        {
            trace!(error = %e, "delivery ack failed to send");
        }
    }

    async fn apply_incoming_ack(&self, group: Option<&FluxonGroup>, from: PeerId, ciphertext: &[u8]) {
        let Ok(plaintext) = group::decrypt(group, MessageType::Ack, ciphertext) else {
            return;
        };
        let receipts = match codec::decode_receipt(&plaintext) {
            Some(receipt) => vec![receipt],
            None => codec::decode_batch_receipt(&plaintext).unwrap_or_default(),
        };
        let mut chat = self.chat.lock().await;
        for receipt in &receipts {
            chat.apply_receipt(receipt, from);
        }
    }

    /// Starts the automatic location-broadcast loop, delegating the actual
    /// interval scheduling to [`location::spawn_broadcast_loop`].
    pub fn spawn_location_broadcast(
        self: &Arc<Self>,
        interval: std::time::Duration,
        current_position: impl Fn() -> Option<LocationUpdate> + Send + Sync + 'static,
        now_ms_fn: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        location::spawn_broadcast_loop(
            self.location.clone(),
            self.relay.clone(),
            self.identity.clone(),
            self.group.clone(),
            interval,
            current_position,
            now_ms_fn,
        )
    }
}
