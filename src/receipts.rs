//! Delivery auto-ack and coalesced read-receipt flushing (§ receipt engine).
//!
//! Grounded on the teacher's `net/sync.rs` `LateSignatureBuffer`: a pending
//! map keyed by an index plus a coalescing flush, generalized here from a
//! τ₂-slot index to a message id and from a fixed flush point to a timer.

use crate::codec;
use crate::config::MeshConfig;
use crate::group::{self, FluxonGroup, MessageType};
use crate::identity::Identity;
use crate::relay::MeshRelay;
use crate::transport::Transport;
use crate::types::{
    ChatMessage, MessageStatus, PacketType, PeerId, Receipt, ReceiptType,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{debug, instrument};

/// Tracks outbound messages by sender+timestamp so incoming receipts can be
/// matched without depending on the flags field.
pub struct ReceiptEngine {
    config: MeshConfig,
    pending_reads: Mutex<HashMap<String, Receipt>>,
}

impl ReceiptEngine {
    pub fn new(config: MeshConfig) -> Self {
        Self { config, pending_reads: Mutex::new(HashMap::new()) }
    }

    /// Immediately sends a `delivered` ack for an inbound message addressed
    /// to us or our group.
    #[instrument(skip_all)]
    pub async fn ack_delivery<T: Transport>(
        &self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        original_sender: PeerId,
        original_timestamp: u64,
        now_ms: u64,
    ) -> Result<(), crate::error::TransportError> {
        let receipt = Receipt {
            receipt_type: ReceiptType::Delivered,
            original_timestamp,
            original_sender_id: original_sender,
        };
        self.send_receipt_packet(relay, identity, group, &[receipt], now_ms).await
    }

    /// Buffers a read receipt; last write for a given `msg_id` wins. The
    /// caller is expected to arm [`Self::spawn_flush_timer`] once at
    /// startup so the buffer drains automatically.
    pub async fn queue_read_receipt(&self, msg_id: String, original_timestamp: u64, original_sender: PeerId) {
        let receipt = Receipt {
            receipt_type: ReceiptType::Read,
            original_timestamp,
            original_sender_id: original_sender,
        };
        let mut pending = self.pending_reads.lock().await;
        if pending.len() >= self.config.max_batch_receipt_count && !pending.contains_key(&msg_id) {
            debug!("read receipt buffer full, dropping oldest-style overflow silently");
            return;
        }
        pending.insert(msg_id, receipt);
    }

    /// Flushes all pending read receipts as a single batch ack. No-op if
    /// nothing is pending.
    #[instrument(skip_all)]
    pub async fn flush<T: Transport>(
        &self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        now_ms: u64,
    ) -> Result<(), crate::error::TransportError> {
        let receipts: Vec<Receipt> = {
            let mut pending = self.pending_reads.lock().await;
            if pending.is_empty() {
                return Ok(());
            }
            pending.drain().map(|(_, r)| r).collect()
        };
        self.send_receipt_packet(relay, identity, group, &receipts, now_ms).await
    }

    /// Spawns a background task that flushes every `coalesce_window`. The
    /// returned handle should be aborted on disposal.
    pub fn spawn_flush_timer<T: Transport + 'static>(
        self: &Arc<Self>,
        relay: Arc<MeshRelay<T>>,
        identity: Arc<Identity>,
        group: Arc<Mutex<Option<FluxonGroup>>>,
        now_ms_fn: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let window = self.config.receipt_coalesce_window;
        tokio::spawn(async move {
            let mut ticker = time::interval(window.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                let group_guard = group.lock().await;
                let _ = engine.flush(&relay, &identity, group_guard.as_ref(), now_ms_fn()).await;
            }
        })
    }

    async fn send_receipt_packet<T: Transport>(
        &self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        receipts: &[Receipt],
        now_ms: u64,
    ) -> Result<(), crate::error::TransportError> {
        let plaintext = if receipts.len() == 1 {
            codec::encode_receipt(&receipts[0])
        } else {
            codec::encode_batch_receipt(receipts)
        };
        let self_id = identity.peer_id().map_err(|_| crate::error::TransportError::Unavailable)?;
        let payload = match group::encrypt(group, MessageType::Ack, &plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(_) => plaintext,
        };
        let packet = codec::build_packet(PacketType::Ack, self_id, PeerId::BROADCAST, self.config.max_ttl, payload, now_ms)
            .map_err(|_| crate::error::TransportError::Unavailable)?;
        relay.broadcast(packet, identity).await
    }

    /// Applies an incoming receipt to `message`, advancing its status
    /// monotonically. Returns `false` if the receipt does not match.
    pub fn apply_receipt(message: &mut ChatMessage, receipt: &Receipt, from: PeerId) -> bool {
        let key_matches = crate::types::message_key(&receipt.original_sender_id, receipt.original_timestamp)
            == crate::types::message_key(&message.sender, message.timestamp);
        if !key_matches || !message.is_local {
            return false;
        }
        match receipt.receipt_type {
            ReceiptType::Delivered => {
                message.delivered_to.insert(from);
                message.advance_status(MessageStatus::Delivered);
            }
            ReceiptType::Read => {
                message.delivered_to.insert(from);
                message.read_by.insert(from);
                message.advance_status(MessageStatus::Read);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_message() -> ChatMessage {
        ChatMessage {
            id: "m1".into(),
            sender: PeerId([1u8; 32]),
            sender_name: "A".into(),
            text: "hi".into(),
            timestamp: 1_700_000_000_000,
            is_local: true,
            status: MessageStatus::Sent,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
        }
    }

    #[test]
    fn status_progresses_sent_delivered_read() {
        let mut msg = sample_message();
        let peer_b = PeerId([2u8; 32]);
        let delivered = Receipt {
            receipt_type: ReceiptType::Delivered,
            original_timestamp: msg.timestamp,
            original_sender_id: msg.sender,
        };
        assert!(ReceiptEngine::apply_receipt(&mut msg, &delivered, peer_b));
        assert_eq!(msg.status, MessageStatus::Delivered);

        let read = Receipt { receipt_type: ReceiptType::Read, ..delivered };
        assert!(ReceiptEngine::apply_receipt(&mut msg, &read, peer_b));
        assert_eq!(msg.status, MessageStatus::Read);
        assert!(msg.read_by.contains(&peer_b));
        assert!(msg.delivered_to.contains(&peer_b));
    }

    #[test]
    fn late_delivered_receipt_never_regresses_read_status() {
        let mut msg = sample_message();
        let peer_b = PeerId([2u8; 32]);
        msg.advance_status(MessageStatus::Read);
        let delivered = Receipt {
            receipt_type: ReceiptType::Delivered,
            original_timestamp: msg.timestamp,
            original_sender_id: msg.sender,
        };
        ReceiptEngine::apply_receipt(&mut msg, &delivered, peer_b);
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[test]
    fn receipt_for_incoming_message_is_ignored() {
        let mut msg = sample_message();
        msg.is_local = false;
        let receipt = Receipt {
            receipt_type: ReceiptType::Delivered,
            original_timestamp: msg.timestamp,
            original_sender_id: msg.sender,
        };
        assert!(!ReceiptEngine::apply_receipt(&mut msg, &receipt, PeerId([3u8; 32])));
        assert_eq!(msg.status, MessageStatus::Sent);
    }
}
