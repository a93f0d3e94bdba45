//! Broadcast and 1:1 chat messaging.

use super::push_capped;
use crate::codec;
use crate::error::TransportError;
use crate::group::{self, FluxonGroup, MessageType};
use crate::identity::Identity;
use crate::receipts::ReceiptEngine;
use crate::relay::MeshRelay;
use crate::transport::Transport;
use crate::types::{ChatMessage, ChatPayload, MessageStatus, PacketType, PeerId};
use std::collections::BTreeSet;
use tracing::instrument;

/// In-memory chat history plus the send/receive pipeline. Private 1:1
/// sends are out of this repository's scope — they route through a
/// Noise-XX session (see [`crate::noise`]) instead of the group cipher.
pub struct ChatRepository {
    cap: usize,
    messages: Vec<ChatMessage>,
}

impl ChatRepository {
    pub fn new(cap: usize) -> Self {
        Self { cap, messages: Vec::new() }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Encrypts, frames, signs, and broadcasts a chat message to the
    /// active group; records it locally as `sent`.
    #[instrument(skip(self, relay, identity, group))]
    pub async fn send<T: Transport>(
        &mut self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        sender_name: String,
        text: String,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        let self_id = identity.peer_id().map_err(|_| TransportError::Unavailable)?;
        let plaintext = codec::encode_chat(&ChatPayload { sender_name: sender_name.clone(), text: text.clone() });
        let ciphertext = group::encrypt(group, MessageType::Chat, &plaintext).map_err(|_| TransportError::Unavailable)?;
        let packet = codec::build_packet(PacketType::Chat, self_id, PeerId::BROADCAST, relay_default_ttl(), ciphertext, now_ms)
            .map_err(|_| TransportError::Unavailable)?;
        relay.broadcast(packet.clone(), identity).await?;

        push_capped(
            &mut self.messages,
            ChatMessage {
                id: packet.packet_id().to_string(),
                sender: self_id,
                sender_name,
                text,
                timestamp: now_ms,
                is_local: true,
                status: MessageStatus::Sent,
                delivered_to: BTreeSet::new(),
                read_by: BTreeSet::new(),
            },
            self.cap,
        );
        Ok(())
    }

    /// Decrypts and decodes an inbound chat packet already validated by the
    /// relay engine and records it locally. Returns `None` if decryption or
    /// decoding fails (wrong group, malformed payload) — the caller should
    /// treat this as a silent drop. Firing the delivery ack is the caller's
    /// job (see [`crate::controller::MeshController`]), since only it knows
    /// whether this was a fresh delivery worth acking.
    #[instrument(skip(self, group, ciphertext))]
    pub fn receive(&mut self, group: Option<&FluxonGroup>, sender: PeerId, timestamp: u64, ciphertext: &[u8]) -> Option<&ChatMessage> {
        let plaintext = group::decrypt(group, MessageType::Chat, ciphertext).ok()?;
        let payload = codec::decode_chat(&plaintext)?;
        push_capped(
            &mut self.messages,
            ChatMessage {
                id: crate::types::message_key(&sender, timestamp),
                sender,
                sender_name: payload.sender_name,
                text: payload.text,
                timestamp,
                is_local: false,
                status: MessageStatus::Sent,
                delivered_to: BTreeSet::new(),
                read_by: BTreeSet::new(),
            },
            self.cap,
        );
        self.messages.last()
    }

    pub fn apply_receipt(&mut self, receipt: &crate::types::Receipt, from: PeerId) -> bool {
        for msg in self.messages.iter_mut() {
            if ReceiptEngine::apply_receipt(msg, receipt, from) {
                return true;
            }
        }
        false
    }
}

fn relay_default_ttl() -> u8 {
    crate::config::MeshConfig::default().max_ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_in_memory_history_at_configured_size() {
        let mut repo = ChatRepository::new(3);
        for i in 0..5u64 {
            let msg = ChatMessage {
                id: i.to_string(),
                sender: PeerId([1u8; 32]),
                sender_name: "a".into(),
                text: "t".into(),
                timestamp: i,
                is_local: false,
                status: MessageStatus::Sent,
                delivered_to: BTreeSet::new(),
                read_by: BTreeSet::new(),
            };
            push_capped(&mut repo.messages, msg, repo.cap);
        }
        assert_eq!(repo.messages.len(), 3);
        assert_eq!(repo.messages[0].id, "2");
    }
}
