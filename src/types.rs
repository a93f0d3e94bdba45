//! Core wire-adjacent types shared across the mesh: peer identity, the
//! packet envelope, payload enumerations, and chat message state.
//!
//! # Security Properties
//! - [`PeerId`] is a hash of a static DH public key; it carries no secret
//!   material and is safe to gossip.
//! - [`PacketId`] is the dedup key and intentionally excludes the mutable
//!   TTL field so relays agree on identity regardless of hop count.
//!
//! # Memory Budget
//! Every collection keyed by these types is bounded by [`crate::config::MeshConfig`]
//! (dedup cache, trusted-peer set, in-memory message lists) — nothing here
//! grows without an explicit cap enforced by its owning component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 32-byte peer identifier derived from a BLAKE2b hash of the owner's static
/// Diffie-Hellman public key. All-zero denotes broadcast.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub const BROADCAST: PeerId = PeerId([0u8; 32]);

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PeerId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid peer id hex"))
    }
}

/// Packet-level type tag, also doubles as AEAD additional authenticated
/// data ([`crate::group::MessageType`]) for every type that gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Chat = 1,
    Location = 2,
    Emergency = 3,
    Ack = 4,
    NoiseEncrypted = 5,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Chat),
            2 => Some(Self::Location),
            3 => Some(Self::Emergency),
            4 => Some(Self::Ack),
            5 => Some(Self::NoiseEncrypted),
            _ => None,
        }
    }
}

pub const CURRENT_VERSION: u8 = 1;
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Fixed header size before the variable signature and payload sections:
/// version(1) + type(1) + ttl(1) + timestamp(8) + flags(2) + sourceId(32)
/// + destId(32) + signatureLen(2) + payloadLen(2).
pub const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 8 + 2 + 32 + 32 + 2 + 2;

/// A framed packet as it travels the mesh. `payload` is the raw (possibly
/// still group-ciphertext) bytes; decoding into a concrete payload type is a
/// separate step performed after signature/dedup/TTL checks.
#[derive(Debug, Clone)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp: u64,
    pub flags: u16,
    pub source_id: PeerId,
    pub dest_id: PeerId,
    pub signature: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// The field set a signature covers: everything except the mutable TTL.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.payload.len());
        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.source_id.0);
        buf.extend_from_slice(&self.dest_id.0);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn packet_id(&self) -> PacketId {
        PacketId {
            source_id: self.source_id,
            timestamp: self.timestamp,
            packet_type: self.packet_type,
            flags: self.flags,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_id.is_broadcast()
    }
}

/// Dedup key: identical across every relay hop since it excludes TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub source_id: PeerId,
    pub timestamp: u64,
    pub packet_type: PacketType,
    pub flags: u16,
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.source_id, self.timestamp, self.packet_type as u8, self.flags
        )
    }
}

/// The key senders use to track outbound messages for receipt matching.
/// Deliberately excludes `flags` so it stays stable even as the flags field
/// gains bits across protocol revisions.
pub fn message_key(source_id: &PeerId, timestamp: u64) -> String {
    format!("{}:{}", source_id, timestamp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    Sos = 0,
    Medical = 1,
    Lost = 2,
    Danger = 3,
}

impl AlertType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Sos),
            1 => Some(Self::Medical),
            2 => Some(Self::Lost),
            3 => Some(Self::Danger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f32,
    pub altitude: f32,
    pub speed: f32,
    pub bearing: f32,
}

impl LocationUpdate {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
            && self.accuracy.is_finite()
            && self.altitude.is_finite()
            && self.speed.is_finite()
            && self.bearing.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPayload {
    pub sender_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyPayload {
    pub alert_type: AlertType,
    pub lat: f64,
    pub lon: f64,
    pub message: String,
}

impl EmergencyPayload {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.lat.abs() <= 90.0 && self.lon.abs() <= 180.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    Delivered = 1,
    Read = 2,
}

impl ReceiptType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub receipt_type: ReceiptType,
    pub original_timestamp: u64,
    pub original_sender_id: PeerId,
}

/// Delivery/read status of a chat message. Advances monotonically and never
/// regresses once observed at a later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: PeerId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: u64,
    pub is_local: bool,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
    #[serde(default)]
    pub delivered_to: BTreeSet<PeerId>,
    #[serde(default)]
    pub read_by: BTreeSet<PeerId>,
}

fn default_status() -> MessageStatus {
    MessageStatus::Sent
}

impl ChatMessage {
    /// Advances `status` forward only — never regresses a later status.
    pub fn advance_status(&mut self, new: MessageStatus) {
        if new > self.status {
            self.status = new;
        }
    }
}
