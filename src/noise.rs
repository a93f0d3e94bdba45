//! Interface-only Noise-XX session for unicast 1:1 end-to-end encryption.
//!
//! Out of scope for this crate beyond the contract: a real implementation
//! (e.g. backed by `snow`) is injected by the host app. Traffic carried
//! this way is tagged [`crate::types::PacketType::NoiseEncrypted`] so the
//! relay engine routes it past the group cipher entirely.

use crate::types::PeerId;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error("no established session with peer")]
    NoSession,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

#[async_trait]
pub trait NoiseSession: Send + Sync {
    async fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError>;
    async fn decrypt(&self, peer: PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError>;
    fn has_session(&self, peer: PeerId) -> bool;
}
