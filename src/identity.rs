//! Long-term keys and the trusted-peer set (§ identity).
//!
//! Grounded on the teacher's `verified_peers.rs` peer-binding manager: here
//! the binding collapses to a bare LRU membership set since trust is
//! boolean rather than weighted, and eviction policy moves to the `lru`
//! crate to get genuine least-recently-used semantics.

use crate::error::{StateError, StorageError};
use crate::keystore::Keystore;
use crate::types::PeerId;
use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::Zeroize;

const TAG_STATIC_SECRET: &str = "fluxon.identity.static_secret";
const TAG_SIGNING_KEY: &str = "fluxon.identity.signing_key";
const TAG_TRUSTED_PEERS: &str = "fluxon.identity.trusted_peers";

fn peer_id_for(static_public: &XPublicKey) -> PeerId {
    let mut hasher = Blake2b512::new();
    hasher.update(static_public.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    PeerId(out)
}

/// Owns this device's static DH keypair, Ed25519 signing keypair, derived
/// [`PeerId`], and the LRU set of peers the user has explicitly trusted.
pub struct Identity {
    static_secret: Option<StaticSecret>,
    signing_key: Option<SigningKey>,
    peer_id: Option<PeerId>,
    trusted: LruCache<PeerId, ()>,
    trusted_cap: usize,
}

impl Identity {
    pub fn new(trusted_cap: usize) -> Self {
        Self {
            static_secret: None,
            signing_key: None,
            peer_id: None,
            trusted: LruCache::new(NonZeroUsize::new(trusted_cap.max(1)).unwrap()),
            trusted_cap,
        }
    }

    /// Loads persisted keys and trusted set, or generates fresh keys and
    /// persists them if none exist.
    pub async fn initialize(&mut self, keystore: &dyn Keystore) -> Result<(), StorageError> {
        let static_secret = match keystore.read(TAG_STATIC_SECRET).await? {
            Some(bytes) if bytes.len() == 32 => {
                let arr: [u8; 32] = bytes.try_into().unwrap();
                StaticSecret::from(arr)
            }
            _ => {
                let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
                keystore.write(TAG_STATIC_SECRET, secret.to_bytes().to_vec()).await?;
                secret
            }
        };

        let signing_key = match keystore.read(TAG_SIGNING_KEY).await? {
            Some(bytes) if bytes.len() == 32 => {
                let arr: [u8; 32] = bytes.try_into().unwrap();
                SigningKey::from_bytes(&arr)
            }
            _ => {
                let key = SigningKey::generate(&mut rand::rngs::OsRng);
                keystore.write(TAG_SIGNING_KEY, key.to_bytes().to_vec()).await?;
                key
            }
        };

        let public = XPublicKey::from(&static_secret);
        self.peer_id = Some(peer_id_for(&public));

        if let Some(raw) = keystore.read(TAG_TRUSTED_PEERS).await? {
            if let Ok(hex_list) = serde_json::from_slice::<Vec<String>>(&raw) {
                for hex_id in hex_list.into_iter().take(self.trusted_cap) {
                    if let Some(peer) = PeerId::from_hex(&hex_id) {
                        self.trusted.put(peer, ());
                    }
                }
            } else {
                warn!("trusted peer store was unreadable; starting empty");
            }
        }

        self.static_secret = Some(static_secret);
        self.signing_key = Some(signing_key);
        info!(peer_id = %self.peer_id.unwrap(), "identity initialized");
        Ok(())
    }

    pub fn peer_id(&self) -> Result<PeerId, StateError> {
        self.peer_id.ok_or(StateError::NotInitialized)
    }

    pub fn static_public(&self) -> Result<XPublicKey, StateError> {
        self.static_secret
            .as_ref()
            .map(XPublicKey::from)
            .ok_or(StateError::NotInitialized)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, StateError> {
        self.signing_key
            .as_ref()
            .map(|k| k.verifying_key())
            .ok_or(StateError::NotInitialized)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature, StateError> {
        self.signing_key
            .as_ref()
            .map(|k| k.sign(message))
            .ok_or(StateError::NotInitialized)
    }

    pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
        verifying_key.verify(message, signature).is_ok()
    }

    /// Inserts or promotes `peer` to most-recently-used; evicts the least
    /// recently trusted entry if already at capacity.
    pub fn trust_peer(&mut self, peer: PeerId) {
        if self.trusted.put(peer, ()).is_none() {
            debug!(%peer, "peer trusted");
        }
    }

    pub fn is_trusted(&mut self, peer: &PeerId) -> bool {
        self.trusted.get(peer).is_some()
    }

    pub fn revoke_trust(&mut self, peer: &PeerId) {
        self.trusted.pop(peer);
    }

    pub async fn persist_trusted(&self, keystore: &dyn Keystore) -> Result<(), StorageError> {
        let hex_list: Vec<String> = self.trusted.iter().map(|(p, _)| p.to_hex()).collect();
        let bytes = serde_json::to_vec(&hex_list)?;
        keystore.write(TAG_TRUSTED_PEERS, bytes).await
    }

    /// Zeroizes in-memory private key material, clears the trusted set, and
    /// deletes everything persisted for this identity.
    pub async fn reset_identity(&mut self, keystore: &dyn Keystore) -> Result<(), StorageError> {
        if let Some(mut secret_bytes) = self.static_secret.take().map(|s| s.to_bytes()) {
            secret_bytes.zeroize();
        }
        if let Some(mut key_bytes) = self.signing_key.take().map(|k| k.to_bytes()) {
            key_bytes.zeroize();
        }
        self.peer_id = None;
        self.trusted.clear();
        keystore.delete(TAG_STATIC_SECRET).await?;
        keystore.delete(TAG_SIGNING_KEY).await?;
        keystore.delete(TAG_TRUSTED_PEERS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;

    #[tokio::test]
    async fn initialize_derives_a_stable_peer_id() {
        let ks = MemoryKeystore::new();
        let mut id = Identity::new(4);
        id.initialize(&ks).await.unwrap();
        let first = id.peer_id().unwrap();

        let mut id2 = Identity::new(4);
        id2.initialize(&ks).await.unwrap();
        assert_eq!(first, id2.peer_id().unwrap());
    }

    #[tokio::test]
    async fn trusted_set_evicts_lru_at_capacity() {
        let ks = MemoryKeystore::new();
        let mut id = Identity::new(2);
        id.initialize(&ks).await.unwrap();

        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        let c = PeerId([3u8; 32]);
        id.trust_peer(a);
        id.trust_peer(b);
        // touching `a` makes `b` the least recently used
        assert!(id.is_trusted(&a));
        id.trust_peer(c);
        assert!(!id.is_trusted(&b));
        assert!(id.is_trusted(&a));
        assert!(id.is_trusted(&c));
    }
}
