//! Passphrase-derived group cryptosystem: key derivation, join codes, and
//! AEAD encrypt/decrypt bound to a message-type AAD tag.
//!
//! Grounded on the teacher's `net/encrypted.rs` chunked-AEAD session, here
//! collapsed to single-shot encrypt/decrypt since mesh packets are already
//! bounded to 512 bytes and need no chunking.

use crate::config::Argon2Params;
use crate::error::CryptoError;
use crate::types::PacketType;
use argon2::{Argon2, Params, Version};
use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use data_encoding::BASE32_NOPAD;
use tracing::{info, warn};
use zeroize::Zeroize;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Bytes an encrypted blob carries beyond its plaintext: `nonce || tag`.
/// Per-type codec encoders must reserve this much headroom under
/// [`crate::types::MAX_PAYLOAD_LEN`] so the framed ciphertext never overflows.
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
const GROUP_ID_CONTEXT: &[u8] = b"fluxon-group-id:";

/// AEAD additional authenticated data tag. Mirrors [`PacketType`] exactly —
/// every packet type that gets group-encrypted carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Chat = 1,
    Location = 2,
    Emergency = 3,
    Ack = 4,
    NoiseEncrypted = 5,
}

impl From<PacketType> for MessageType {
    fn from(t: PacketType) -> Self {
        match t {
            PacketType::Chat => MessageType::Chat,
            PacketType::Location => MessageType::Location,
            PacketType::Emergency => MessageType::Emergency,
            PacketType::Ack => MessageType::Ack,
            PacketType::NoiseEncrypted => MessageType::NoiseEncrypted,
        }
    }
}

/// Key material for one group. Zeroized when dropped or replaced.
pub struct FluxonGroup {
    pub group_id: String,
    pub name: String,
    key: [u8; KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

impl Drop for FluxonGroup {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl FluxonGroup {
    pub fn group_id_for(passphrase: &str, salt: &[u8; SALT_LEN]) -> String {
        let mut hasher = Blake2b512::new();
        hasher.update(GROUP_ID_CONTEXT);
        hasher.update(passphrase.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// 26-character RFC 4648 base32 join code for a 16-byte salt.
pub fn encode_salt(salt: &[u8; SALT_LEN]) -> String {
    BASE32_NOPAD.encode(salt)
}

pub fn decode_salt(code: &str) -> Result<[u8; SALT_LEN], CryptoError> {
    let normalized = code.trim().to_ascii_uppercase();
    let bytes = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| CryptoError::InvalidJoinCode)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidJoinCode)
}

/// Derives a 32-byte group key from a passphrase and salt via Argon2id.
/// Callers on a UI thread should run this on a worker — it is intentionally
/// expensive.
pub fn derive_group_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    params: &Argon2Params,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let argon_params = Params::new(params.mem_cost_kib, params.time_cost, params.parallelism, Some(KEY_LEN))
        .map_err(|_| CryptoError::KeyDerivation)?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

pub fn create_group(
    name: String,
    passphrase: &str,
    params: &Argon2Params,
) -> Result<FluxonGroup, CryptoError> {
    let salt = generate_salt();
    join_group(name, passphrase, &salt, params)
}

pub fn join_group(
    name: String,
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    params: &Argon2Params,
) -> Result<FluxonGroup, CryptoError> {
    let key = derive_group_key(passphrase, salt, params)?;
    let group_id = FluxonGroup::group_id_for(passphrase, salt);
    info!(%group_id, "group key derived");
    Ok(FluxonGroup { group_id, name, key, salt: *salt })
}

/// Encrypts `plaintext` under the active group's key with `message_type` as
/// AAD. Output layout is `nonce || ciphertext || tag`. Returns `None` (no
/// group active) when `group` is `None`.
pub fn encrypt(
    group: Option<&FluxonGroup>,
    message_type: MessageType,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let group = group.ok_or(CryptoError::NoActiveGroup)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&group.key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad: &[message_type as u8] })
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce || ciphertext || tag` blob, verifying `message_type`
/// as AAD. A ciphertext encrypted under one type never decrypts under
/// another.
pub fn decrypt(
    group: Option<&FluxonGroup>,
    message_type: MessageType,
    blob: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let group = group.ok_or(CryptoError::NoActiveGroup)?;
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&group.key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ciphertext, aad: &[message_type as u8] })
        .map_err(|_| {
            warn!(%group.group_id, "group decrypt failed");
            CryptoError::AuthenticationFailed
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> Argon2Params {
        // Cheap parameters so unit tests don't pay the mobile-grade cost.
        Argon2Params { mem_cost_kib: 8, time_cost: 1, parallelism: 1 }
    }

    #[test]
    fn same_passphrase_and_salt_derive_same_group_id() {
        let salt = [7u8; SALT_LEN];
        let a = join_group("g".into(), "trekkers2024", &salt, &test_params()).unwrap();
        let b = join_group("g".into(), "trekkers2024", &salt, &test_params()).unwrap();
        assert_eq!(a.group_id, b.group_id);
    }

    #[test]
    fn aad_binds_ciphertext_to_message_type() {
        let salt = generate_salt();
        let group = join_group("g".into(), "pass", &salt, &test_params()).unwrap();
        let blob = encrypt(Some(&group), MessageType::Chat, b"hello").unwrap();
        assert!(decrypt(Some(&group), MessageType::Location, &blob).is_err());
        assert_eq!(decrypt(Some(&group), MessageType::Chat, &blob).unwrap(), b"hello");
    }

    #[test]
    fn nonces_are_unique_across_calls() {
        let salt = generate_salt();
        let group = join_group("g".into(), "pass", &salt, &test_params()).unwrap();
        let a = encrypt(Some(&group), MessageType::Chat, b"x").unwrap();
        let b = encrypt(Some(&group), MessageType::Chat, b"x").unwrap();
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
    }

    #[test]
    fn join_code_round_trips() {
        let salt = generate_salt();
        let code = encode_salt(&salt);
        assert_eq!(code.len(), 26);
        let decoded = decode_salt(&code).unwrap();
        assert_eq!(decoded, salt);
    }

    #[test]
    fn no_group_returns_error_not_plaintext() {
        assert!(encrypt(None, MessageType::Chat, b"x").is_err());
        assert!(decrypt(None, MessageType::Chat, b"x").is_err());
    }
}
