//! Error taxonomy for the mesh core, one enum per component boundary.
//!
//! Codec and crypto failures never escape the packet pipeline — callers treat
//! them as silent drops (see [`crate::relay`]). Transport failures are the
//! only kind expected to reach a UI layer.

use thiserror::Error;

/// Failures while framing or parsing the wire format (§ packet codec).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("length field {field} claims {claimed} bytes but only {available} remain")]
    TruncatedField {
        field: &'static str,
        claimed: usize,
        available: usize,
    },
    #[error("payload length {0} exceeds the 512 byte cap")]
    PayloadTooLarge(usize),
    #[error("payload failed to decode as its declared type")]
    MalformedPayload,
}

/// Failures in the group AEAD / signature / key-derivation layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no active group; encryption unavailable")]
    NoActiveGroup,
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
    #[error("signature verification failed")]
    BadSignature,
    #[error("join code is not valid base32")]
    InvalidJoinCode,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Failures delivering bytes over the BLE transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE adapter unavailable or permission denied")]
    Unavailable,
    #[error("no route to peer")]
    NoRoute,
    #[error("write to peer failed: {0}")]
    WriteFailed(String),
    #[error("a send is already in flight")]
    AlreadySending,
}

/// Programming-bug class errors: calling an operation before its
/// preconditions hold. These are not attacker-reachable.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("identity has not been initialized")]
    NotInitialized,
    #[error("component has been disposed")]
    Disposed,
}

/// Keystore or filesystem failures. Reads degrade to empty/None; writes are
/// logged and retried on the next event rather than propagated.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keystore I/O failed: {0}")]
    Keystore(String),
    #[error("filesystem I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}
