//! Feature repositories: Chat, Location, Emergency (§ feature repositories).
//!
//! Each repository exposes a `send`/`broadcast_once` path that group-encrypts
//! and frames an outbound payload, and a `receive` path that group-decrypts
//! and decodes an inbound one. Neither path reads from
//! [`crate::relay::MeshRelay`] directly — [`crate::controller::MeshController`]
//! owns the inbound demux and calls into whichever repository a packet's
//! type routes to.

pub mod chat;
pub mod emergency;
pub mod location;

/// Pushes `item` onto `list`, evicting the oldest entry once `cap` is
/// reached. Shared by chat and emergency history, which both bound memory
/// under sustained floods the same way.
pub(crate) fn push_capped<T>(list: &mut Vec<T>, item: T, cap: usize) {
    if list.len() >= cap {
        list.remove(0);
    }
    list.push(item);
}
