//! Emergency alert broadcasting with independent rebroadcast passes and
//! exponential-backoff retry on transport failure.
//!
//! The retry state machine is grounded on the teacher's `net/connection.rs`
//! `RetryInfo` (double the delay on failure, capped, reset on success);
//! here the unit of retry is a whole `sendAlert` call rather than a peer
//! connection attempt.

use super::push_capped;
use crate::codec;
use crate::error::TransportError;
use crate::group::{self, FluxonGroup, MessageType};
use crate::identity::Identity;
use crate::relay::MeshRelay;
use crate::transport::Transport;
use crate::types::{AlertType, EmergencyPayload, PacketType, PeerId};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{instrument, warn};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ReceivedAlert {
    pub sender: PeerId,
    pub payload: EmergencyPayload,
    pub timestamp: u64,
}

/// Doubles `next_delay` on failure (capped), resets to the initial delay on
/// success — identical shape to the teacher's peer-connection `RetryInfo`.
struct RetryState {
    attempts: u32,
    next_delay: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self { attempts: 0, next_delay: INITIAL_RETRY_DELAY }
    }

    fn record_failure(&mut self) -> Duration {
        self.attempts += 1;
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(MAX_RETRY_DELAY);
        delay
    }

    fn record_success(&mut self) {
        self.attempts = 0;
        self.next_delay = INITIAL_RETRY_DELAY;
    }

    fn can_retry(&self, max_retries: u32) -> bool {
        self.attempts < max_retries
    }
}

pub struct EmergencyRepository {
    cap: usize,
    rebroadcast_count: u8,
    max_retries: u32,
    alerts: Vec<ReceivedAlert>,
    is_sending: AtomicBool,
    disposed: AtomicBool,
    retry: RetryState,
}

impl EmergencyRepository {
    pub fn new(cap: usize, rebroadcast_count: u8, max_retries: u32) -> Self {
        Self {
            cap,
            rebroadcast_count,
            max_retries,
            alerts: Vec::new(),
            is_sending: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            retry: RetryState::new(),
        }
    }

    pub fn alerts(&self) -> &[ReceivedAlert] {
        &self.alerts
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Encrypts and broadcasts `rebroadcast_count` independent passes, each
    /// with a fresh nonce and timestamp so every peer's dedup cache treats
    /// them as distinct floods. Concurrent calls are rejected outright.
    #[instrument(skip(self, relay, identity, group, now_ms_fn))]
    pub async fn send_alert<T: Transport>(
        &mut self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        alert_type: AlertType,
        lat: f64,
        lon: f64,
        message: String,
        now_ms_fn: impl Fn() -> u64,
    ) -> Result<(), TransportError> {
        if self.is_sending.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadySending);
        }
        let result = self.send_alert_inner(relay, identity, group, alert_type, lat, lon, message, now_ms_fn).await;
        self.is_sending.store(false, Ordering::SeqCst);
        result
    }

    async fn send_alert_inner<T: Transport>(
        &mut self,
        relay: &MeshRelay<T>,
        identity: &Identity,
        group: Option<&FluxonGroup>,
        alert_type: AlertType,
        lat: f64,
        lon: f64,
        message: String,
        now_ms_fn: impl Fn() -> u64,
    ) -> Result<(), TransportError> {
        let self_id = identity.peer_id().map_err(|_| TransportError::Unavailable)?;
        let payload = EmergencyPayload { alert_type, lat, lon, message };

        for pass in 0..self.rebroadcast_count {
            if self.disposed.load(Ordering::SeqCst) {
                return Ok(());
            }
            loop {
                if self.disposed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let plaintext = codec::encode_emergency(&payload);
                let ciphertext = group::encrypt(group, MessageType::Emergency, &plaintext)
                    .map_err(|_| TransportError::Unavailable)?;
                let packet = codec::build_packet(
                    PacketType::Emergency,
                    self_id,
                    PeerId::BROADCAST,
                    crate::config::MeshConfig::default().max_ttl,
                    ciphertext,
                    now_ms_fn(),
                )
                .map_err(|_| TransportError::Unavailable)?;

                match relay.broadcast(packet, identity).await {
                    Ok(()) => {
                        self.retry.record_success();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, pass, "emergency broadcast failed");
                        if !self.retry.can_retry(self.max_retries) {
                            return Err(e);
                        }
                        let delay = self.retry.record_failure();
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            if pass + 1 < self.rebroadcast_count {
                let jitter_ms: u64 = rand::thread_rng().gen_range(100..500);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
        }
        Ok(())
    }

    pub fn receive(&mut self, group: Option<&FluxonGroup>, sender: PeerId, timestamp: u64, ciphertext: &[u8]) -> Option<&ReceivedAlert> {
        let plaintext = group::decrypt(group, MessageType::Emergency, ciphertext).ok()?;
        let payload = codec::decode_emergency(&plaintext)?;
        push_capped(&mut self.alerts, ReceivedAlert { sender, payload, timestamp }, self.cap);
        self.alerts.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_state_doubles_delay_and_resets_on_success() {
        let mut retry = RetryState::new();
        assert_eq!(retry.record_failure(), INITIAL_RETRY_DELAY);
        assert_eq!(retry.record_failure(), INITIAL_RETRY_DELAY * 2);
        retry.record_success();
        assert_eq!(retry.next_delay, INITIAL_RETRY_DELAY);
        assert_eq!(retry.attempts, 0);
    }

    #[test]
    fn retry_state_caps_at_max_delay() {
        let mut retry = RetryState::new();
        for _ in 0..10 {
            retry.record_failure();
        }
        assert!(retry.next_delay <= MAX_RETRY_DELAY);
    }
}
