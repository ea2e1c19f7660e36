//! Peer-requested transmit throttling.
//!
//! A trusted peer can ask this node to insert a one-shot post-transmit
//! delay or to cap its average throughput. Both requests land in shared
//! atomics; transports call [`RateLimit::rate_limit_tx`] after placing
//! bytes on the wire.
//!
//! Request payloads share [`RATE_LIMIT_REQ_MAGIC`] as their first byte
//! and are distinguished by length: 2 bytes carry `[magic, delay_ms]`,
//! 4 bytes carry `[magic, 0, kbps_lo, kbps_hi]`.

use crate::types::RATE_LIMIT_REQ_MAGIC;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Process-wide rate-limit state.
#[derive(Debug, Default)]
pub struct RateLimit {
    /// One-shot post-transmit delay, consumed by the next send.
    delay_ms: AtomicU32,
    /// Average throughput cap; zero means uncapped.
    throughput_kbps: AtomicU32,
}

impl RateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a RATE_LIMIT_REQ payload. Returns false when malformed.
    pub fn apply_request(&self, payload: &[u8]) -> bool {
        if payload.first() != Some(&RATE_LIMIT_REQ_MAGIC) {
            return false;
        }
        match payload.len() {
            2 => {
                let ms = payload[1] as u32;
                debug!(delay_ms = ms, "rate limit delay requested");
                self.delay_ms.store(ms, Ordering::Relaxed);
                true
            }
            4 => {
                let kbps = u16::from_le_bytes([payload[2], payload[3]]) as u32;
                debug!(kbps, "rate limit throughput requested");
                self.throughput_kbps.store(kbps, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Build the 2-byte one-shot delay request payload.
    pub fn encode_delay_request(delay_ms: u8) -> [u8; 2] {
        [RATE_LIMIT_REQ_MAGIC, delay_ms]
    }

    /// Build the 4-byte throughput cap request payload.
    pub fn encode_throughput_request(kbps: u16) -> [u8; 4] {
        let k = kbps.to_le_bytes();
        [RATE_LIMIT_REQ_MAGIC, 0, k[0], k[1]]
    }

    /// Throttle after a transmission.
    ///
    /// `last_tx` is the instant returned by the previous call on this
    /// link; `bytes_sent` is what just went on the wire. A pending
    /// one-shot delay is consumed; a throughput cap sleeps long enough
    /// that the average rate stays at or below the requested kbps.
    /// Returns the instant to pass to the next call.
    pub async fn rate_limit_tx(&self, last_tx: Option<Instant>, bytes_sent: usize) -> Instant {
        let delay = self.delay_ms.swap(0, Ordering::Relaxed);
        if delay > 0 {
            sleep(Duration::from_millis(delay as u64)).await;
            return Instant::now();
        }

        let kbps = self.throughput_kbps.load(Ordering::Relaxed);
        if kbps > 0 && bytes_sent > 0 {
            if let Some(last) = last_tx {
                // Time this transmission must occupy to stay at the cap.
                let budget = Duration::from_micros(bytes_sent as u64 * 8 * 1000 / kbps as u64);
                let elapsed = last.elapsed();
                if budget > elapsed {
                    sleep(budget - elapsed).await;
                }
            }
        }
        Instant::now()
    }

    /// Clear both limits.
    pub fn reset(&self) {
        self.delay_ms.store(0, Ordering::Relaxed);
        self.throughput_kbps.store(0, Ordering::Relaxed);
    }
}
