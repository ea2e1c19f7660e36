//! ePacket core engine
//!
//! This crate provides the portable packet-processing engine shared by
//! battery powered devices and their gateways: pooled packet buffers, the
//! authenticated frame codec, the transport contract, the processing
//! pipeline and the gateway/forwarding handlers.
//!
//! Transport drivers (serial ports, UDP sockets, the Bluetooth stack) live
//! outside this crate and plug in through the [`transport::Transport`]
//! trait.

pub mod adv;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod handlers;
pub mod keys;
pub mod pipeline;
pub mod ratelimit;
pub mod serial;
pub mod transport;
pub mod types;
pub mod udp;
pub mod watchdog;

pub use error::PacketError;
pub use pipeline::{Engine, EngineConfig};
pub use types::{Auth, Destination, InterfaceAddress, InterfaceId, PacketType, Wait};

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the epoch timestamp stamped into every frame.
///
/// Production devices feed this from a time-sync collaborator (GPS or
/// network time); the default implementation falls back to system time.
pub trait TimeSource: Send + Sync {
    /// Seconds since the Unix epoch.
    fn epoch_seconds(&self) -> u32;
}

/// [`TimeSource`] backed by the system clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn epoch_seconds(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32
    }
}

/// Seconds per key rotation epoch; key lookup buckets `gps_time` by this.
pub const SECONDS_PER_DAY: u32 = 86_400;
