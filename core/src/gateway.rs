//! Gateway receive handling: wrap downlink packets into RECEIVED_EPACKET
//! frames on the backhaul.
//!
//! Bluetooth-sourced packets are appended to a single outbound backhaul
//! buffer as compact descriptors; everything else falls through to the
//! default handler. Grouping mode accumulates descriptors across a short
//! hold window to cut backhaul overhead.
//!
//! Appendage layout, little-endian:
//! ```text
//! [ 2 bytes: payload length (u15) | auth-failed flag in the top bit ]
//! [ 1 byte : interface kind ]
//! [ 1 byte : rssi magnitude (negative dBm) ]
//! [ 0 or 7 bytes: Bluetooth address (type + 6 bytes) ]
//! [ 17 bytes: decrypted header, only when authenticated:
//!   type, device_id (u40), gps_time, flags, sequence, key_id (u24) ]
//! [ payload ]
//! ```

use crate::buffer::PacketBuf;
use crate::error::PacketError;
use crate::handlers::DefaultHandler;
use crate::pipeline::Engine;
use crate::ratelimit::RateLimit;
use crate::transport::ReceiveHandler;
use crate::types::{Auth, BtAddr, Destination, InterfaceAddress, InterfaceId, PacketType, Wait};
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Top bit of the appendage length word: payload failed authentication
/// and is carried still encrypted.
pub const APPENDAGE_AUTH_FAILED: u16 = 0x8000;

const COMMON_HEADER_SIZE: usize = 4;
const DECRYPTED_HEADER_SIZE: usize = 17;

/// One decoded appendage from a RECEIVED_EPACKET frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub interface_id: InterfaceId,
    pub address: InterfaceAddress,
    pub rssi: i8,
    pub auth_failed: bool,
    /// Present only when the packet authenticated successfully.
    pub header: Option<DecryptedHeader>,
    pub payload: Vec<u8>,
}

/// Frame header fields relayed for an authenticated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptedHeader {
    pub packet_type: u8,
    pub device_id: u64,
    pub gps_time: u32,
    pub flags: u16,
    pub sequence: u16,
    pub key_identifier: u32,
}

/// Bytes one appendage for `rx` will occupy.
pub fn appendage_size(rx: &PacketBuf) -> usize {
    let meta = rx.rx();
    let mut size = COMMON_HEADER_SIZE + meta.address.wire_size() + rx.data().len();
    if meta.auth != Auth::Failure {
        size += DECRYPTED_HEADER_SIZE;
    }
    size
}

/// Append a received packet to the backhaul storage buffer.
///
/// Fails with `OutOfMemory` when the storage buffer lacks tailroom; the
/// caller flushes and retries on a fresh buffer.
pub fn append_packet(storage: &mut PacketBuf, rx: &PacketBuf) -> Result<(), PacketError> {
    if appendage_size(rx) > storage.tailroom() {
        return Err(PacketError::OutOfMemory);
    }
    let meta = rx.rx();
    let authenticated = meta.auth != Auth::Failure;

    let mut len_word = rx.data().len() as u16;
    if !authenticated {
        len_word |= APPENDAGE_AUTH_FAILED;
    }

    let out = storage.data_mut();
    out.put_u16_le(len_word);
    out.put_u8(meta.interface_id.to_wire());
    out.put_u8(meta.rssi.unsigned_abs());
    if let InterfaceAddress::Bt(addr) = meta.address {
        addr.write_to(out);
    }
    if authenticated {
        out.put_u8(meta.packet_type.to_wire());
        out.put_u8((meta.device_id >> 32) as u8);
        out.put_u32_le(meta.device_id as u32);
        out.put_u32_le(meta.gps_time);
        out.put_u16_le(meta.flags);
        out.put_u16_le(meta.sequence);
        let key_id = meta.key_identifier.to_le_bytes();
        out.put_slice(&key_id[..3]);
    }
    out.put_slice(rx.data());
    Ok(())
}

/// Decode every appendage in a RECEIVED_EPACKET payload.
pub fn decode_received(mut data: &[u8]) -> Result<Vec<ReceivedPacket>, PacketError> {
    let mut packets = Vec::new();
    while !data.is_empty() {
        if data.len() < COMMON_HEADER_SIZE {
            return Err(PacketError::InvalidFrame("appendage header truncated"));
        }
        let len_word = data.get_u16_le();
        let auth_failed = len_word & APPENDAGE_AUTH_FAILED != 0;
        let payload_len = (len_word & !APPENDAGE_AUTH_FAILED) as usize;
        let interface_id = InterfaceId::from_wire(data.get_u8())
            .ok_or(PacketError::InvalidFrame("unknown interface kind"))?;
        let rssi_mag = data.get_u8();

        let address = if interface_id.is_bluetooth() {
            let addr = BtAddr::read_from(data)
                .ok_or(PacketError::InvalidFrame("appendage address truncated"))?;
            data.advance(BtAddr::WIRE_SIZE);
            InterfaceAddress::Bt(addr)
        } else {
            InterfaceAddress::Unspecified
        };

        let header = if auth_failed {
            None
        } else {
            if data.len() < DECRYPTED_HEADER_SIZE {
                return Err(PacketError::InvalidFrame("appendage header truncated"));
            }
            let packet_type = data.get_u8();
            let device_upper = data.get_u8();
            let device_lower = data.get_u32_le();
            let gps_time = data.get_u32_le();
            let frame_flags = data.get_u16_le();
            let sequence = data.get_u16_le();
            let mut key_id = [0u8; 4];
            data.copy_to_slice(&mut key_id[..3]);
            Some(DecryptedHeader {
                packet_type,
                device_id: ((device_upper as u64) << 32) | device_lower as u64,
                gps_time,
                flags: frame_flags,
                sequence,
                key_identifier: u32::from_le_bytes(key_id),
            })
        };

        if data.len() < payload_len {
            return Err(PacketError::InvalidFrame("appendage payload truncated"));
        }
        let payload = data[..payload_len].to_vec();
        data.advance(payload_len);

        packets.push(ReceivedPacket {
            interface_id,
            address,
            rssi: -(rssi_mag as i16) as i8,
            auth_failed,
            header,
            payload,
        });
    }
    Ok(packets)
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interface the wrapped packets are reported on.
    pub backhaul: crate::transport::InterfaceHandle,
    /// Grouping hold window; zero flushes every packet immediately.
    pub max_hold: Duration,
    /// Free TX buffers at or below this margin trigger a rate-limit
    /// request to the connected central.
    pub tx_low_water: usize,
    /// Pause requested from the central when backpressured.
    pub backpressure_delay_ms: u8,
}

impl GatewayConfig {
    pub fn new(backhaul: crate::transport::InterfaceHandle) -> Self {
        Self {
            backhaul,
            max_hold: Duration::from_millis(100),
            tx_low_water: 1,
            backpressure_delay_ms: 100,
        }
    }
}

struct Pending {
    storage: Option<PacketBuf>,
    deadline: Option<Instant>,
    hold_task: Option<JoinHandle<()>>,
    /// Bumped on every flush so a stale hold timer cannot flush the
    /// successor buffer.
    epoch: u64,
}

/// Receive handler for gateway mode.
pub struct GatewayHandler {
    config: GatewayConfig,
    pending: Mutex<Pending>,
    last_backpressure: Mutex<Option<Instant>>,
    fallback: Arc<DefaultHandler>,
}

impl GatewayHandler {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Mutex::new(Pending {
                storage: None,
                deadline: None,
                hold_task: None,
                epoch: 0,
            }),
            last_backpressure: Mutex::new(None),
            fallback: Arc::new(DefaultHandler),
        })
    }

    /// Wrap one downlink packet for the backhaul.
    async fn forward_upstream(self: &Arc<Self>, engine: &Arc<Engine>, buf: PacketBuf) {
        let flush_now =
            buf.rx().auth != Auth::Failure && buf.rx().packet_type == PacketType::RpcRsp;

        loop {
            // Append + flush decision are atomic with respect to the hold
            // timer; the lock covers both.
            {
                let mut pending = self.pending.lock().unwrap();
                if let Some(storage) = pending.storage.as_mut() {
                    match append_packet(storage, &buf) {
                        Ok(()) => {
                            if flush_now {
                                // RPC responses must not wait out the
                                // hold window.
                                self.flush_locked(engine, &mut pending);
                            } else {
                                pending.deadline = Some(Instant::now() + self.config.max_hold);
                            }
                            drop(pending);
                            self.check_backpressure(engine, &buf);
                            return;
                        }
                        Err(PacketError::OutOfMemory) => {
                            self.flush_locked(engine, &mut pending);
                        }
                        Err(err) => {
                            warn!(error = %err, "gateway append failed, packet dropped");
                            return;
                        }
                    }
                }
            }

            // No storage buffer pending: start one. Blocking allocation
            // is permitted on the backhaul wrap path.
            let Some(mut storage) = engine.tx_pool().alloc(Wait::Forever).await else {
                return;
            };
            if appendage_size(&buf) > storage.tailroom() {
                warn!("received packet larger than a backhaul buffer, dropped");
                return;
            }
            let meta = storage.tx_mut();
            meta.packet_type = PacketType::ReceivedEpacket;
            meta.auth = Auth::Device;
            meta.destination = Destination::AllPeers;

            let mut pending = self.pending.lock().unwrap();
            if pending.storage.is_none() {
                pending.storage = Some(storage);
                pending.deadline = Some(Instant::now() + self.config.max_hold);
                self.start_hold_timer(engine, &mut pending);
            }
            // Loop back to append under the lock.
        }
    }

    fn flush_locked(&self, engine: &Arc<Engine>, pending: &mut Pending) {
        pending.epoch += 1;
        pending.deadline = None;
        if let Some(storage) = pending.storage.take() {
            if engine.queue(storage, self.config.backhaul).is_err() {
                warn!("backhaul queue full, grouped packets dropped");
            }
        }
    }

    fn start_hold_timer(self: &Arc<Self>, engine: &Arc<Engine>, pending: &mut Pending) {
        let epoch = pending.epoch;
        let handler = self.clone();
        let engine = engine.clone();
        let stale = pending
            .hold_task
            .take()
            .filter(|task| !task.is_finished());
        if let Some(task) = stale {
            task.abort();
        }
        pending.hold_task = Some(tokio::spawn(async move {
            handler.hold_expiry(engine, epoch).await;
        }));
    }

    /// Sleeper behind the grouping hold window. Appends extend the
    /// deadline; a flush retires this epoch.
    async fn hold_expiry(self: Arc<Self>, engine: Arc<Engine>, epoch: u64) {
        loop {
            let deadline = {
                let pending = self.pending.lock().unwrap();
                if pending.epoch != epoch {
                    return;
                }
                match pending.deadline {
                    Some(deadline) => deadline,
                    None => return,
                }
            };
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.epoch == epoch {
            debug!("gateway hold window expired, flushing");
            self.flush_locked(&engine, &mut pending);
        }
    }

    /// Ask the connected central to pause when the TX pool runs low.
    fn check_backpressure(&self, engine: &Arc<Engine>, source: &PacketBuf) {
        if engine.tx_pool().free_count() > self.config.tx_low_water {
            return;
        }
        let delay = Duration::from_millis(self.config.backpressure_delay_ms as u64);
        {
            let mut last = self.last_backpressure.lock().unwrap();
            if matches!(*last, Some(at) if at.elapsed() < delay) {
                return;
            }
            *last = Some(Instant::now());
        }
        let Some(handle) = source.rx().interface else {
            return;
        };
        let Some(mut req) = engine.tx_pool().try_alloc() else {
            debug!("backpressure request skipped, TX pool empty");
            return;
        };
        req.data_mut().extend_from_slice(&RateLimit::encode_delay_request(
            self.config.backpressure_delay_ms,
        ));
        let meta = req.tx_mut();
        meta.packet_type = PacketType::Other(0);
        // Sent raw: the peer parses the magic before decryption.
        meta.auth = Auth::RemoteEncrypted;
        meta.destination = Destination::AllPeers;
        if engine.queue(req, handle).is_err() {
            debug!("backpressure request dropped, TX queue full");
        } else {
            debug!(
                delay_ms = self.config.backpressure_delay_ms,
                "backpressure: requested central pause"
            );
        }
    }
}

#[async_trait]
impl ReceiveHandler for GatewayHandler {
    async fn handle(self: Arc<Self>, engine: &Arc<Engine>, buf: PacketBuf) {
        // A reboot in progress must not create new forwarding work.
        if engine.app_state().is_rebooting() {
            debug!("gateway dropping packet, reboot in progress");
            return;
        }
        if buf.rx().interface_id.is_bluetooth() {
            self.forward_upstream(engine, buf).await;
        } else {
            self.fallback.clone().handle(engine, buf).await;
        }
    }
}
