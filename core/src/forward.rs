//! Forwarding engine: relay payloads from the backhaul to a named remote,
//! optionally establishing an outbound Bluetooth connection first.
//!
//! FORWARD packets are relayed inline on the pipeline task. A
//! FORWARD_AUTO_CONN packet becomes a job for the engine's own task,
//! which may block on connection setup. The concrete Bluetooth central
//! sits behind [`ConnectionOps`].
//!
//! Request layout, little-endian, payload follows the header:
//! ```text
//! FORWARD:           [ interface u8 ][ bt address 7 ][ length u16 ]
//! FORWARD_AUTO_CONN: ... plus [ conn_timeout u16 ][ idle_timeout u16 ]
//!                             [ absolute_timeout u16 ][ flags u8 ]
//! ```
//! Timeouts are in seconds; zero disables the corresponding timer.

use crate::buffer::PacketBuf;
use crate::error::PacketError;
use crate::handlers::DefaultHandler;
use crate::pipeline::Engine;
use crate::ratelimit::RateLimit;
use crate::transport::{
    CallbackId, InterfaceCallbacks, InterfaceHandle, ReceiveHandler,
};
use crate::types::{Auth, BtAddr, Destination, InterfaceAddress, InterfaceId, PacketType, Wait};
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Flag bits of a FORWARD_AUTO_CONN request.
pub mod conn_flags {
    /// Subscribe to the remote data notification characteristic.
    pub const SUB_DATA: u8 = 0x01;
    /// Disconnect after the first RPC_RSP on this connection.
    pub const SINGLE_RPC: u8 = 0x02;
    /// Emit CONN_TERMINATED on the backhaul when the connection ends.
    pub const DC_NOTIFICATION: u8 = 0x04;
    /// Hold HIGH_PRIORITY_UPLINK while traffic flows on this connection.
    pub const PRIORITISE_UPLINK: u8 = 0x08;
}

/// Disconnect reason codes carried in CONN_TERMINATED payloads, in the
/// same space as [`PacketError::wire_code`].
pub mod reason {
    pub const SINGLE_RPC_DONE: u8 = 0x20;
    pub const IDLE_TIMEOUT: u8 = 0x21;
    pub const ABSOLUTE_TIMEOUT: u8 = 0x22;
    pub const LINK_LOST: u8 = 0x23;
}

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    SecurityRead,
    Subscribing,
    Ready,
    Disconnecting,
    Terminated,
}

/// Events driving [`ConnState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    ConnectRequested,
    Connected,
    SecurityDone,
    Subscribed,
    IdleTimeout,
    AbsoluteTimeout,
    SingleRpcDone,
    Failed,
    DisconnectDone,
}

impl ConnState {
    /// Next state for an event, or `None` when the transition is invalid.
    pub fn next(self, event: ConnEvent) -> Option<ConnState> {
        use ConnEvent::*;
        use ConnState::*;

        match (self, event) {
            (Idle, ConnectRequested) => Some(Connecting),
            (Connecting, Connected) => Some(SecurityRead),
            (SecurityRead, SecurityDone) => Some(Subscribing),
            (Subscribing, Subscribed) => Some(Ready),

            (Ready, IdleTimeout) => Some(Disconnecting),
            (Ready, AbsoluteTimeout) => Some(Disconnecting),
            (Ready, SingleRpcDone) => Some(Disconnecting),

            // Establishment failures and link loss go straight down.
            (Connecting | SecurityRead | Subscribing | Ready, Failed) => Some(Terminated),
            (Disconnecting, DisconnectDone) => Some(Terminated),
            (Disconnecting, Failed) => Some(Terminated),

            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnState::Terminated
    }
}

/// Parsed FORWARD header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardRequest {
    pub interface: InterfaceId,
    pub address: BtAddr,
}

impl ForwardRequest {
    pub const WIRE_SIZE: usize = 1 + BtAddr::WIRE_SIZE + 2;

    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if data.len() < Self::WIRE_SIZE {
            return Err(PacketError::InvalidFrame("forward header truncated"));
        }
        let interface = InterfaceId::from_wire(data[0])
            .ok_or(PacketError::InvalidFrame("unknown forward interface"))?;
        let address = BtAddr::read_from(&data[1..])
            .ok_or(PacketError::InvalidFrame("forward address truncated"))?;
        let mut tail = &data[1 + BtAddr::WIRE_SIZE..];
        let length = tail.get_u16_le() as usize;
        if tail.len() < length {
            return Err(PacketError::InvalidFrame("forward payload truncated"));
        }
        Ok((Self { interface, address }, &tail[..length]))
    }

    /// Build a FORWARD payload (producer side).
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE + payload.len());
        out.put_u8(self.interface.to_wire());
        self.address.write_to(&mut out);
        out.put_u16_le(payload.len() as u16);
        out.put_slice(payload);
        out
    }
}

/// Parsed FORWARD_AUTO_CONN header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoConnRequest {
    pub interface: InterfaceId,
    pub address: BtAddr,
    /// Connection setup timeout, seconds.
    pub conn_timeout: u16,
    /// Inactivity disconnect, seconds; zero disables.
    pub idle_timeout: u16,
    /// Hard connection lifetime, seconds; zero disables.
    pub absolute_timeout: u16,
    pub flags: u8,
}

impl AutoConnRequest {
    pub const WIRE_SIZE: usize = ForwardRequest::WIRE_SIZE + 7;

    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if data.len() < Self::WIRE_SIZE {
            return Err(PacketError::InvalidFrame("auto-conn header truncated"));
        }
        let interface = InterfaceId::from_wire(data[0])
            .ok_or(PacketError::InvalidFrame("unknown forward interface"))?;
        let address = BtAddr::read_from(&data[1..])
            .ok_or(PacketError::InvalidFrame("forward address truncated"))?;
        let mut tail = &data[1 + BtAddr::WIRE_SIZE..];
        let length = tail.get_u16_le() as usize;
        let conn_timeout = tail.get_u16_le();
        let idle_timeout = tail.get_u16_le();
        let absolute_timeout = tail.get_u16_le();
        let flags = tail.get_u8();
        if tail.len() < length {
            return Err(PacketError::InvalidFrame("forward payload truncated"));
        }
        Ok((
            Self {
                interface,
                address,
                conn_timeout,
                idle_timeout,
                absolute_timeout,
                flags,
            },
            &tail[..length],
        ))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE + payload.len());
        out.put_u8(self.interface.to_wire());
        self.address.write_to(&mut out);
        out.put_u16_le(payload.len() as u16);
        out.put_u16_le(self.conn_timeout);
        out.put_u16_le(self.idle_timeout);
        out.put_u16_le(self.absolute_timeout);
        out.put_u8(self.flags);
        out.put_slice(payload);
        out
    }
}

/// Operations the engine needs from the Bluetooth central stack.
///
/// Connections are identified by remote address; the stack keeps its own
/// reference for the lifetime of the link and reports closure through
/// [`ForwardEngine::handle_disconnected`].
#[async_trait]
pub trait ConnectionOps: Send + Sync {
    /// Establish a connection, bounded by `timeout`.
    async fn connect(&self, addr: &BtAddr, timeout: Duration) -> Result<(), PacketError>;
    /// Read the link security level after connecting.
    async fn read_security(&self, addr: &BtAddr) -> Result<(), PacketError>;
    /// Subscribe to the remote data notification characteristic.
    async fn subscribe_data(&self, addr: &BtAddr) -> Result<(), PacketError>;
    /// Begin a graceful disconnect.
    async fn disconnect(&self, addr: &BtAddr) -> Result<(), PacketError>;
}

/// Forwarding engine configuration.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Interface CONN_TERMINATED notifications are reported on.
    pub backhaul: InterfaceHandle,
    /// Bounded wait for a TX buffer when relaying a payload.
    pub alloc_wait: Duration,
    /// Sliding HIGH_PRIORITY_UPLINK window for PRIORITISE_UPLINK links.
    pub uplink_window: Duration,
    /// Persisted Bluetooth throughput limit sent to every new remote.
    pub throughput_limit_kbps: Option<u16>,
    /// Depth of the auto-connect job queue.
    pub jobs_depth: usize,
}

impl ForwardConfig {
    pub fn new(backhaul: InterfaceHandle) -> Self {
        Self {
            backhaul,
            alloc_wait: Duration::from_millis(100),
            uplink_window: Duration::from_secs(2),
            throughput_limit_kbps: None,
            jobs_depth: 8,
        }
    }
}

struct ConnEntry {
    state: ConnState,
    flags: u8,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    absolute_deadline: Option<Instant>,
    callback: Option<(InterfaceHandle, CallbackId)>,
    timer: Option<JoinHandle<()>>,
}

/// The auto-connect forwarding engine. One per gateway, with its own
/// processing task ([`ForwardEngine::run`]).
pub struct ForwardEngine {
    config: ForwardConfig,
    ops: Arc<dyn ConnectionOps>,
    jobs_sender: mpsc::Sender<PacketBuf>,
    jobs_receiver: Mutex<Option<mpsc::Receiver<PacketBuf>>>,
    conns: Mutex<HashMap<BtAddr, ConnEntry>>,
}

impl ForwardEngine {
    pub fn new(config: ForwardConfig, ops: Arc<dyn ConnectionOps>) -> Arc<Self> {
        let (jobs_sender, jobs_receiver) = mpsc::channel(config.jobs_depth.max(1));
        Arc::new(Self {
            config,
            ops,
            jobs_sender,
            jobs_receiver: Mutex::new(Some(jobs_receiver)),
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Queue a FORWARD_AUTO_CONN packet for the engine task.
    pub fn submit(&self, buf: PacketBuf) {
        if self.jobs_sender.try_send(buf).is_err() {
            warn!("auto-connect queue full, forward job dropped");
        }
    }

    /// Current state of the connection to `addr`, if tracked.
    pub fn conn_state(&self, addr: &BtAddr) -> Option<ConnState> {
        self.conns.lock().unwrap().get(addr).map(|e| e.state)
    }

    /// Engine task: pull auto-connect jobs and execute them. May block on
    /// connection setup; nothing else runs on this task.
    pub async fn run(self: &Arc<Self>, engine: Arc<Engine>) {
        let Some(mut jobs) = self.jobs_receiver.lock().unwrap().take() else {
            warn!("forward engine already running");
            return;
        };
        while let Some(buf) = jobs.recv().await {
            self.handle_auto_conn(&engine, buf).await;
        }
    }

    /// Relay a FORWARD payload without connection management.
    pub async fn forward_direct(&self, engine: &Arc<Engine>, buf: PacketBuf) {
        if !matches!(buf.rx().auth, Auth::Device | Auth::Network) {
            warn!("forward request without device or network auth rejected");
            return;
        }
        let (request, payload) = match ForwardRequest::parse(buf.data()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "malformed forward request dropped");
                return;
            }
        };
        if let Err(err) = self
            .relay_payload(engine, request.interface, &request.address, payload)
            .await
        {
            debug!(error = %err, address = %request.address, "forward discarded");
        }
    }

    async fn handle_auto_conn(self: &Arc<Self>, engine: &Arc<Engine>, buf: PacketBuf) {
        if !matches!(buf.rx().auth, Auth::Device | Auth::Network) {
            warn!("auto-connect request without device or network auth rejected");
            return;
        }
        let (request, payload) = match AutoConnRequest::parse(buf.data()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "malformed auto-connect request dropped");
                return;
            }
        };
        let addr = request.address;

        let reuse = match self.conns.lock().unwrap().get(&addr).map(|e| e.state) {
            Some(ConnState::Ready) => true,
            Some(_) => {
                // A half-dead entry cannot be reused.
                self.remove_entry(engine, &addr);
                false
            }
            None => false,
        };

        if reuse {
            self.touch(&addr);
        } else if let Err(err) = self.establish(engine, &request).await {
            warn!(address = %addr, error = %err, "auto-connect establishment failed");
            if request.flags & conn_flags::DC_NOTIFICATION != 0 {
                self.emit_conn_terminated(engine, &addr, err.wire_code());
            }
            self.conns.lock().unwrap().remove(&addr);
            return;
        }

        if let Err(err) = self
            .relay_payload(engine, request.interface, &addr, payload)
            .await
        {
            debug!(error = %err, address = %addr, "auto-connect forward discarded");
            if request.flags & conn_flags::DC_NOTIFICATION != 0 {
                self.emit_conn_terminated(engine, &addr, err.wire_code());
            }
        }
    }

    /// Walk a fresh connection to READY.
    async fn establish(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        request: &AutoConnRequest,
    ) -> Result<(), PacketError> {
        let addr = request.address;
        let now = Instant::now();
        let idle_timeout = match request.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        };
        let absolute_deadline = match request.absolute_timeout {
            0 => None,
            secs => Some(now + Duration::from_secs(secs as u64)),
        };
        self.conns.lock().unwrap().insert(
            addr,
            ConnEntry {
                state: ConnState::Connecting,
                flags: request.flags,
                idle_timeout,
                idle_deadline: idle_timeout.map(|t| now + t),
                absolute_deadline,
                callback: None,
                timer: None,
            },
        );

        info!(address = %addr, "establishing auto-connect link");
        let timeout = Duration::from_secs(request.conn_timeout.max(1) as u64);
        self.ops.connect(&addr, timeout).await?;

        self.transition(&addr, ConnEvent::Connected);
        self.ops.read_security(&addr).await?;
        self.transition(&addr, ConnEvent::SecurityDone);

        if request.flags & conn_flags::SUB_DATA != 0 {
            self.ops.subscribe_data(&addr).await?;
        }
        self.transition(&addr, ConnEvent::Subscribed);

        // Watch the link for RPC responses and uplink activity.
        if let Some(iface) = engine.interface_by_id(request.interface) {
            let hook = self.packet_hook(engine, addr);
            let id = iface.register_callbacks(Arc::new(InterfaceCallbacks {
                packet_received: Some(hook),
                ..Default::default()
            }));
            if let Some(entry) = self.conns.lock().unwrap().get_mut(&addr) {
                entry.callback = Some((iface.handle(), id));
            }
        }

        // Start the idle and absolute timers, then drop our setup
        // reference; the stack holds its own for the link lifetime.
        if idle_timeout.is_some() || absolute_deadline.is_some() {
            let fwd = self.clone();
            let engine = engine.clone();
            let timer = tokio::spawn(async move {
                fwd.timer_loop(engine, addr).await;
            });
            if let Some(entry) = self.conns.lock().unwrap().get_mut(&addr) {
                entry.timer = Some(timer);
            }
        }

        if request.flags & conn_flags::PRIORITISE_UPLINK != 0 {
            engine
                .app_state()
                .refresh_high_priority_uplink(self.config.uplink_window);
        }

        // A persisted throughput limit applies to every new remote.
        if let Some(kbps) = self.config.throughput_limit_kbps {
            self.send_throughput_limit(engine, request.interface, &addr, kbps);
        }
        Ok(())
    }

    /// Per-connection RX hook: single-RPC teardown and uplink priority.
    ///
    /// Holds the engine weakly; the callback lives inside the engine's
    /// interface table and must not keep it alive.
    fn packet_hook(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        addr: BtAddr,
    ) -> Box<dyn Fn(&PacketBuf, bool) -> bool + Send + Sync> {
        let fwd = self.clone();
        let engine = Arc::downgrade(engine);
        Box::new(move |buf, decrypted| {
            let Some(engine) = engine.upgrade() else {
                return true;
            };
            if !decrypted || buf.rx().address != InterfaceAddress::Bt(addr) {
                return true;
            }
            let flags = {
                let mut conns = fwd.conns.lock().unwrap();
                let Some(entry) = conns.get_mut(&addr) else {
                    return true;
                };
                if let Some(timeout) = entry.idle_timeout {
                    entry.idle_deadline = Some(Instant::now() + timeout);
                }
                entry.flags
            };
            if flags & conn_flags::PRIORITISE_UPLINK != 0 {
                engine
                    .app_state()
                    .refresh_high_priority_uplink(fwd.config.uplink_window);
            }
            if flags & conn_flags::SINGLE_RPC != 0
                && buf.rx().packet_type == PacketType::RpcRsp
            {
                debug!(address = %addr, "single-RPC response seen, disconnecting");
                let fwd = fwd.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    fwd.initiate_disconnect(&engine, addr, ConnEvent::SingleRpcDone).await;
                });
            }
            true
        })
    }

    /// Refresh the inactivity deadline on a reused connection.
    fn touch(&self, addr: &BtAddr) {
        let mut conns = self.conns.lock().unwrap();
        if let Some(entry) = conns.get_mut(addr) {
            if let Some(timeout) = entry.idle_timeout {
                entry.idle_deadline = Some(Instant::now() + timeout);
            }
        }
    }

    fn transition(&self, addr: &BtAddr, event: ConnEvent) {
        let mut conns = self.conns.lock().unwrap();
        if let Some(entry) = conns.get_mut(addr) {
            match entry.state.next(event) {
                Some(next) => entry.state = next,
                None => debug!(
                    address = %addr,
                    state = ?entry.state,
                    event = ?event,
                    "ignoring invalid connection transition"
                ),
            }
        }
    }

    /// Idle/absolute timer for one connection.
    async fn timer_loop(self: Arc<Self>, engine: Arc<Engine>, addr: BtAddr) {
        loop {
            let (idle, absolute, state) = {
                let conns = self.conns.lock().unwrap();
                let Some(entry) = conns.get(&addr) else {
                    return;
                };
                (entry.idle_deadline, entry.absolute_deadline, entry.state)
            };
            if state != ConnState::Ready {
                return;
            }
            let next = match (idle, absolute) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => return,
            };
            let now = Instant::now();
            if now >= next {
                let event = match absolute {
                    Some(deadline) if now >= deadline => ConnEvent::AbsoluteTimeout,
                    _ => ConnEvent::IdleTimeout,
                };
                self.initiate_disconnect(&engine, addr, event).await;
                return;
            }
            tokio::time::sleep_until(next).await;
        }
    }

    /// Begin a graceful teardown for `event` and finish the bookkeeping.
    async fn initiate_disconnect(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        addr: BtAddr,
        event: ConnEvent,
    ) {
        {
            let mut conns = self.conns.lock().unwrap();
            let Some(entry) = conns.get_mut(&addr) else {
                return;
            };
            match entry.state.next(event) {
                Some(next) if next == ConnState::Disconnecting => entry.state = next,
                _ => return,
            }
        }
        let _ = self.ops.disconnect(&addr).await;
        let code = match event {
            ConnEvent::SingleRpcDone => reason::SINGLE_RPC_DONE,
            ConnEvent::AbsoluteTimeout => reason::ABSOLUTE_TIMEOUT,
            _ => reason::IDLE_TIMEOUT,
        };
        self.handle_disconnected(engine, &addr, code);
    }

    /// Driver-facing: the link to `addr` closed, for any reason.
    ///
    /// Terminal cleanup: timers and masks are cleared, the RX hook is
    /// removed, and DC_NOTIFICATION connections report upstream.
    pub fn handle_disconnected(&self, engine: &Arc<Engine>, addr: &BtAddr, code: u8) {
        let Some(entry) = self.remove_entry(engine, addr) else {
            return;
        };
        info!(address = %addr, code, "auto-connect link terminated");
        if entry.flags & conn_flags::DC_NOTIFICATION != 0 {
            self.emit_conn_terminated(engine, addr, code);
        }
        if let Some(timer) = entry.timer {
            timer.abort();
        }
    }

    /// Drop an entry and undo its hook and uplink-priority state.
    fn remove_entry(&self, engine: &Arc<Engine>, addr: &BtAddr) -> Option<ConnEntry> {
        let mut entry = self.conns.lock().unwrap().remove(addr)?;
        entry.state = ConnState::Terminated;
        if let Some((iface_handle, id)) = entry.callback.take() {
            if let Some(iface) = engine.interface(iface_handle) {
                iface.unregister_callbacks(id);
            }
        }
        if entry.flags & conn_flags::PRIORITISE_UPLINK != 0 {
            engine.app_state().clear_high_priority_uplink();
        }
        Some(entry)
    }

    /// Copy a payload into a TX buffer and queue it on the destination,
    /// already encrypted by the original sender.
    async fn relay_payload(
        &self,
        engine: &Arc<Engine>,
        interface: InterfaceId,
        addr: &BtAddr,
        payload: &[u8],
    ) -> Result<(), PacketError> {
        let iface = engine
            .interface_by_id(interface)
            .ok_or(PacketError::NotSupported)?;
        match iface.transport().max_packet_size() {
            Some(max) if max < payload.len() => {
                return Err(PacketError::InsufficientPacketSize);
            }
            _ => {}
        }
        let mut tx = engine
            .tx_pool()
            .alloc(Wait::For(self.config.alloc_wait))
            .await
            .ok_or(PacketError::OutOfBuffers)?;
        tx.data_mut().extend_from_slice(payload);
        let meta = tx.tx_mut();
        meta.packet_type = PacketType::Other(0);
        // The embedded frame is already encrypted end-to-end.
        meta.auth = Auth::RemoteEncrypted;
        meta.destination = Destination::Specific(InterfaceAddress::Bt(*addr));
        engine.queue(tx, iface.handle())
    }

    /// CONN_TERMINATED notification on the backhaul: reason code plus the
    /// remote address.
    fn emit_conn_terminated(&self, engine: &Arc<Engine>, addr: &BtAddr, code: u8) {
        let Some(mut buf) = engine.tx_pool().try_alloc() else {
            warn!("CONN_TERMINATED dropped, TX pool exhausted");
            return;
        };
        buf.data_mut().put_u8(code);
        addr.write_to(buf.data_mut());
        let meta = buf.tx_mut();
        meta.packet_type = PacketType::ConnTerminated;
        meta.auth = Auth::Device;
        meta.destination = Destination::AllPeers;
        if engine.queue(buf, self.config.backhaul).is_err() {
            warn!("CONN_TERMINATED dropped, TX queue full");
        }
    }

    /// Ask the new remote to cap its throughput.
    fn send_throughput_limit(
        &self,
        engine: &Arc<Engine>,
        interface: InterfaceId,
        addr: &BtAddr,
        kbps: u16,
    ) {
        let Some(iface) = engine.interface_by_id(interface) else {
            return;
        };
        let Some(mut buf) = engine.tx_pool().try_alloc() else {
            return;
        };
        buf.data_mut()
            .extend_from_slice(&RateLimit::encode_throughput_request(kbps));
        let meta = buf.tx_mut();
        meta.packet_type = PacketType::Other(0);
        meta.auth = Auth::RemoteEncrypted;
        meta.destination = Destination::Specific(InterfaceAddress::Bt(*addr));
        if engine.queue(buf, iface.handle()).is_err() {
            debug!("throughput limit request dropped, TX queue full");
        }
    }
}

/// Receive handler for the backhaul interface: forwarding packets go to
/// the forward engine, everything else to the default handler.
pub struct BackhaulHandler {
    forward: Arc<ForwardEngine>,
    fallback: Arc<DefaultHandler>,
}

impl BackhaulHandler {
    pub fn new(forward: Arc<ForwardEngine>) -> Arc<Self> {
        Arc::new(Self {
            forward,
            fallback: Arc::new(DefaultHandler),
        })
    }
}

#[async_trait]
impl ReceiveHandler for BackhaulHandler {
    async fn handle(self: Arc<Self>, engine: &Arc<Engine>, buf: PacketBuf) {
        if buf.rx().auth == Auth::Failure {
            debug!("dropping unauthenticated backhaul packet");
            return;
        }
        match buf.rx().packet_type {
            PacketType::Forward => self.forward.forward_direct(engine, buf).await,
            PacketType::ForwardAutoConn => self.forward.submit(buf),
            _ => self.fallback.clone().handle(engine, buf).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeyStore;
    use crate::pipeline::EngineConfig;
    use crate::transport::{DummyTransport, Interface};
    use crate::SystemTimeSource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    const REMOTE: BtAddr = BtAddr {
        kind: 0,
        addr: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
    };

    #[test]
    fn test_state_machine_happy_path() {
        let mut state = ConnState::Idle;
        for event in [
            ConnEvent::ConnectRequested,
            ConnEvent::Connected,
            ConnEvent::SecurityDone,
            ConnEvent::Subscribed,
        ] {
            state = state.next(event).expect("valid transition");
        }
        assert_eq!(state, ConnState::Ready);

        let state = state.next(ConnEvent::IdleTimeout).expect("disconnecting");
        assert_eq!(state, ConnState::Disconnecting);
        let state = state.next(ConnEvent::DisconnectDone).expect("terminated");
        assert!(state.is_terminal());
    }

    #[test]
    fn test_state_machine_failure_paths() {
        for state in [
            ConnState::Connecting,
            ConnState::SecurityRead,
            ConnState::Subscribing,
            ConnState::Ready,
        ] {
            assert_eq!(state.next(ConnEvent::Failed), Some(ConnState::Terminated));
        }
        // Terminated is terminal.
        assert_eq!(ConnState::Terminated.next(ConnEvent::Failed), None);
        // Cannot time out a connection that is not ready.
        assert_eq!(ConnState::Connecting.next(ConnEvent::IdleTimeout), None);
    }

    #[test]
    fn test_forward_request_roundtrip() {
        let request = ForwardRequest {
            interface: InterfaceId::BtCentral,
            address: REMOTE,
        };
        let wire = request.encode(b"payload bytes");
        let (parsed, payload) = ForwardRequest::parse(&wire).expect("parse");
        assert_eq!(parsed, request);
        assert_eq!(payload, b"payload bytes");

        for cut in 0..ForwardRequest::WIRE_SIZE {
            assert!(ForwardRequest::parse(&wire[..cut]).is_err());
        }
    }

    #[test]
    fn test_auto_conn_request_roundtrip() {
        let request = AutoConnRequest {
            interface: InterfaceId::BtCentral,
            address: REMOTE,
            conn_timeout: 5,
            idle_timeout: 30,
            absolute_timeout: 300,
            flags: conn_flags::SUB_DATA | conn_flags::DC_NOTIFICATION,
        };
        let wire = request.encode(b"inner frame");
        let (parsed, payload) = AutoConnRequest::parse(&wire).expect("parse");
        assert_eq!(parsed, request);
        assert_eq!(payload, b"inner frame");

        // Truncated payload is rejected.
        assert!(AutoConnRequest::parse(&wire[..wire.len() - 1]).is_err());
    }

    #[derive(Default)]
    struct MockOps {
        calls: Mutex<Vec<&'static str>>,
        fail_connect: AtomicBool,
    }

    impl MockOps {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionOps for MockOps {
        async fn connect(&self, _addr: &BtAddr, _timeout: Duration) -> Result<(), PacketError> {
            self.calls.lock().unwrap().push("connect");
            if self.fail_connect.load(Ordering::Relaxed) {
                return Err(PacketError::NotConnected);
            }
            Ok(())
        }

        async fn read_security(&self, _addr: &BtAddr) -> Result<(), PacketError> {
            self.calls.lock().unwrap().push("read_security");
            Ok(())
        }

        async fn subscribe_data(&self, _addr: &BtAddr) -> Result<(), PacketError> {
            self.calls.lock().unwrap().push("subscribe_data");
            Ok(())
        }

        async fn disconnect(&self, _addr: &BtAddr) -> Result<(), PacketError> {
            self.calls.lock().unwrap().push("disconnect");
            Ok(())
        }
    }

    struct Fixture {
        engine: Arc<Engine>,
        backhaul: Arc<DummyTransport>,
        backhaul_iface: Arc<Interface>,
        dest: Arc<DummyTransport>,
        dest_iface: Arc<Interface>,
        ops: Arc<MockOps>,
        forward: Arc<ForwardEngine>,
    }

    async fn fixture(tweak: impl FnOnce(&mut ForwardConfig)) -> Fixture {
        let engine = Engine::new(
            EngineConfig {
                device_id: 0x10_2030_4050,
                tx_buffers: 8,
                rx_buffers: 8,
                ..Default::default()
            },
            Arc::new(StaticKeyStore::new([8u8; 32], 0x00_13_37)),
            Arc::new(SystemTimeSource),
        );
        let backhaul = Arc::new(DummyTransport::new());
        let backhaul_iface = engine.register_interface(backhaul.clone());
        let dest = Arc::new(DummyTransport::with_id(InterfaceId::BtCentral));
        let dest_iface = engine.register_interface(dest.clone());

        let ops = Arc::new(MockOps::default());
        let mut config = ForwardConfig::new(backhaul_iface.handle());
        tweak(&mut config);
        let forward = ForwardEngine::new(config, ops.clone());
        backhaul_iface.set_receive_handler(BackhaulHandler::new(forward.clone()));

        let runner = engine.clone();
        tokio::spawn(async move { runner.run().await });
        let fwd = forward.clone();
        let fwd_engine = engine.clone();
        tokio::spawn(async move { fwd.run(fwd_engine).await });

        Fixture {
            engine,
            backhaul,
            backhaul_iface,
            dest,
            dest_iface,
            ops,
            forward,
        }
    }

    /// Encrypt a backhaul packet to this node and feed it in.
    async fn inject_backhaul(f: &Fixture, packet_type: PacketType, payload: &[u8]) {
        let codec = f.engine.codec_for(InterfaceId::Dummy);
        let mut tx = f.engine.tx_pool().try_alloc().expect("tx");
        tx.data_mut().extend_from_slice(payload);
        let meta = tx.tx_mut();
        meta.packet_type = packet_type;
        meta.auth = Auth::Device;
        codec.encrypt(&mut tx).await.expect("encrypt");
        let frame = tx.data().to_vec();
        drop(tx);

        let mut rx = f.engine.rx_pool().try_alloc().expect("rx");
        rx.data_mut().extend_from_slice(&frame);
        let meta = rx.rx_mut();
        meta.interface = Some(f.backhaul_iface.handle());
        meta.interface_id = InterfaceId::Dummy;
        f.engine.ingress(rx);
    }

    fn auto_conn(flags: u8, payload: &[u8]) -> Vec<u8> {
        AutoConnRequest {
            interface: InterfaceId::BtCentral,
            address: REMOTE,
            conn_timeout: 2,
            idle_timeout: 300,
            absolute_timeout: 600,
            flags,
        }
        .encode(payload)
    }

    async fn conn_terminated_frames(f: &Fixture) -> Vec<(u8, BtAddr)> {
        let codec = f.engine.codec_for(InterfaceId::Dummy);
        let mut out = Vec::new();
        for frame in f.backhaul.sent_frames() {
            let (header, payload) = codec.decrypt_inspect(&frame).await.expect("decrypt");
            if header.packet_type == PacketType::ConnTerminated.to_wire() {
                let addr = BtAddr::read_from(&payload[1..]).expect("address");
                out.push((payload[0], addr));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_direct_forward_relays_payload() {
        let f = fixture(|_| {}).await;
        let request = ForwardRequest {
            interface: InterfaceId::BtCentral,
            address: REMOTE,
        };
        inject_backhaul(&f, PacketType::Forward, &request.encode(b"relayed frame")).await;

        timeout(Duration::from_secs(1), f.dest.wait_for_sends(1))
            .await
            .expect("payload relayed");
        // Relayed opaque: the bytes hit the wire exactly as embedded.
        assert_eq!(f.dest.sent_frames()[0], b"relayed frame");
        // No connection management for direct forwards.
        assert!(f.ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_conn_establishes_then_forwards() {
        let f = fixture(|_| {}).await;
        inject_backhaul(
            &f,
            PacketType::ForwardAutoConn,
            &auto_conn(conn_flags::SUB_DATA, b"first uplink"),
        )
        .await;

        timeout(Duration::from_secs(1), f.dest.wait_for_sends(1))
            .await
            .expect("payload relayed");
        assert_eq!(f.dest.sent_frames()[0], b"first uplink");
        assert_eq!(f.ops.calls(), vec!["connect", "read_security", "subscribe_data"]);
        assert_eq!(f.forward.conn_state(&REMOTE), Some(ConnState::Ready));

        // A second job reuses the live connection.
        inject_backhaul(
            &f,
            PacketType::ForwardAutoConn,
            &auto_conn(conn_flags::SUB_DATA, b"second uplink"),
        )
        .await;
        timeout(Duration::from_secs(1), f.dest.wait_for_sends(2))
            .await
            .expect("second payload");
        assert_eq!(
            f.ops.calls(),
            vec!["connect", "read_security", "subscribe_data"]
        );
    }

    #[tokio::test]
    async fn test_auto_conn_mtu_too_small_emits_conn_terminated() {
        let f = fixture(|_| {}).await;
        f.dest.set_max_packet(Some(10));

        inject_backhaul(
            &f,
            PacketType::ForwardAutoConn,
            &auto_conn(conn_flags::DC_NOTIFICATION, &[0x55; 20]),
        )
        .await;

        timeout(Duration::from_secs(1), f.backhaul.wait_for_sends(1))
            .await
            .expect("notification");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let notifications = conn_terminated_frames(&f).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0],
            (PacketError::InsufficientPacketSize.wire_code(), REMOTE)
        );
        // The oversize payload never reached the destination.
        assert!(f.dest.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_auto_conn_establishment_failure_notifies() {
        let f = fixture(|_| {}).await;
        f.ops.fail_connect.store(true, Ordering::Relaxed);

        inject_backhaul(
            &f,
            PacketType::ForwardAutoConn,
            &auto_conn(conn_flags::DC_NOTIFICATION, b"never sent"),
        )
        .await;

        timeout(Duration::from_secs(1), f.backhaul.wait_for_sends(1))
            .await
            .expect("notification");
        let notifications = conn_terminated_frames(&f).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0],
            (PacketError::NotConnected.wire_code(), REMOTE)
        );
        assert!(f.dest.sent_frames().is_empty());
        assert_eq!(f.forward.conn_state(&REMOTE), None);
    }

    #[tokio::test]
    async fn test_single_rpc_disconnects_after_response() {
        let f = fixture(|_| {}).await;
        inject_backhaul(
            &f,
            PacketType::ForwardAutoConn,
            &auto_conn(
                conn_flags::SINGLE_RPC | conn_flags::DC_NOTIFICATION,
                b"rpc command",
            ),
        )
        .await;
        timeout(Duration::from_secs(1), f.dest.wait_for_sends(1))
            .await
            .expect("command relayed");

        // The remote answers with an RPC response on the connection.
        let codec = f.engine.codec_for(InterfaceId::BtCentral);
        let mut tx = f.engine.tx_pool().try_alloc().expect("tx");
        tx.data_mut().extend_from_slice(b"rpc result");
        let meta = tx.tx_mut();
        meta.packet_type = PacketType::RpcRsp;
        meta.auth = Auth::Device;
        codec.encrypt(&mut tx).await.expect("encrypt");
        let frame = tx.data().to_vec();
        drop(tx);

        let mut rx = f.engine.rx_pool().try_alloc().expect("rx");
        rx.data_mut().extend_from_slice(&frame);
        let meta = rx.rx_mut();
        meta.interface = Some(f.dest_iface.handle());
        meta.interface_id = InterfaceId::BtCentral;
        meta.address = InterfaceAddress::Bt(REMOTE);
        f.engine.ingress(rx);

        timeout(Duration::from_secs(1), f.backhaul.wait_for_sends(1))
            .await
            .expect("disconnect notification");
        let notifications = conn_terminated_frames(&f).await;
        assert_eq!(notifications, vec![(reason::SINGLE_RPC_DONE, REMOTE)]);
        assert!(f.ops.calls().contains(&"disconnect"));
        assert_eq!(f.forward.conn_state(&REMOTE), None);
    }

    #[tokio::test]
    async fn test_unauthenticated_forward_rejected() {
        let f = fixture(|_| {}).await;
        let request = ForwardRequest {
            interface: InterfaceId::BtCentral,
            address: REMOTE,
        };
        // Deliver the request with a corrupted tag.
        let codec = f.engine.codec_for(InterfaceId::Dummy);
        let mut tx = f.engine.tx_pool().try_alloc().expect("tx");
        tx.data_mut().extend_from_slice(&request.encode(b"payload"));
        let meta = tx.tx_mut();
        meta.packet_type = PacketType::Forward;
        meta.auth = Auth::Device;
        codec.encrypt(&mut tx).await.expect("encrypt");
        let mut frame = tx.data().to_vec();
        drop(tx);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let mut rx = f.engine.rx_pool().try_alloc().expect("rx");
        rx.data_mut().extend_from_slice(&frame);
        let meta = rx.rx_mut();
        meta.interface = Some(f.backhaul_iface.handle());
        meta.interface_id = InterfaceId::Dummy;
        f.engine.ingress(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.dest.sent_frames().is_empty());
        assert!(f.ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_throughput_limit_sent_to_new_remote() {
        let f = fixture(|c| c.throughput_limit_kbps = Some(64)).await;
        inject_backhaul(&f, PacketType::ForwardAutoConn, &auto_conn(0, b"data")).await;

        timeout(Duration::from_secs(1), f.dest.wait_for_sends(2))
            .await
            .expect("limit request and payload");
        let sent = f.dest.sent_frames();
        // The rate-limit request goes out raw ahead of the payload.
        assert!(sent.contains(&RateLimit::encode_throughput_request(64).to_vec()));
        assert!(sent.contains(&b"data".to_vec()));
    }
}
