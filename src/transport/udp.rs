//! UDP transport driver
//!
//! Outbound datagrams carry unversioned V0 frames. The driver keeps the
//! periodic ACK contract with the server: ACK_REQUEST is merged into the
//! flag word before framing, and an exhausted countdown closes the socket
//! and forces a fresh DNS resolution on the next send. The optional
//! downlink watchdog reboots the device when no authenticated downlink
//! arrives within its window.

use anyhow::Result;
use async_trait::async_trait;
use epacket_core::buffer::{PacketBuf, PacketMeta};
use epacket_core::transport::{Interface, InterfaceHandle, Transport};
use epacket_core::types::{InterfaceId, PacketType};
use epacket_core::udp::{AckConfig, AckTracker};
use epacket_core::{Engine, PacketError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

pub struct UdpTransport {
    server: String,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    ack: std::sync::Mutex<AckTracker>,
    enabled: AtomicBool,
    engine: Weak<Engine>,
    weak_self: std::sync::Mutex<Weak<UdpTransport>>,
    handle: std::sync::Mutex<Option<InterfaceHandle>>,
    last_tx: std::sync::Mutex<Option<Instant>>,
}

impl UdpTransport {
    /// Register the interface and resolve the first socket.
    pub async fn spawn(
        engine: &Arc<Engine>,
        server: String,
        ack: AckConfig,
    ) -> Result<Arc<Interface>> {
        let downlink_watchdog = ack.downlink_timeout.is_some();
        let transport = Arc::new(Self {
            server,
            socket: Mutex::new(None),
            ack: std::sync::Mutex::new(AckTracker::new(ack, Instant::now())),
            enabled: AtomicBool::new(true),
            engine: Arc::downgrade(engine),
            weak_self: std::sync::Mutex::new(Weak::new()),
            handle: std::sync::Mutex::new(None),
            last_tx: std::sync::Mutex::new(None),
        });
        *transport.weak_self.lock().unwrap() = Arc::downgrade(&transport);

        let iface = engine.register_interface(transport.clone());
        *transport.handle.lock().unwrap() = Some(iface.handle());

        transport.connect(engine).await?;

        if downlink_watchdog {
            let watched = transport.clone();
            tokio::spawn(async move {
                watched.downlink_watchdog().await;
            });
        }
        Ok(iface)
    }

    /// Resolve the server, bind a fresh socket and start its read task.
    async fn connect(&self, engine: &Arc<Engine>) -> Result<Arc<UdpSocket>, PacketError> {
        let addr = tokio::net::lookup_host(&self.server)
            .await?
            .next()
            .ok_or(PacketError::NotConnected)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let socket = Arc::new(socket);
        info!(server = %self.server, resolved = %addr, "UDP transport connected");

        *self.socket.lock().await = Some(socket.clone());
        self.ack.lock().unwrap().reset(Instant::now());

        if let Some(this) = self.weak_self.lock().unwrap().upgrade() {
            let read_engine = engine.clone();
            let read_socket = socket.clone();
            tokio::spawn(async move {
                this.read_loop(read_engine, read_socket).await;
            });
        }
        Ok(socket)
    }

    async fn read_loop(self: Arc<Self>, engine: Arc<Engine>, socket: Arc<UdpSocket>) {
        let mut datagram = [0u8; 2048];
        loop {
            let n = match socket.recv(&mut datagram).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "UDP receive failed");
                    return;
                }
            };
            // A replaced socket retires this task.
            let current = self.socket.lock().await.clone();
            if !current.is_some_and(|s| Arc::ptr_eq(&s, &socket)) {
                return;
            }
            if !self.enabled.load(Ordering::Relaxed) {
                continue;
            }
            let Some(mut rx) = engine.rx_pool().try_alloc() else {
                warn!("UDP datagram dropped, RX pool exhausted");
                continue;
            };
            rx.data_mut().extend_from_slice(&datagram[..n]);
            let meta = rx.rx_mut();
            meta.interface = *self.handle.lock().unwrap();
            meta.interface_id = InterfaceId::Udp;
            engine.ingress(rx);
        }
    }

    /// Reboot path of last resort: the server went quiet while the
    /// interface was up.
    async fn downlink_watchdog(self: Arc<Self>) {
        let mut tick = interval(std::time::Duration::from_secs(5));
        loop {
            tick.tick().await;
            let overdue = self.ack.lock().unwrap().downlink_overdue(Instant::now());
            if overdue && self.socket.lock().await.is_some() {
                error!("no authenticated downlink within the watchdog window, rebooting");
                std::process::exit(1);
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn interface_id(&self) -> InterfaceId {
        InterfaceId::Udp
    }

    fn prepare_tx(&self, buf: &mut PacketBuf) {
        if let PacketMeta::Tx(meta) = buf.meta_mut() {
            meta.flags |= self.ack.lock().unwrap().tx_flags(Instant::now());
        }
    }

    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError> {
        // A stale link forces a close and a fresh DNS resolution.
        if self.ack.lock().unwrap().link_stale() {
            warn!("UDP ACK countdown exhausted, reconnecting");
            *self.socket.lock().await = None;
        }

        let socket = match self.socket.lock().await.clone() {
            Some(socket) => socket,
            None => {
                let engine = self.engine.upgrade().ok_or(PacketError::NotConnected)?;
                self.connect(&engine).await?
            }
        };

        socket.send(buf.data()).await?;

        if let Some(engine) = self.engine.upgrade() {
            let last = *self.last_tx.lock().unwrap();
            let now = engine
                .rate_limit()
                .rate_limit_tx(last, buf.data().len())
                .await;
            *self.last_tx.lock().unwrap() = Some(now);
        }
        Ok(())
    }

    async fn receive_ctrl(&self, enable: bool) -> Result<(), PacketError> {
        self.enabled.store(enable, Ordering::Relaxed);
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        match self.engine.upgrade() {
            Some(engine) => Some(engine.config().buffer_size),
            None => Some(0),
        }
    }

    fn decrypt_result(&self, buf: &PacketBuf, result: &Result<(), PacketError>) {
        if result.is_err() {
            return;
        }
        let mut ack = self.ack.lock().unwrap();
        ack.downlink_received(Instant::now());
        if buf.rx().packet_type == PacketType::Ack {
            ack.ack_received();
        }
    }
}
