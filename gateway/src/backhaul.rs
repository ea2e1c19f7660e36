//! UDP backhaul transport for the gateway

use anyhow::Result;
use async_trait::async_trait;
use epacket_core::buffer::PacketBuf;
use epacket_core::transport::{Interface, InterfaceHandle, Transport};
use epacket_core::types::InterfaceId;
use epacket_core::{Engine, PacketError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{info, warn};

pub struct BackhaulTransport {
    socket: Arc<UdpSocket>,
    enabled: AtomicBool,
    handle: Mutex<Option<InterfaceHandle>>,
}

impl BackhaulTransport {
    /// Resolve the server, register the interface, start the read task.
    pub async fn spawn(engine: &Arc<Engine>, server: &str) -> Result<Arc<Interface>> {
        let addr = tokio::net::lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Backhaul address did not resolve: {}", server))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        info!(server, resolved = %addr, "backhaul connected");

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            enabled: AtomicBool::new(true),
            handle: Mutex::new(None),
        });
        let iface = engine.register_interface(transport.clone());
        *transport.handle.lock().unwrap() = Some(iface.handle());

        let reader = transport.clone();
        let read_engine = engine.clone();
        tokio::spawn(async move {
            reader.read_loop(read_engine).await;
        });
        Ok(iface)
    }

    async fn read_loop(self: Arc<Self>, engine: Arc<Engine>) {
        let mut datagram = [0u8; 2048];
        loop {
            let n = match self.socket.recv(&mut datagram).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "backhaul receive failed");
                    return;
                }
            };
            if !self.enabled.load(Ordering::Relaxed) {
                continue;
            }
            let Some(mut rx) = engine.rx_pool().try_alloc() else {
                warn!("backhaul datagram dropped, RX pool exhausted");
                continue;
            };
            rx.data_mut().extend_from_slice(&datagram[..n]);
            let meta = rx.rx_mut();
            meta.interface = *self.handle.lock().unwrap();
            meta.interface_id = InterfaceId::Udp;
            engine.ingress(rx);
        }
    }
}

#[async_trait]
impl Transport for BackhaulTransport {
    fn interface_id(&self) -> InterfaceId {
        InterfaceId::Udp
    }

    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError> {
        self.socket.send(buf.data()).await?;
        Ok(())
    }

    async fn receive_ctrl(&self, enable: bool) -> Result<(), PacketError> {
        self.enabled.store(enable, Ordering::Relaxed);
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        Some(2048)
    }
}
