//! Serial port transport driver
//!
//! Wraps each encrypted frame in the sync-byte framing from
//! `epacket_core::serial` and feeds reassembled frames into the engine.

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use epacket_core::buffer::PacketBuf;
use epacket_core::serial::{encode_frame, Reconstructor};
use epacket_core::transport::{Interface, InterfaceHandle, Overhead, Transport};
use epacket_core::types::InterfaceId;
use epacket_core::{Engine, PacketError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

pub struct SerialTransport {
    writer: Mutex<WriteHalf<SerialStream>>,
    enabled: AtomicBool,
    engine: Weak<Engine>,
    last_tx: std::sync::Mutex<Option<Instant>>,
}

impl SerialTransport {
    /// Open the port, register the interface and start the read task.
    pub async fn spawn(engine: &Arc<Engine>, port: &str, baud: u32) -> Result<Arc<Interface>> {
        let stream = tokio_serial::new(port, baud).open_native_async()?;
        let (reader, writer) = tokio::io::split(stream);

        let transport = Arc::new(Self {
            writer: Mutex::new(writer),
            enabled: AtomicBool::new(true),
            engine: Arc::downgrade(engine),
            last_tx: std::sync::Mutex::new(None),
        });
        let iface = engine.register_interface(transport.clone());

        let handle = iface.handle();
        let read_engine = engine.clone();
        tokio::spawn(async move {
            transport.read_loop(read_engine, handle, reader).await;
        });
        info!(port, baud, "serial transport started");
        Ok(iface)
    }

    async fn read_loop(
        self: Arc<Self>,
        engine: Arc<Engine>,
        handle: InterfaceHandle,
        mut reader: ReadHalf<SerialStream>,
    ) {
        let mut reconstructor = Reconstructor::new(engine.config().buffer_size);
        let mut chunk = [0u8; 256];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    warn!("serial port closed");
                    return;
                }
                Ok(n) => {
                    reconstructor.extend(&chunk[..n]);
                    while let Some(frame) = reconstructor.next_frame() {
                        if !self.enabled.load(Ordering::Relaxed) {
                            continue;
                        }
                        let Some(mut rx) = engine.rx_pool().try_alloc() else {
                            warn!("serial frame dropped, RX pool exhausted");
                            continue;
                        };
                        rx.data_mut().extend_from_slice(&frame);
                        let meta = rx.rx_mut();
                        meta.interface = Some(handle);
                        meta.interface_id = InterfaceId::Serial;
                        engine.ingress(rx);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "serial read failed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn interface_id(&self) -> InterfaceId {
        InterfaceId::Serial
    }

    fn overhead(&self) -> Overhead {
        Overhead { header: 4, footer: 0 }
    }

    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError> {
        let mut wire = BytesMut::new();
        encode_frame(buf.data(), &mut wire);
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&wire).await?;
            writer.flush().await?;
        }
        if let Some(engine) = self.engine.upgrade() {
            let last = *self.last_tx.lock().unwrap();
            let now = engine.rate_limit().rate_limit_tx(last, wire.len()).await;
            *self.last_tx.lock().unwrap() = Some(now);
        }
        Ok(())
    }

    async fn receive_ctrl(&self, enable: bool) -> Result<(), PacketError> {
        self.enabled.store(enable, Ordering::Relaxed);
        Ok(())
    }
}
