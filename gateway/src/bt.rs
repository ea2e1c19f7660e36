//! Bluetooth central: GATT connections to downstream devices.
//!
//! One struct serves both roles the core needs: the BT_CENTRAL transport
//! (frame writes to the command characteristic, notification ingress)
//! and the [`ConnectionOps`] collaborator of the forwarding engine.

use anyhow::Result;
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, Uuid};
use epacket_core::buffer::PacketBuf;
use epacket_core::forward::{reason, ConnectionOps, ForwardEngine};
use epacket_core::transport::{Interface, InterfaceHandle, Transport};
use epacket_core::types::{BtAddr, Destination, InterfaceAddress, InterfaceId};
use epacket_core::{Engine, PacketError};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Infuse service advertised by every downstream device.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FCD5_0000_1000_8000_00805F9B34FB);
/// Inbound frames are written to this characteristic.
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0DE40001_C0DE_4B1D_9AEA_8E1B3F6C2A01);
/// Outbound frames arrive as notifications on this characteristic.
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x0DE40002_C0DE_4B1D_9AEA_8E1B3F6C2A01);

/// ATT payload available with the default negotiated MTU.
const DEFAULT_GATT_PAYLOAD: usize = 244;

struct Link {
    device: Device,
    command: Characteristic,
}

pub struct BtCentral {
    adapter: Adapter,
    engine: Weak<Engine>,
    handle: Mutex<Option<InterfaceHandle>>,
    links: Mutex<HashMap<BtAddr, Arc<Link>>>,
    forward: Mutex<Option<Arc<ForwardEngine>>>,
    weak_self: Mutex<Weak<BtCentral>>,
}

impl BtCentral {
    /// Bring up the adapter and register the BT_CENTRAL interface.
    pub async fn spawn(engine: &Arc<Engine>) -> Result<(Arc<Self>, Arc<Interface>)> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "Bluetooth central up");

        let central = Arc::new(Self {
            adapter,
            engine: Arc::downgrade(engine),
            handle: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            forward: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *central.weak_self.lock().unwrap() = Arc::downgrade(&central);

        let iface = engine.register_interface(central.clone());
        *central.handle.lock().unwrap() = Some(iface.handle());
        Ok((central, iface))
    }

    /// Wire in the forwarding engine for disconnect reporting.
    pub fn set_forward(&self, forward: Arc<ForwardEngine>) {
        *self.forward.lock().unwrap() = Some(forward);
    }

    fn link(&self, addr: &BtAddr) -> Option<Arc<Link>> {
        self.links.lock().unwrap().get(addr).cloned()
    }

    async fn find_characteristic(
        device: &Device,
        uuid: Uuid,
    ) -> Result<Characteristic, PacketError> {
        for service in device
            .services()
            .await
            .map_err(|_| PacketError::NotConnected)?
        {
            let service_uuid = service
                .uuid()
                .await
                .map_err(|_| PacketError::NotConnected)?;
            if service_uuid != SERVICE_UUID {
                continue;
            }
            for characteristic in service
                .characteristics()
                .await
                .map_err(|_| PacketError::NotConnected)?
            {
                let char_uuid = characteristic
                    .uuid()
                    .await
                    .map_err(|_| PacketError::NotConnected)?;
                if char_uuid == uuid {
                    return Ok(characteristic);
                }
            }
        }
        Err(PacketError::NotSupported)
    }

    /// Notification pump for one connection; ends with the link.
    async fn notification_loop(
        self: Arc<Self>,
        engine: Arc<Engine>,
        addr: BtAddr,
        characteristic: Characteristic,
    ) {
        let notifications = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "data subscription failed");
                return;
            }
        };
        let mut notifications = Box::pin(notifications);
        let handle = *self.handle.lock().unwrap();

        while let Some(frame) = notifications.next().await {
            let Some(mut rx) = engine.rx_pool().try_alloc() else {
                warn!("notification dropped, RX pool exhausted");
                continue;
            };
            rx.data_mut().extend_from_slice(&frame);
            let meta = rx.rx_mut();
            meta.interface = handle;
            meta.interface_id = InterfaceId::BtCentral;
            meta.address = InterfaceAddress::Bt(addr);
            engine.ingress(rx);
        }

        // Stream end means the remote dropped the link.
        debug!(address = %addr, "notification stream ended");
        self.links.lock().unwrap().remove(&addr);
        if let Some(forward) = self.forward.lock().unwrap().clone() {
            forward.handle_disconnected(&engine, &addr, reason::LINK_LOST);
        }
    }
}

#[async_trait]
impl Transport for BtCentral {
    fn interface_id(&self) -> InterfaceId {
        InterfaceId::BtCentral
    }

    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError> {
        let addr = match buf.tx().destination {
            Destination::Specific(InterfaceAddress::Bt(addr)) => addr,
            // Broadcast from a central means every connected peer.
            _ => {
                let links: Vec<_> = self.links.lock().unwrap().values().cloned().collect();
                if links.is_empty() {
                    return Err(PacketError::NotConnected);
                }
                for link in links {
                    link.command
                        .write(buf.data())
                        .await
                        .map_err(|_| PacketError::NotConnected)?;
                }
                return Ok(());
            }
        };
        let link = self.link(&addr).ok_or(PacketError::NotConnected)?;
        link.command
            .write(buf.data())
            .await
            .map_err(|_| PacketError::NotConnected)?;
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        if self.links.lock().unwrap().is_empty() {
            Some(0)
        } else {
            Some(DEFAULT_GATT_PAYLOAD)
        }
    }
}

#[async_trait]
impl ConnectionOps for BtCentral {
    async fn connect(&self, addr: &BtAddr, timeout: Duration) -> Result<(), PacketError> {
        if self.link(addr).is_some() {
            return Ok(());
        }
        let device = self
            .adapter
            .device(Address::new(addr.addr))
            .map_err(|_| PacketError::NotConnected)?;
        tokio::time::timeout(timeout, device.connect())
            .await
            .map_err(|_| PacketError::TimedOut)?
            .map_err(|_| PacketError::NotConnected)?;

        let command = Self::find_characteristic(&device, COMMAND_CHAR_UUID).await?;
        self.links.lock().unwrap().insert(
            *addr,
            Arc::new(Link { device, command }),
        );
        info!(address = %addr, "GATT link established");
        Ok(())
    }

    async fn read_security(&self, addr: &BtAddr) -> Result<(), PacketError> {
        let link = self.link(addr).ok_or(PacketError::NotConnected)?;
        let paired = link
            .device
            .is_paired()
            .await
            .map_err(|_| PacketError::NotConnected)?;
        debug!(address = %addr, paired, "link security read");
        Ok(())
    }

    async fn subscribe_data(&self, addr: &BtAddr) -> Result<(), PacketError> {
        let link = self.link(addr).ok_or(PacketError::NotConnected)?;
        let data = Self::find_characteristic(&link.device, DATA_CHAR_UUID).await?;

        let Some(this) = self.weak_self.lock().unwrap().upgrade() else {
            return Err(PacketError::NotConnected);
        };
        let Some(engine) = self.engine.upgrade() else {
            return Err(PacketError::NotConnected);
        };
        let addr = *addr;
        tokio::spawn(async move {
            this.notification_loop(engine, addr, data).await;
        });
        Ok(())
    }

    async fn disconnect(&self, addr: &BtAddr) -> Result<(), PacketError> {
        let link = self.link(addr).ok_or(PacketError::NotConnected)?;
        link.device
            .disconnect()
            .await
            .map_err(|_| PacketError::NotConnected)?;
        self.links.lock().unwrap().remove(addr);
        Ok(())
    }
}
