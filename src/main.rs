//! ePacket device binary
//!
//! Brings up the configured transports, runs the packet pipeline and
//! queues periodic sensor reports on every active interface.

mod config;
mod transport;

use anyhow::Result;
use bytes::BufMut;
use config::DeviceConfig;
use epacket_core::keys::StaticKeyStore;
use epacket_core::transport::InterfaceHandle;
use epacket_core::types::{Auth, Destination, PacketType, Wait};
use epacket_core::{Engine, EngineConfig, SystemTimeSource};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{SerialTransport, UdpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DeviceConfig::from_env()?;
    info!(device_id = format_args!("{:010X}", config.device_id), "ePacket device starting");

    let engine = Engine::new(
        EngineConfig {
            device_id: config.device_id,
            split_pipeline: config.split_pipeline,
            ..Default::default()
        },
        Arc::new(StaticKeyStore::new(config.root_key, config.key_identifier)),
        Arc::new(SystemTimeSource),
    );

    let mut interfaces: Vec<InterfaceHandle> = Vec::new();

    if let Some(port) = &config.serial_port {
        let iface = SerialTransport::spawn(&engine, port, config.serial_baud).await?;
        iface.receive(Wait::Forever).await?;
        interfaces.push(iface.handle());
    }
    if let Some(server) = &config.udp_server {
        let iface = UdpTransport::spawn(&engine, server.clone(), Default::default()).await?;
        iface.receive(Wait::Forever).await?;
        interfaces.push(iface.handle());
    }
    if interfaces.is_empty() {
        warn!("no transports configured; set EPACKET_SERIAL_PORT or EPACKET_UDP_SERVER");
    }

    if config.split_pipeline {
        let rx_engine = engine.clone();
        tokio::spawn(async move { rx_engine.run_rx().await });
        let tx_engine = engine.clone();
        tokio::spawn(async move { tx_engine.run_tx().await });
    } else {
        let run_engine = engine.clone();
        tokio::spawn(async move { run_engine.run().await });
    }

    // A stuck pipeline is fatal; the platform restarts us.
    let watchdog = engine.watchdog().clone();
    tokio::spawn(async move {
        let task = watchdog.run().await;
        error!(task, "pipeline watchdog expired, rebooting");
        std::process::exit(1);
    });

    report_loop(&engine, &config, &interfaces).await;
    Ok(())
}

/// Queue a sensor report on every active interface, forever.
async fn report_loop(engine: &Arc<Engine>, config: &DeviceConfig, interfaces: &[InterfaceHandle]) {
    let mut tick = tokio::time::interval(config.report_period);
    let mut sample: u32 = 0;
    loop {
        tick.tick().await;
        sample = sample.wrapping_add(1);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;

        for &handle in interfaces {
            let Some(mut buf) = engine.tx_pool().try_alloc() else {
                warn!("sensor report skipped, TX pool exhausted");
                continue;
            };
            buf.data_mut().put_u32_le(timestamp);
            buf.data_mut().put_u32_le(sample);
            let meta = buf.tx_mut();
            meta.packet_type = PacketType::Tdf;
            meta.auth = Auth::Device;
            meta.destination = Destination::AllPeers;
            if engine.queue(buf, handle).is_err() {
                warn!("sensor report dropped, TX queue full");
            }
        }
    }
}
