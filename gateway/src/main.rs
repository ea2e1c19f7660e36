//! ePacket gateway binary
//!
//! Bridges downstream Bluetooth devices onto a UDP backhaul: downlink
//! packets are wrapped into RECEIVED_EPACKET frames upstream, and
//! FORWARD / FORWARD_AUTO_CONN packets from the backhaul are relayed to
//! the named remotes.

mod backhaul;
mod bt;
mod config;

use anyhow::Result;
use backhaul::BackhaulTransport;
use bt::BtCentral;
use config::GatewayNodeConfig;
use epacket_core::forward::{BackhaulHandler, ForwardConfig, ForwardEngine};
use epacket_core::gateway::{GatewayConfig, GatewayHandler};
use epacket_core::keys::StaticKeyStore;
use epacket_core::types::Wait;
use epacket_core::{Engine, EngineConfig, SystemTimeSource};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = GatewayNodeConfig::from_env()?;
    info!(device_id = format_args!("{:010X}", config.device_id), "ePacket gateway starting");

    let engine = Engine::new(
        EngineConfig {
            device_id: config.device_id,
            // Gateways juggle downlink wrapping and forwarding at once.
            tx_buffers: 16,
            rx_buffers: 32,
            ..Default::default()
        },
        Arc::new(StaticKeyStore::new(config.root_key, config.key_identifier)),
        Arc::new(SystemTimeSource),
    );

    let backhaul_iface = BackhaulTransport::spawn(&engine, &config.backhaul_server).await?;
    backhaul_iface.receive(Wait::Forever).await?;

    let (central, central_iface) = BtCentral::spawn(&engine).await?;

    // Downlink packets from the central get wrapped for the backhaul.
    central_iface.set_receive_handler(GatewayHandler::new(GatewayConfig {
        max_hold: config.max_hold,
        tx_low_water: config.tx_low_water,
        ..GatewayConfig::new(backhaul_iface.handle())
    }));

    // Backhaul packets drive the forwarding engine.
    let forward = ForwardEngine::new(
        ForwardConfig {
            throughput_limit_kbps: config.throughput_limit_kbps,
            ..ForwardConfig::new(backhaul_iface.handle())
        },
        central.clone(),
    );
    backhaul_iface.set_receive_handler(BackhaulHandler::new(forward.clone()));
    central.set_forward(forward.clone());

    let run_engine = engine.clone();
    tokio::spawn(async move { run_engine.run().await });

    let fwd = forward.clone();
    let fwd_engine = engine.clone();
    tokio::spawn(async move { fwd.run(fwd_engine).await });

    let watchdog = engine.watchdog().clone();
    tokio::spawn(async move {
        let task = watchdog.run().await;
        error!(task, "pipeline watchdog expired, rebooting");
        std::process::exit(1);
    });

    tokio::signal::ctrl_c().await?;
    // Stop accepting forwarding work before going down.
    engine.app_state().set_rebooting();
    info!("gateway shutting down");
    Ok(())
}
