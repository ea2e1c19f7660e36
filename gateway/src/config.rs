//! Gateway configuration from the environment

use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayNodeConfig {
    /// 40-bit device identifier of this gateway
    pub device_id: u64,
    /// Root secret the key store derives from (32 bytes, hex)
    pub root_key: [u8; 32],
    /// 24-bit identifier of the gateway key
    pub key_identifier: u32,
    /// Backhaul server `host:port`
    pub backhaul_server: String,
    /// Grouping hold window for downlink packets
    pub max_hold: Duration,
    /// Free TX buffers at or below this margin trigger backpressure
    pub tx_low_water: usize,
    /// Persisted Bluetooth throughput limit for forwarded connections
    pub throughput_limit_kbps: Option<u16>,
}

impl Default for GatewayNodeConfig {
    fn default() -> Self {
        Self {
            device_id: 0x02_0000_0001,
            root_key: [0u8; 32],
            key_identifier: 1,
            backhaul_server: "127.0.0.1:7000".into(),
            max_hold: Duration::from_millis(100),
            tx_low_water: 1,
            throughput_limit_kbps: None,
        }
    }
}

impl GatewayNodeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            device_id: match env::var("EPACKET_DEVICE_ID") {
                Ok(v) => parse_u64(&v)? & 0xFF_FFFF_FFFF,
                Err(_) => defaults.device_id,
            },
            root_key: match env::var("EPACKET_ROOT_KEY") {
                Ok(v) => parse_key(&v)?,
                Err(_) => defaults.root_key,
            },
            key_identifier: match env::var("EPACKET_KEY_ID") {
                Ok(v) => parse_u64(&v)? as u32 & 0x00FF_FFFF,
                Err(_) => defaults.key_identifier,
            },
            backhaul_server: env::var("EPACKET_BACKHAUL")
                .unwrap_or(defaults.backhaul_server),
            max_hold: env::var("EPACKET_GATEWAY_HOLD_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_hold),
            tx_low_water: env::var("EPACKET_TX_LOW_WATER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.tx_low_water),
            throughput_limit_kbps: env::var("EPACKET_BT_THROUGHPUT_KBPS")
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }
}

fn parse_u64(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| anyhow!("Invalid integer: {}", value))
}

fn parse_key(value: &str) -> Result<[u8; 32]> {
    if value.len() != 64 {
        return Err(anyhow!("Root key must be 64 hex characters"));
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
            .map_err(|_| anyhow!("Invalid hex in root key"))?;
    }
    Ok(key)
}
