//! Device configuration from the environment

use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

/// Default sensor report period in seconds
const DEFAULT_REPORT_PERIOD_SECS: u64 = 30;

/// Default serial baud rate
const DEFAULT_SERIAL_BAUD: u32 = 115_200;

/// Runtime configuration for the device binary
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// 40-bit device identifier
    pub device_id: u64,
    /// Root secret the key store derives from (32 bytes, hex)
    pub root_key: [u8; 32],
    /// 24-bit identifier of the device key
    pub key_identifier: u32,
    /// Serial port path, if the serial transport is enabled
    pub serial_port: Option<String>,
    pub serial_baud: u32,
    /// UDP server `host:port`, if the UDP transport is enabled
    pub udp_server: Option<String>,
    /// Run RX and TX processing in separate tasks
    pub split_pipeline: bool,
    /// How often a sensor report is queued
    pub report_period: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0x01_0000_0001,
            root_key: [0u8; 32],
            key_identifier: 1,
            serial_port: None,
            serial_baud: DEFAULT_SERIAL_BAUD,
            udp_server: None,
            split_pipeline: false,
            report_period: Duration::from_secs(DEFAULT_REPORT_PERIOD_SECS),
        }
    }
}

impl DeviceConfig {
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
            serial_port: env::var("EPACKET_SERIAL_PORT").ok(),
            serial_baud: env::var("EPACKET_SERIAL_BAUD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SERIAL_BAUD),
            udp_server: env::var("EPACKET_UDP_SERVER").ok(),
            split_pipeline: env::var("EPACKET_SPLIT_PIPELINE")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            report_period: env::var("EPACKET_REPORT_PERIOD")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.report_period),
        })
    }
}

/// Parse a decimal or `0x`-prefixed integer
fn parse_u64(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| anyhow!("Invalid integer: {}", value))
}

/// Parse a 64-character hex string into the 32-byte root key
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
