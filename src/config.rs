//! Environment-variable configuration.
//!
//! The daemons are configured entirely through the environment; every
//! variable has a default matching the shipped deployment. Unparseable
//! numeric values are configuration errors, not panics.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::{DeviceInfo, LegacyIdentity};
use crate::mqtt::MqttSettings;
use crate::supervisor::DEFAULT_STALE_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value for {name}: {value:?}")]
  Invalid { name: &'static str, value: String },
}

fn env_or(name: &str, default: &str) -> String {
  env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
  env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
  match env::var(name) {
    Err(_) => Ok(default),
    Ok(value) => value
      .parse()
      .map_err(|_| ConfigError::Invalid { name, value }),
  }
}

fn env_duration_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
  Ok(Duration::from_secs(env_parse(
    name,
    default.as_secs(),
  )?))
}

/// Per-bridge identity defaults; each daemon carries its own set so the three
/// devices stay stable across releases.
pub struct DeviceDefaults {
  pub state_prefix: &'static str,
  pub device_id: &'static str,
  pub device_name: &'static str,
  pub manufacturer: &'static str,
  pub model: &'static str,
}

/// Common bridge configuration: broker, topic prefixes, device identity and
/// the optional legacy identity pair.
pub struct BridgeConfig {
  pub mqtt: MqttSettings,
  pub state_prefix: String,
  pub discovery_prefix: String,
  pub device: DeviceInfo,
  pub legacy: Option<LegacyIdentity>,
}

impl BridgeConfig {
  pub fn from_env(defaults: &DeviceDefaults) -> Result<Self, ConfigError> {
    let state_prefix = env_or("MQTT_PREFIX", defaults.state_prefix);
    let device_id = env_or("DEVICE_ID", defaults.device_id);
    let mqtt = MqttSettings {
      host: env_or("MQTT_HOST", "localhost"),
      port: env_parse("MQTT_PORT", 1883)?,
      username: env_opt("MQTT_USER"),
      password: env_opt("MQTT_PASS"),
      client_id: format!("{}-bridge", device_id),
    };
    // Both halves are required for the legacy scheme to apply.
    let legacy = match (env_opt("SOLARMAN_PREFIX"), env_opt("SOLARMAN_SERIAL")) {
      (Some(prefix), Some(serial)) => Some(LegacyIdentity { prefix, serial }),
      _ => None,
    };
    Ok(BridgeConfig {
      mqtt,
      state_prefix,
      discovery_prefix: env_or("DISCOVERY_PREFIX", "homeassistant"),
      device: DeviceInfo {
        id: device_id,
        name: env_or("DEVICE_NAME", defaults.device_name),
        manufacturer: env_or("DEVICE_MANUFACTURER", defaults.manufacturer),
        model: env_or("DEVICE_MODEL", defaults.model),
      },
      legacy,
    })
  }
}

pub struct CanConfig {
  pub interface: String,
  pub stale_timeout: Duration,
}

impl CanConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Ok(CanConfig {
      interface: env_or("CAN_IFACE", "can0"),
      stale_timeout: env_duration_secs("CAN_STALE_TIMEOUT", DEFAULT_STALE_TIMEOUT)?,
    })
  }
}

pub struct Rs485Config {
  pub port: String,
  pub baud: u32,
  pub address: u8,
  pub batteries: u8,
  pub cells_per_module: u8,
  pub temps_per_module: u8,
  pub poll_interval: Duration,
  pub stale_timeout: Duration,
}

impl Rs485Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Ok(Rs485Config {
      port: env_or("RS485_PORT", "/dev/ttyUSB0"),
      baud: env_parse("RS485_BAUD", 9600)?,
      address: env_parse("RS485_ADDR", 2)?,
      batteries: env_parse("RS485_BATTERIES", 3)?,
      cells_per_module: env_parse("RS485_CELLS", 16)?,
      temps_per_module: env_parse("RS485_TEMPS", 4)?,
      poll_interval: env_duration_secs("POLL_INTERVAL", Duration::from_secs(30))?,
      // Three missed polls before the availability topic flips.
      stale_timeout: env_duration_secs("RS485_STALE_TIMEOUT", Duration::from_secs(90))?,
    })
  }
}

pub struct ModbusConfig {
  pub host: String,
  pub port: u16,
  pub unit: u8,
  pub poll_interval: Duration,
  pub stale_timeout: Duration,
}

impl ModbusConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Ok(ModbusConfig {
      host: env_or("MODBUS_HOST", "192.168.200.111"),
      port: env_parse("MODBUS_PORT", 502)?,
      unit: env_parse("MODBUS_SLAVE", 1)?,
      poll_interval: env_duration_secs("POLL_INTERVAL", Duration::from_secs(10))?,
      stale_timeout: env_duration_secs("MODBUS_STALE_TIMEOUT", DEFAULT_STALE_TIMEOUT)?,
    })
  }
}
