//! Telemetry bridges from a residential solar/battery installation to MQTT.
//!
//! Three long-running daemons share this crate: one polls a Deye hybrid
//! inverter over Modbus-TCP, one listens to a Pylontech-profile BMS on CAN,
//! and one queries a stack of lithium modules over the Pylontech RS485
//! protocol. Each normalizes its readings and publishes them as MQTT state
//! topics with retained Home-Assistant discovery metadata, a truthful
//! online/offline availability signal, and rate-limited, hysteresis-gated
//! traffic.
//!
//! Dataflow is strictly bus-to-broker; nothing is ever written back to the
//! physical devices.

pub mod can;
pub mod config;
pub mod discovery;
pub mod modbus;
pub mod mqtt;
pub mod pylontech;
pub mod supervisor;
pub mod value;

pub use config::{BridgeConfig, CanConfig, ConfigError, DeviceDefaults, ModbusConfig, Rs485Config};
pub use discovery::{DeviceClass, DeviceInfo, EntityKind, LegacyIdentity, SensorDescriptor, StateClass};
pub use mqtt::{Announcer, BridgeClient, ConnectionEvent, MessageSink, PublishOpts, Publisher};
pub use supervisor::{Availability, AvailabilityReporter, Supervisor};
pub use value::Value;
