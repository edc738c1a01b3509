//! Broker-facing layer: connection wiring, the rate-limited state publisher
//! and the discovery announcer.

pub mod announcer;
pub mod client;
pub mod publisher;

pub use announcer::Announcer;
pub use client::{BridgeClient, ConnectionEvent, MqttSettings, MqttSink};
pub use publisher::{MessageSink, PublishOpts, Publisher, SinkError, FORCE_PUBLISH_INTERVAL};
