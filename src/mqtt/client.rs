//! Broker-side wiring.
//!
//! The rumqttc connection is driven by a dedicated thread; the bridge loop
//! never touches the network directly. Broker callbacks become
//! [`ConnectionEvent`]s on a channel the loop drains between polls, so a
//! reconnect triggers re-announcement through ordinary message flow instead
//! of callback re-entry. The client carries a retained last-will of `offline`
//! on the availability topic, making unclean deaths observable within the
//! keepalive window.

use std::io;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};

use super::publisher::{MessageSink, SinkError};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
// Outbound queue depth; publishes beyond it are rejected, not blocked on.
const REQUEST_CAP: usize = 256;

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttSettings {
  pub host: String,
  pub port: u16,
  pub username: Option<String>,
  pub password: Option<String>,
  pub client_id: String,
}

/// Broker connection edges, delivered to the bridge loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
  Connected,
  Disconnected,
}

/// Handle to the broker connection: a cloneable publish endpoint plus the
/// connection-event channel.
pub struct BridgeClient {
  client: Client,
  events: Receiver<ConnectionEvent>,
}

impl BridgeClient {
  /// Configure the client and start the connection-driver thread. Connecting
  /// itself happens in the background with 1-60 s exponential backoff.
  pub fn connect(settings: &MqttSettings, availability_topic: &str) -> io::Result<BridgeClient> {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(KEEP_ALIVE);
    if let Some(username) = &settings.username {
      options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    options.set_last_will(LastWill::new(
      availability_topic,
      "offline",
      QoS::AtMostOnce,
      true,
    ));

    let (client, connection) = Client::new(options, REQUEST_CAP);
    let events = spawn_driver(connection)?;
    info!(
      "MQTT client for {}:{} started (availability on {availability_topic})",
      settings.host, settings.port
    );
    Ok(BridgeClient { client, events })
  }

  pub fn sink(&self) -> MqttSink {
    MqttSink {
      client: self.client.clone(),
    }
  }

  /// Next pending connection event, if any. Non-blocking.
  pub fn poll_event(&self) -> Option<ConnectionEvent> {
    self.events.try_recv().ok()
  }

  /// Ask the broker for an orderly disconnect. Errors are irrelevant at this
  /// point; the process is exiting.
  pub fn disconnect(&self) {
    let _ = self.client.disconnect();
  }
}

fn spawn_driver(mut connection: Connection) -> io::Result<Receiver<ConnectionEvent>> {
  let (tx, rx) = mpsc::channel();
  thread::Builder::new()
    .name("mqtt-connection".to_string())
    .spawn(move || {
      let mut backoff = RECONNECT_MIN;
      for event in connection.iter() {
        match event {
          Ok(Event::Incoming(Packet::ConnAck(_))) => {
            info!("connected to MQTT broker");
            backoff = RECONNECT_MIN;
            if tx.send(ConnectionEvent::Connected).is_err() {
              return;
            }
          }
          Ok(_) => {}
          Err(e) => {
            warn!(
              "MQTT connection error: {e}, retrying in {}s",
              backoff.as_secs()
            );
            if tx.send(ConnectionEvent::Disconnected).is_err() {
              return;
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(RECONNECT_MAX);
          }
        }
      }
    })?;
  Ok(rx)
}

/// Publish endpoint backed by the rumqttc client. `try_publish` enqueues into
/// the connection thread without blocking; a full queue or closed connection
/// surfaces as a sink error the publisher swallows.
#[derive(Clone)]
pub struct MqttSink {
  client: Client,
}

impl MessageSink for MqttSink {
  fn send(&self, topic: &str, payload: &str, retain: bool) -> Result<(), SinkError> {
    self
      .client
      .try_publish(topic, QoS::AtMostOnce, retain, payload)
      .map_err(|e| SinkError(e.to_string()))
  }
}
