//! Retained discovery metadata.
//!
//! One JSON config document per sensor, published retained under the
//! discovery prefix, followed by the retained `online` availability message.
//! Invoked at startup and again on every broker reconnect: a broker restart
//! can lose retained state, and consumers that appear later must still find
//! the schema.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde_json::json;

use crate::discovery::{resolve_unique_id, DeviceInfo, EntityKind, LegacyIdentity, SensorDescriptor};

use super::publisher::MessageSink;

/// Everything needed to describe one bridge to the consumer.
pub struct Announcer {
  pub discovery_prefix: String,
  pub state_prefix: String,
  pub availability_topic: String,
  pub device: DeviceInfo,
  pub legacy: Option<LegacyIdentity>,
  /// Maps a sensor name to its display name under the legacy identity
  /// scheme; sensors without an entry keep their derived unique id.
  pub legacy_names: fn(&str) -> Option<&'static str>,
  pub sensors: Vec<SensorDescriptor>,
}

fn no_legacy_names(_: &str) -> Option<&'static str> {
  None
}

impl Announcer {
  pub fn new(
    discovery_prefix: impl Into<String>,
    state_prefix: impl Into<String>,
    device: DeviceInfo,
    sensors: Vec<SensorDescriptor>,
  ) -> Self {
    let state_prefix = state_prefix.into();
    let availability_topic = format!("{state_prefix}/status");
    Announcer {
      discovery_prefix: discovery_prefix.into(),
      state_prefix,
      availability_topic,
      device,
      legacy: None,
      legacy_names: no_legacy_names,
      sensors,
    }
  }

  pub fn with_legacy(mut self, legacy: Option<LegacyIdentity>, names: fn(&str) -> Option<&'static str>) -> Self {
    self.legacy = legacy;
    self.legacy_names = names;
    self
  }

  pub fn config_topic(&self, descriptor: &SensorDescriptor) -> String {
    format!(
      "{}/{}/{}/{}/config",
      self.discovery_prefix,
      descriptor.entity_kind.topic_segment(),
      self.device.id,
      descriptor.name
    )
  }

  /// The discovery document for one sensor. Pure function of the announcer's
  /// configuration, so identical bridges announce identical schemas.
  pub fn config_document(&self, descriptor: &SensorDescriptor) -> serde_json::Value {
    let unique_id = resolve_unique_id(
      descriptor,
      &self.device,
      self.legacy.as_ref(),
      (self.legacy_names)(&descriptor.name),
    );
    let mut obj = serde_json::Map::new();
    obj.insert("name".into(), json!(descriptor.display_name));
    obj.insert(
      "state_topic".into(),
      json!(format!("{}/{}", self.state_prefix, descriptor.state_topic)),
    );
    obj.insert("unique_id".into(), json!(unique_id));
    obj.insert("availability_topic".into(), json!(self.availability_topic));
    obj.insert("payload_available".into(), json!("online"));
    obj.insert("payload_not_available".into(), json!("offline"));
    obj.insert(
      "device".into(),
      json!({
        "identifiers": [self.device.id],
        "name": self.device.name,
        "manufacturer": self.device.manufacturer,
        "model": self.device.model,
      }),
    );
    if let Some(unit) = &descriptor.unit {
      obj.insert("unit_of_measurement".into(), json!(unit));
    }
    if let Some(class) = descriptor.device_class {
      obj.insert("device_class".into(), json!(class));
    }
    if let Some(class) = descriptor.state_class {
      obj.insert("state_class".into(), json!(class));
    }
    if let Some(icon) = &descriptor.icon {
      obj.insert("icon".into(), json!(icon));
    }
    if let Some(precision) = descriptor.display_precision {
      obj.insert("suggested_display_precision".into(), json!(precision));
    }
    if descriptor.entity_kind == EntityKind::BinarySensor {
      obj.insert("payload_on".into(), json!("1"));
      obj.insert("payload_off".into(), json!("0"));
    }
    serde_json::Value::Object(obj)
  }

  /// Publish the retained schema plus the online availability message.
  /// Broker rejections are logged and skipped; the next reconnect retries.
  pub fn announce(&self, sink: &dyn MessageSink) {
    let mut published = 0usize;
    for descriptor in &self.sensors {
      let topic = self.config_topic(descriptor);
      let document = self.config_document(descriptor).to_string();
      match sink.send(&topic, &document, true) {
        Ok(()) => published += 1,
        Err(e) => warn!("discovery publish to {topic} failed: {e}"),
      }
    }
    if let Err(e) = sink.send(&self.availability_topic, "online", true) {
      warn!("availability publish failed: {e}");
    }
    info!("announced {published} of {} sensors", self.sensors.len());
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use crate::discovery::DeviceClass;
  use crate::mqtt::publisher::SinkError;

  use super::*;

  struct Recorder {
    messages: RefCell<Vec<(String, String, bool)>>,
  }

  impl MessageSink for Recorder {
    fn send(&self, topic: &str, payload: &str, retain: bool) -> Result<(), SinkError> {
      self
        .messages
        .borrow_mut()
        .push((topic.to_string(), payload.to_string(), retain));
      Ok(())
    }
  }

  fn announcer() -> Announcer {
    Announcer::new(
      "homeassistant",
      "deye_bms",
      DeviceInfo {
        id: "deye_bms_master".into(),
        name: "Deye BMS (CAN)".into(),
        manufacturer: "Shoto".into(),
        model: "Pylontech-profile CAN".into(),
      },
      vec![
        SensorDescriptor::sensor("soc", "BMS SOC", "soc")
          .unit("%")
          .measurement(),
        SensorDescriptor::binary_sensor("balancing", "Balancing", "balancing_active"),
      ],
    )
  }

  #[test]
  fn schema_then_availability_all_retained() {
    let sink = Recorder {
      messages: RefCell::new(Vec::new()),
    };
    announcer().announce(&sink);
    let messages = sink.messages.borrow();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].0, "homeassistant/sensor/deye_bms_master/soc/config");
    assert_eq!(messages[1].0, "homeassistant/binary_sensor/deye_bms_master/balancing/config");
    assert_eq!(messages[2], ("deye_bms/status".to_string(), "online".to_string(), true));
    assert!(messages.iter().all(|(_, _, retain)| *retain));
  }

  #[test]
  fn document_contents() {
    let a = announcer();
    let doc = a.config_document(&a.sensors[0]);
    assert_eq!(doc["unique_id"], "deye_bms_master_soc");
    assert_eq!(doc["state_topic"], "deye_bms/soc");
    assert_eq!(doc["availability_topic"], "deye_bms/status");
    assert_eq!(doc["unit_of_measurement"], "%");
    assert_eq!(doc["state_class"], "measurement");
    assert_eq!(doc["device"]["identifiers"][0], "deye_bms_master");
    assert!(doc.get("device_class").is_none());
  }

  #[test]
  fn binary_sensor_payloads() {
    let a = announcer();
    let doc = a.config_document(&a.sensors[1]);
    assert_eq!(doc["payload_on"], "1");
    assert_eq!(doc["payload_off"], "0");
  }

  #[test]
  fn announcement_is_deterministic() {
    let a = announcer();
    let b = announcer();
    let topics_a: Vec<String> = a.sensors.iter().map(|s| a.config_topic(s)).collect();
    let topics_b: Vec<String> = b.sensors.iter().map(|s| b.config_topic(s)).collect();
    assert_eq!(topics_a, topics_b);
    for (sa, sb) in a.sensors.iter().zip(&b.sensors) {
      assert_eq!(a.config_document(sa), b.config_document(sb));
    }
  }

  #[test]
  fn device_class_serializes_snake_case() {
    let mut a = announcer();
    a.sensors[0].device_class = Some(DeviceClass::Voltage);
    let doc = a.config_document(&a.sensors[0]);
    assert_eq!(doc["device_class"], "voltage");
  }
}
