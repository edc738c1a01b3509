//! Static sensor metadata published to the consumer.
//!
//! Every bridge declares its sensors once as [`SensorDescriptor`] values; the
//! announcer renders them into retained discovery documents. The unique id of
//! a sensor is part of the public contract and must never change once
//! published, so its derivation lives here and is purely a function of its
//! inputs.

use serde::Serialize;

/// Home-Assistant device class of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
  Voltage,
  Current,
  Power,
  Energy,
  Temperature,
  Frequency,
  Battery,
}

/// Downstream aggregation semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
  Measurement,
  TotalIncreasing,
}

/// Discovery entity kind; selects the config topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
  Sensor,
  BinarySensor,
}

impl EntityKind {
  pub fn topic_segment(self) -> &'static str {
    match self {
      EntityKind::Sensor => "sensor",
      EntityKind::BinarySensor => "binary_sensor",
    }
  }
}

/// The logical physical device a bridge represents. All sensors of one bridge
/// share one identifier so the consumer groups them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
  pub id: String,
  pub name: String,
  pub manufacturer: String,
  pub model: String,
}

/// Identity scheme of a predecessor integration. When configured, sensors
/// with a mapped display name inherit its unique ids so the consumer keeps
/// their history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyIdentity {
  pub prefix: String,
  pub serial: String,
}

/// Static description of one exposed sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
  /// Stable snake_case name, unique within the bridge.
  pub name: String,
  /// Human-readable name shown by the consumer.
  pub display_name: String,
  /// State topic relative to the bridge prefix.
  pub state_topic: String,
  pub entity_kind: EntityKind,
  pub unit: Option<String>,
  pub device_class: Option<DeviceClass>,
  pub state_class: Option<StateClass>,
  pub icon: Option<String>,
  pub display_precision: Option<u8>,
  /// Explicit unique id carried over from a predecessor system.
  pub legacy_unique_id: Option<String>,
}

impl SensorDescriptor {
  /// Plain measurement sensor; the common case.
  pub fn sensor(name: impl Into<String>, display_name: impl Into<String>, state_topic: impl Into<String>) -> Self {
    SensorDescriptor {
      name: name.into(),
      display_name: display_name.into(),
      state_topic: state_topic.into(),
      entity_kind: EntityKind::Sensor,
      unit: None,
      device_class: None,
      state_class: None,
      icon: None,
      display_precision: None,
      legacy_unique_id: None,
    }
  }

  pub fn binary_sensor(name: impl Into<String>, display_name: impl Into<String>, state_topic: impl Into<String>) -> Self {
    SensorDescriptor {
      entity_kind: EntityKind::BinarySensor,
      ..Self::sensor(name, display_name, state_topic)
    }
  }

  pub fn unit(mut self, unit: &str) -> Self {
    self.unit = Some(unit.to_string());
    self
  }

  pub fn device_class(mut self, class: DeviceClass) -> Self {
    self.device_class = Some(class);
    self
  }

  pub fn state_class(mut self, class: StateClass) -> Self {
    self.state_class = Some(class);
    self
  }

  pub fn icon(mut self, icon: &str) -> Self {
    self.icon = Some(icon.to_string());
    self
  }

  pub fn precision(mut self, digits: u8) -> Self {
    self.display_precision = Some(digits);
    self
  }

  pub fn legacy_id(mut self, id: &str) -> Self {
    self.legacy_unique_id = Some(id.to_string());
    self
  }

  pub fn measurement(self) -> Self {
    self.state_class(StateClass::Measurement)
  }
}

/// Resolve the published unique id of a sensor.
///
/// Priority: the descriptor's explicit legacy id, then the legacy-identity
/// scheme when one is configured and `legacy_name` maps this sensor, then the
/// derived `<device_id>_<name>` form. Deterministic and side-effect free.
pub fn resolve_unique_id(
  descriptor: &SensorDescriptor,
  device: &DeviceInfo,
  legacy: Option<&LegacyIdentity>,
  legacy_name: Option<&str>,
) -> String {
  if let Some(explicit) = &descriptor.legacy_unique_id {
    return explicit.clone();
  }
  if let (Some(identity), Some(name)) = (legacy, legacy_name) {
    return format!("{}_{}_{}", identity.prefix, identity.serial, name);
  }
  format!("{}_{}", device.id, descriptor.name)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn device() -> DeviceInfo {
    DeviceInfo {
      id: "deye_inverter".into(),
      name: "Deye Inverter".into(),
      manufacturer: "Deye".into(),
      model: "SUN-12K-SG04LP3-EU".into(),
    }
  }

  #[test]
  fn explicit_legacy_id_wins() {
    let desc = SensorDescriptor::sensor("battery_soc", "Battery SOC", "battery_soc")
      .legacy_id("deye-tcp-battery-soc");
    let legacy = LegacyIdentity {
      prefix: "deye".into(),
      serial: "2957831690".into(),
    };
    assert_eq!(
      resolve_unique_id(&desc, &device(), Some(&legacy), Some("Battery SOC")),
      "deye-tcp-battery-soc"
    );
  }

  #[test]
  fn legacy_scheme_applies_only_with_a_mapping() {
    let desc = SensorDescriptor::sensor("pv1_power", "PV1 Power", "pv1_power");
    let legacy = LegacyIdentity {
      prefix: "deye".into(),
      serial: "2957831690".into(),
    };
    assert_eq!(
      resolve_unique_id(&desc, &device(), Some(&legacy), Some("PV1 Power")),
      "deye_2957831690_PV1 Power"
    );
    assert_eq!(
      resolve_unique_id(&desc, &device(), Some(&legacy), None),
      "deye_inverter_pv1_power"
    );
    assert_eq!(
      resolve_unique_id(&desc, &device(), None, Some("PV1 Power")),
      "deye_inverter_pv1_power"
    );
  }
}
