//! Pylontech RS485 protocol: frame codec, response decoders and the stack
//! poller.

pub mod alarm;
pub mod analog;
pub mod frame;
pub mod hex;
pub mod poller;
pub mod stack;

pub use alarm::AlarmInfo;
pub use analog::AnalogValues;
pub use frame::{Command, FrameError, ReturnCode};
pub use poller::{PollError, Rs485Poller};
pub use stack::{aggregate, ModuleReading, StackSummary};

use crate::discovery::{DeviceClass, SensorDescriptor, StateClass};

/// Decode an INFO field carrying ASCII text as hex pairs (manufacturer,
/// firmware and serial responses). Unparseable or unprintable pairs end the
/// string.
pub fn decode_ascii(info: &str) -> String {
  let mut out = String::new();
  let mut cur = hex::HexCursor::new(info);
  while let Some(byte) = cur.u8() {
    match byte {
      0x20..=0x7E => out.push(byte as char),
      _ => break,
    }
  }
  out.trim().to_string()
}

/// Sensors the RS485 bridge announces: a block per module plus the stack
/// roll-up.
pub fn sensor_schema(modules: u8, cells_per_module: u8, temps_per_module: u8) -> Vec<SensorDescriptor> {
  let mut sensors = Vec::new();

  for module in 0..modules {
    let group = format!("battery{module}");
    let named = |suffix: &str| (format!("{group}_{suffix}"), format!("{group}/{suffix}"));

    for cell in 1..=cells_per_module {
      let (name, topic) = named(&format!("cell{cell:02}"));
      sensors.push(
        SensorDescriptor::sensor(name, format!("Battery {module} Cell {cell}"), topic)
          .unit("V")
          .device_class(DeviceClass::Voltage)
          .measurement()
          .precision(3),
      );
    }
    for temp in 1..=temps_per_module {
      let (name, topic) = named(&format!("temp{temp}"));
      sensors.push(
        SensorDescriptor::sensor(name, format!("Battery {module} Temperature {temp}"), topic)
          .unit("°C")
          .device_class(DeviceClass::Temperature)
          .measurement()
          .precision(1),
      );
    }

    let (name, topic) = named("cell_min");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Cell Min"), topic)
        .unit("V")
        .device_class(DeviceClass::Voltage)
        .measurement()
        .precision(3),
    );
    let (name, topic) = named("cell_max");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Cell Max"), topic)
        .unit("V")
        .device_class(DeviceClass::Voltage)
        .measurement()
        .precision(3),
    );
    let (name, topic) = named("cell_delta_mv");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Cell Delta"), topic)
        .unit("mV")
        .measurement()
        .icon("mdi:chart-bell-curve-cumulative")
        .precision(0),
    );
    let (name, topic) = named("current");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Current"), topic)
        .unit("A")
        .device_class(DeviceClass::Current)
        .measurement()
        .precision(2),
    );
    let (name, topic) = named("voltage");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Voltage"), topic)
        .unit("V")
        .device_class(DeviceClass::Voltage)
        .measurement()
        .precision(2),
    );
    let (name, topic) = named("terminal_voltage");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Terminal Voltage"), topic)
        .unit("V")
        .device_class(DeviceClass::Voltage)
        .measurement()
        .precision(2),
    );
    let (name, topic) = named("remain_ah");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Remaining Capacity"), topic)
        .unit("Ah")
        .measurement()
        .icon("mdi:battery-arrow-down")
        .precision(1),
    );
    let (name, topic) = named("total_ah");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Total Capacity"), topic)
        .unit("Ah")
        .measurement()
        .icon("mdi:battery")
        .precision(1),
    );
    let (name, topic) = named("soc");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} SOC"), topic)
        .unit("%")
        .device_class(DeviceClass::Battery)
        .measurement()
        .precision(1),
    );
    let (name, topic) = named("cycles");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Cycles"), topic)
        .state_class(StateClass::TotalIncreasing)
        .icon("mdi:counter")
        .precision(0),
    );
    let (name, topic) = named("op_state");
    sensors
      .push(SensorDescriptor::sensor(name, format!("Battery {module} State"), topic).icon("mdi:state-machine"));
    let (name, topic) = named("alarms");
    sensors.push(SensorDescriptor::sensor(name, format!("Battery {module} Alarms"), topic).icon("mdi:alert"));
    let (name, topic) = named("balancing");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Balancing Count"), topic)
        .icon("mdi:scale-balance")
        .precision(0),
    );
    let (name, topic) = named("balancing_cells");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Balancing Cells"), topic)
        .icon("mdi:scale-balance"),
    );
    let (name, topic) = named("balancing_cells_cw");
    sensors.push(
      SensorDescriptor::sensor(name, format!("Battery {module} Balancing Cells (alt)"), topic)
        .icon("mdi:scale-balance"),
    );
    let (name, topic) = named("balancing_active");
    sensors.push(
      SensorDescriptor::binary_sensor(name, format!("Battery {module} Balancing"), topic)
        .icon("mdi:scale-balance"),
    );
  }

  sensors.push(
    SensorDescriptor::sensor("stack_voltage", "Stack Voltage", "stack/voltage")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(2),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_current", "Stack Current", "stack/current")
      .unit("A")
      .device_class(DeviceClass::Current)
      .measurement()
      .precision(2),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_cell_min", "Stack Cell Min", "stack/cell_min")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(3),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_cell_max", "Stack Cell Max", "stack/cell_max")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(3),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_cell_delta_mv", "Stack Cell Delta", "stack/cell_delta_mv")
      .unit("mV")
      .measurement()
      .icon("mdi:chart-bell-curve-cumulative")
      .precision(0),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_temp_min", "Stack Min Temperature", "stack/temp_min")
      .unit("°C")
      .device_class(DeviceClass::Temperature)
      .measurement()
      .precision(1),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_temp_max", "Stack Max Temperature", "stack/temp_max")
      .unit("°C")
      .device_class(DeviceClass::Temperature)
      .measurement()
      .precision(1),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_balancing", "Stack Balancing Count", "stack/balancing")
      .icon("mdi:scale-balance")
      .precision(0),
  );
  sensors.push(
    SensorDescriptor::sensor("stack_balancing_cells", "Stack Balancing Cells", "stack/balancing_cells")
      .icon("mdi:scale-balance"),
  );
  sensors.push(SensorDescriptor::sensor("stack_alarms", "Stack Alarms", "stack/alarms").icon("mdi:alert"));

  sensors
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ascii_decode() {
    assert_eq!(decode_ascii("50594C4F4E54454348"), "PYLONTECH");
    assert_eq!(decode_ascii("56312E30"), "V1.0");
    // NUL padding ends the string.
    assert_eq!(decode_ascii("414200DEAD"), "AB");
    assert_eq!(decode_ascii(""), "");
  }

  #[test]
  fn schema_names_are_unique() {
    let schema = sensor_schema(3, 16, 4);
    let mut names: Vec<&str> = schema.iter().map(|d| d.name.as_str()).collect();
    let len = names.len();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), len);
  }

  #[test]
  fn schema_scales_with_module_count() {
    let one = sensor_schema(1, 16, 4).len();
    let three = sensor_schema(3, 16, 4).len();
    // Ten stack sensors are shared; the per-module block repeats.
    assert_eq!(three - one, 2 * (one - 10));
    assert!(sensor_schema(1, 16, 4)
      .iter()
      .any(|d| d.state_topic == "battery0/cell16"));
  }
}
