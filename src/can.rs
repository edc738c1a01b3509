//! Decoder for the Pylontech-profile CAN BMS frames.
//!
//! The BMS emits a small fixed set of 11-bit arbitration ids with 8-byte
//! payloads of little-endian integers. Decoded fields are checked against
//! physical sanity windows; anything outside is dropped silently, which
//! matters right after a BMS reset when the bus carries all-zero frames for a
//! few seconds.

use byteorder::{ByteOrder, LittleEndian};

use crate::discovery::{DeviceClass, SensorDescriptor};
use crate::value::round_to;

pub const ID_LIMITS: u32 = 0x351;
pub const ID_STATE: u32 = 0x355;
pub const ID_FLAGS: u32 = 0x359;
pub const ID_EXTREMES: u32 = 0x370;

// Sanity windows.
const TEMP_MIN_C: f64 = -10.0;
const TEMP_MAX_C: f64 = 50.0;
const CELL_V_MIN: f64 = 2.0;
const CELL_V_MAX: f64 = 4.5;
const PACK_V_MIN: f64 = 30.0;
const PACK_V_MAX: f64 = 65.0;
const CURRENT_MAX_ABS: f64 = 500.0;

/// One decoded BMS frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BmsFrame {
  /// 0x351: charge/discharge envelope the BMS requests from the inverter.
  Limits {
    charge_voltage_max: f64,
    charge_current_limit: f64,
    discharge_current_limit: f64,
    voltage_low_limit: f64,
  },
  /// 0x355: state of charge / health in percent.
  State { soc: u16, soh: u16 },
  /// 0x359: raw status bitfield.
  Flags { flags: u64 },
  /// 0x370: temperature and cell-voltage extremes.
  Extremes {
    temp_min: f64,
    temp_max: f64,
    cell_min: f64,
    cell_max: f64,
  },
}

fn in_window(v: f64, min: f64, max: f64) -> bool {
  (min..=max).contains(&v)
}

/// Decode one frame. `None` for unknown ids, short payloads and values
/// outside the sanity windows.
pub fn decode(id: u32, data: &[u8]) -> Option<BmsFrame> {
  if data.len() != 8 {
    return None;
  }
  match id {
    ID_LIMITS => {
      let charge_voltage_max = f64::from(LittleEndian::read_u16(&data[0..2])) / 10.0;
      let charge_current_limit = f64::from(LittleEndian::read_u16(&data[2..4])) / 10.0;
      let discharge_current_limit = f64::from(LittleEndian::read_u16(&data[4..6])) / 10.0;
      let voltage_low_limit = f64::from(LittleEndian::read_u16(&data[6..8])) / 10.0;
      if !in_window(charge_voltage_max, PACK_V_MIN, PACK_V_MAX)
        || !in_window(voltage_low_limit, PACK_V_MIN, PACK_V_MAX)
        || !in_window(charge_current_limit, 0.0, CURRENT_MAX_ABS)
        || !in_window(discharge_current_limit, 0.0, CURRENT_MAX_ABS)
      {
        return None;
      }
      Some(BmsFrame::Limits {
        charge_voltage_max: round_to(charge_voltage_max, 1),
        charge_current_limit: round_to(charge_current_limit, 1),
        discharge_current_limit: round_to(discharge_current_limit, 1),
        voltage_low_limit: round_to(voltage_low_limit, 1),
      })
    }
    ID_STATE => {
      let soc = LittleEndian::read_u16(&data[0..2]);
      let soh = LittleEndian::read_u16(&data[2..4]);
      if soc > 100 || soh > 100 {
        return None;
      }
      Some(BmsFrame::State { soc, soh })
    }
    ID_FLAGS => Some(BmsFrame::Flags {
      flags: LittleEndian::read_u64(data),
    }),
    ID_EXTREMES => {
      let t1 = f64::from(LittleEndian::read_u16(&data[0..2])) / 10.0;
      let t2 = f64::from(LittleEndian::read_u16(&data[2..4])) / 10.0;
      let (temp_min, temp_max) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
      if !in_window(temp_min, TEMP_MIN_C, TEMP_MAX_C) || !in_window(temp_max, TEMP_MIN_C, TEMP_MAX_C) {
        return None;
      }
      let v1 = f64::from(LittleEndian::read_u16(&data[4..6])) / 1000.0;
      let v2 = f64::from(LittleEndian::read_u16(&data[6..8])) / 1000.0;
      // Cells settle one at a time after a reset; keep whichever are
      // plausible and derive the extremes from the survivors.
      let candidates: Vec<f64> = [v1, v2]
        .into_iter()
        .filter(|&v| in_window(v, CELL_V_MIN, CELL_V_MAX))
        .collect();
      let cell_min = candidates.iter().copied().reduce(f64::min)?;
      let cell_max = candidates.iter().copied().reduce(f64::max)?;
      Some(BmsFrame::Extremes {
        temp_min: round_to(temp_min, 1),
        temp_max: round_to(temp_max, 1),
        cell_min: round_to(cell_min, 3),
        cell_max: round_to(cell_max, 3),
      })
    }
    _ => None,
  }
}

/// Render the 0x359 bitfield the way it appears on the state topic.
pub fn flags_payload(flags: u64) -> String {
  format!("0x{flags:016X}")
}

/// Sensors this bridge announces.
pub fn sensor_schema() -> Vec<SensorDescriptor> {
  vec![
    SensorDescriptor::sensor("soc", "BMS SOC", "soc")
      .unit("%")
      .measurement()
      .icon("mdi:battery")
      .precision(0),
    SensorDescriptor::sensor("soh", "BMS SOH", "soh")
      .unit("%")
      .measurement()
      .icon("mdi:battery-heart")
      .precision(0),
    SensorDescriptor::sensor("v_charge_max", "BMS Charge Voltage Max", "limit/v_charge_max")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("v_low", "BMS Low Voltage Limit", "limit/v_low")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("i_charge", "BMS Charge Current Limit", "limit/i_charge")
      .unit("A")
      .device_class(DeviceClass::Current)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("i_discharge", "BMS Discharge Current Limit", "limit/i_discharge")
      .unit("A")
      .device_class(DeviceClass::Current)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("cell_v_min", "Cell Min Voltage", "ext/cell_v_min")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(3),
    SensorDescriptor::sensor("cell_v_max", "Cell Max Voltage", "ext/cell_v_max")
      .unit("V")
      .device_class(DeviceClass::Voltage)
      .measurement()
      .precision(3),
    SensorDescriptor::sensor("cell_v_delta", "Cell Delta Voltage", "ext/cell_v_delta")
      .unit("V")
      .measurement()
      .icon("mdi:chart-bell-curve-cumulative")
      .precision(3),
    SensorDescriptor::sensor("temp_min", "Min Temperature", "ext/temp_min")
      .unit("°C")
      .device_class(DeviceClass::Temperature)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("temp_max", "Max Temperature", "ext/temp_max")
      .unit("°C")
      .device_class(DeviceClass::Temperature)
      .measurement()
      .precision(1),
    SensorDescriptor::sensor("flags", "BMS Flags", "flags").icon("mdi:flag"),
  ]
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test]
  fn limits_frame_decodes() {
    // 486, 300, 300, 500 -> 48.6 V, 30.0 A, 30.0 A, 50.0 V
    let data = [0xE6, 0x01, 0x2C, 0x01, 0x2C, 0x01, 0xF4, 0x01];
    assert_eq!(
      decode(ID_LIMITS, &data),
      Some(BmsFrame::Limits {
        charge_voltage_max: 48.6,
        charge_current_limit: 30.0,
        discharge_current_limit: 30.0,
        voltage_low_limit: 50.0,
      })
    );
  }

  #[test]
  fn post_reset_zero_frame_is_dropped() {
    assert_eq!(decode(ID_LIMITS, &[0u8; 8]), None);
    assert_eq!(decode(ID_EXTREMES, &[0u8; 8]), None);
  }

  #[test]
  fn state_frame_bounds() {
    assert_eq!(
      decode(ID_STATE, &[80, 0, 99, 0, 0, 0, 0, 0]),
      Some(BmsFrame::State { soc: 80, soh: 99 })
    );
    assert_eq!(decode(ID_STATE, &[101, 0, 99, 0, 0, 0, 0, 0]), None);
  }

  #[test]
  fn flags_frame_renders_big_endian_hex() {
    let frame = decode(ID_FLAGS, &[0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00]).unwrap();
    match frame {
      BmsFrame::Flags { flags } => assert_eq!(flags_payload(flags), "0x00000000DEADBEEF"),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn extremes_orders_temps_and_filters_cells() {
    // t1=25.3, t2=18.0; v1=3.312, v2 out of window (0.1).
    let mut data = [0u8; 8];
    LittleEndian::write_u16(&mut data[0..2], 253);
    LittleEndian::write_u16(&mut data[2..4], 180);
    LittleEndian::write_u16(&mut data[4..6], 3312);
    LittleEndian::write_u16(&mut data[6..8], 100);
    assert_eq!(
      decode(ID_EXTREMES, &data),
      Some(BmsFrame::Extremes {
        temp_min: 18.0,
        temp_max: 25.3,
        cell_min: 3.312,
        cell_max: 3.312,
      })
    );
  }

  #[test_case(999, 250 ; "temperature above window")]
  #[test_case(250, 65436 ; "implausible raw temperature")]
  fn extremes_out_of_window_temps_drop_the_frame(t1: u16, t2: u16) {
    let mut data = [0u8; 8];
    LittleEndian::write_u16(&mut data[0..2], t1);
    LittleEndian::write_u16(&mut data[2..4], t2);
    LittleEndian::write_u16(&mut data[4..6], 3312);
    LittleEndian::write_u16(&mut data[6..8], 3315);
    assert_eq!(decode(ID_EXTREMES, &data), None);
  }

  #[test]
  fn unknown_id_and_short_payload() {
    assert_eq!(decode(0x371, &[0u8; 8]), None);
    assert_eq!(decode(ID_STATE, &[80, 0, 99, 0]), None);
  }
}
