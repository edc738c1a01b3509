//! Modbus-TCP register scanner for the Deye SG04LP3 hybrid inverter.
//!
//! Registers are declared once in [`DEYE_SG04LP3_REGISTERS`] with their
//! decoding, scaling and scan cadence. The poller walks the table on a tick
//! counter: the `fast` group every tick, `normal` every third, `slow` every
//! sixth. A register that fails to read is dropped from the cycle; only
//! transport-level errors abort the poll and bounce the connection.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio_modbus::client::sync::{tcp, Context, Reader};
use tokio_modbus::Slave;

use crate::discovery::{DeviceClass, SensorDescriptor, StateClass};
use crate::value::round_to;

#[derive(Debug, Error)]
pub enum ModbusError {
  #[error("cannot resolve modbus target {0}")]
  Resolve(String),
  #[error("modbus transport error: {0}")]
  Transport(#[from] tokio_modbus::Error),
  #[error("modbus I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Scan cadence class of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanGroup {
  Fast,
  Normal,
  Slow,
}

impl ScanGroup {
  /// Whether this group is polled on the given tick.
  pub fn due(self, tick: u64) -> bool {
    match self {
      ScanGroup::Fast => true,
      ScanGroup::Normal => tick % 3 == 0,
      ScanGroup::Slow => tick % 6 == 0,
    }
  }

  /// Publish-side rate limit for values in this group.
  pub fn min_publish_interval(self) -> Duration {
    match self {
      ScanGroup::Fast => Duration::from_secs(5),
      ScanGroup::Normal => Duration::from_secs(15),
      ScanGroup::Slow => Duration::from_secs(30),
    }
  }
}

/// Wire encoding of a register value. The 32-bit forms span two consecutive
/// registers with the low word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
  Signed16,
  Unsigned16,
  Signed32LswFirst,
  Unsigned32LswFirst,
}

impl Encoding {
  pub fn word_count(self) -> u16 {
    match self {
      Encoding::Signed16 | Encoding::Unsigned16 => 1,
      Encoding::Signed32LswFirst | Encoding::Unsigned32LswFirst => 2,
    }
  }

  /// Assemble the raw integer from the words read off the wire.
  pub fn decode(self, words: &[u16]) -> Option<i64> {
    match self {
      Encoding::Signed16 => Some(i64::from(*words.first()? as i16)),
      Encoding::Unsigned16 => Some(i64::from(*words.first()?)),
      Encoding::Signed32LswFirst => {
        let raw = u32::from(*words.first()?) | (u32::from(*words.get(1)?) << 16);
        Some(i64::from(raw as i32))
      }
      Encoding::Unsigned32LswFirst => {
        let raw = u32::from(*words.first()?) | (u32::from(*words.get(1)?) << 16);
        Some(i64::from(raw))
      }
    }
  }
}

/// One holding register and everything needed to decode and announce it.
#[derive(Debug)]
pub struct RegisterDef {
  pub address: u16,
  pub name: &'static str,
  pub unit: Option<&'static str>,
  pub scale: f64,
  pub offset: f64,
  pub encoding: Encoding,
  pub device_class: Option<DeviceClass>,
  pub state_class: Option<StateClass>,
  pub icon: Option<&'static str>,
  pub scan_group: ScanGroup,
  pub legacy_unique_id: Option<&'static str>,
}

impl RegisterDef {
  /// Raw-to-engineering conversion, rounded for publish stability.
  pub fn scaled(&self, raw: i64) -> f64 {
    round_to(raw as f64 * self.scale + self.offset, 3)
  }
}

#[allow(clippy::too_many_arguments)]
const fn r(
  address: u16,
  name: &'static str,
  unit: Option<&'static str>,
  scale: f64,
  offset: f64,
  encoding: Encoding,
  device_class: Option<DeviceClass>,
  state_class: Option<StateClass>,
  icon: Option<&'static str>,
  scan_group: ScanGroup,
  legacy_unique_id: Option<&'static str>,
) -> RegisterDef {
  RegisterDef {
    address,
    name,
    unit,
    scale,
    offset,
    encoding,
    device_class,
    state_class,
    icon,
    scan_group,
    legacy_unique_id,
  }
}

use self::Encoding as E;
use self::ScanGroup as G;
use crate::discovery::DeviceClass as D;
use crate::discovery::StateClass as S;

/// Holding-register map of the Deye SG04LP3 family (addresses in decimal).
#[rustfmt::skip]
pub const DEYE_SG04LP3_REGISTERS: &[RegisterDef] = &[
  // Solar / PV
  r(672, "pv1_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Fast, Some("deye-tcp-pv1-power")),
  r(673, "pv2_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Fast, Some("deye-tcp-pv2-power")),
  r(676, "pv1_voltage", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(678, "pv2_voltage", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(677, "pv1_current", Some("A"), 0.1, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),
  r(679, "pv2_current", Some("A"), 0.1, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),
  r(529, "daily_production", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(534, "total_production", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),

  // Battery
  r(99, "battery_equalization_voltage", Some("V"), 0.01, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(100, "battery_absorption_voltage", Some("V"), 0.01, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(101, "battery_float_voltage", Some("V"), 0.01, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(102, "battery_capacity_setting", Some("Ah"), 1.0, 0.0, E::Unsigned16, None, Some(S::Measurement), Some("mdi:battery"), G::Slow, None),
  r(108, "battery_max_charge_current", Some("A"), 1.0, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Slow, None),
  r(109, "battery_max_discharge_current", Some("A"), 1.0, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Slow, None),
  r(514, "daily_battery_charge", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(515, "daily_battery_discharge", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(516, "total_battery_charge", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),
  r(518, "total_battery_discharge", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),
  r(586, "battery_temperature", Some("°C"), 0.1, -100.0, E::Signed16, Some(D::Temperature), Some(S::Measurement), None, G::Normal, None),
  r(587, "battery_voltage", Some("V"), 0.01, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(588, "battery_soc", Some("%"), 1.0, 0.0, E::Unsigned16, Some(D::Battery), Some(S::Measurement), None, G::Normal, Some("deye-tcp-battery-soc")),
  r(590, "battery_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Fast, Some("deye-tcp-battery-power")),
  r(591, "battery_current", Some("A"), 0.01, 0.0, E::Signed16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),

  // Grid
  r(598, "grid_voltage_l1", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(599, "grid_voltage_l2", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(600, "grid_voltage_l3", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(638, "grid_frequency", Some("Hz"), 0.01, 0.0, E::Unsigned16, Some(D::Frequency), Some(S::Measurement), None, G::Fast, Some("deye-tcp-grid-frequency1")),
  r(625, "total_grid_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Fast, Some("deye-tcp-total-grid-power")),
  r(604, "grid_power_ct_l1", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(605, "grid_power_ct_l2", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(606, "grid_power_ct_l3", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(616, "grid_power_ext_ct_l1", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(617, "grid_power_ext_ct_l2", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(618, "grid_power_ext_ct_l3", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(520, "daily_energy_bought", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(522, "total_energy_bought", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),
  r(521, "daily_energy_sold", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(524, "total_energy_sold", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),

  // Load
  r(653, "total_load_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Fast, Some("deye-tcp-total-load-power")),
  r(650, "load_power_l1", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(651, "load_power_l2", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(652, "load_power_l3", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(644, "load_voltage_l1", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(645, "load_voltage_l2", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(646, "load_voltage_l3", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Normal, None),
  r(526, "daily_load_consumption", Some("kWh"), 0.1, 0.0, E::Unsigned16, Some(D::Energy), Some(S::TotalIncreasing), None, G::Normal, None),
  r(527, "total_load_consumption", Some("kWh"), 0.1, 0.0, E::Unsigned32LswFirst, Some(D::Energy), Some(S::TotalIncreasing), None, G::Slow, None),

  // Inverter output
  r(630, "inverter_current_l1", Some("A"), 0.01, 0.0, E::Signed16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),
  r(631, "inverter_current_l2", Some("A"), 0.01, 0.0, E::Signed16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),
  r(632, "inverter_current_l3", Some("A"), 0.01, 0.0, E::Signed16, Some(D::Current), Some(S::Measurement), None, G::Normal, None),
  r(633, "inverter_power_l1", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(634, "inverter_power_l2", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(635, "inverter_power_l3", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Normal, None),
  r(636, "inverter_frequency", Some("Hz"), 0.01, 0.0, E::Unsigned16, Some(D::Frequency), Some(S::Measurement), None, G::Normal, None),

  // Temperatures
  r(540, "dc_temperature", Some("°C"), 0.1, -100.0, E::Signed16, Some(D::Temperature), Some(S::Measurement), None, G::Normal, None),
  r(541, "ac_temperature", Some("°C"), 0.1, -100.0, E::Signed16, Some(D::Temperature), Some(S::Measurement), None, G::Normal, None),

  // Limits the inverter received from the BMS
  r(212, "bms_charge_current_limit", Some("A"), 1.0, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Normal, Some("deye-tcp-bms-charge-current")),
  r(213, "bms_discharge_current_limit", Some("A"), 1.0, 0.0, E::Unsigned16, Some(D::Current), Some(S::Measurement), None, G::Normal, Some("deye-tcp-bms-discharge-current")),

  // Settings, read-only monitoring
  r(143, "max_sell_power", Some("W"), 1.0, 0.0, E::Unsigned16, Some(D::Power), Some(S::Measurement), None, G::Slow, Some("deye-tcp-max-sell-power")),
  r(142, "sell_mode_enabled", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:transmission-tower-export"), G::Slow, None),

  // Generator port
  r(661, "gen_voltage_l1", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(662, "gen_voltage_l2", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(663, "gen_voltage_l3", Some("V"), 0.1, 0.0, E::Unsigned16, Some(D::Voltage), Some(S::Measurement), None, G::Slow, None),
  r(664, "gen_power_l1", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Slow, None),
  r(665, "gen_power_l2", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Slow, None),
  r(666, "gen_power_l3", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Slow, None),
  r(667, "gen_total_power", Some("W"), 1.0, 0.0, E::Signed16, Some(D::Power), Some(S::Measurement), None, G::Slow, None),

  // Status and alert codes
  r(552, "running_status", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:state-machine"), G::Normal, None),
  r(553, "alert_code_1", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
  r(554, "alert_code_2", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
  r(555, "alert_code_3", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
  r(556, "alert_code_4", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
  r(557, "alert_code_5", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
  r(558, "alert_code_6", None, 1.0, 0.0, E::Unsigned16, None, None, Some("mdi:alert"), G::Slow, None),
];

/// Sensor names whose history predates this bridge, keyed to the display
/// names of the Solarman logger integration they were recorded under.
pub const SOLARMAN_NAMES: &[(&str, &str)] = &[
  ("pv1_power", "PV1 Power"),
  ("pv2_power", "PV2 Power"),
  ("pv1_voltage", "PV1 Voltage"),
  ("pv2_voltage", "PV2 Voltage"),
  ("pv1_current", "PV1 Current"),
  ("pv2_current", "PV2 Current"),
  ("daily_production", "Daily Production"),
  ("total_production", "Total Production"),
  ("battery_temperature", "Battery Temperature"),
  ("battery_voltage", "Battery Voltage"),
  ("battery_soc", "Battery SOC"),
  ("battery_power", "Battery Power"),
  ("battery_current", "Battery Current"),
  ("daily_battery_charge", "Daily Battery Charge"),
  ("daily_battery_discharge", "Daily Battery Discharge"),
  ("total_battery_charge", "Total Battery Charge"),
  ("total_battery_discharge", "Total Battery Discharge"),
  ("grid_voltage_l1", "Grid Voltage L1"),
  ("grid_voltage_l2", "Grid Voltage L2"),
  ("grid_voltage_l3", "Grid Voltage L3"),
  ("grid_frequency", "Grid Frequency"),
  ("total_grid_power", "Total Grid Power"),
  ("grid_power_ct_l1", "Grid CT L1 Power"),
  ("grid_power_ct_l2", "Grid CT L2 Power"),
  ("grid_power_ct_l3", "Grid CT L3 Power"),
  ("grid_power_ext_ct_l1", "External CT L1 Power"),
  ("grid_power_ext_ct_l2", "External CT L2 Power"),
  ("grid_power_ext_ct_l3", "External CT L3 Power"),
  ("daily_energy_bought", "Daily Energy Bought"),
  ("daily_energy_sold", "Daily Energy Sold"),
  ("total_energy_bought", "Total Energy Bought"),
  ("total_energy_sold", "Total Energy Sold"),
  ("total_load_power", "Total Load Power"),
  ("load_power_l1", "Load L1 Power"),
  ("load_power_l2", "Load L2 Power"),
  ("load_power_l3", "Load L3 Power"),
  ("load_voltage_l1", "Load Voltage L1"),
  ("load_voltage_l2", "Load Voltage L2"),
  ("load_voltage_l3", "Load Voltage L3"),
  ("daily_load_consumption", "Daily Load Consumption"),
  ("total_load_consumption", "Total Load Consumption"),
  ("inverter_current_l1", "Inverter L1 Current"),
  ("inverter_current_l2", "Inverter L2 Current"),
  ("inverter_current_l3", "Inverter L3 Current"),
  ("inverter_power_l1", "Inverter L1 Power"),
  ("inverter_power_l2", "Inverter L2 Power"),
  ("inverter_power_l3", "Inverter L3 Power"),
  ("inverter_frequency", "Inverter Frequency"),
  ("dc_temperature", "DC Temperature"),
  ("ac_temperature", "AC Temperature"),
];

/// Solarman display name for a register, when its history is preserved.
pub fn solarman_name(register_name: &str) -> Option<&'static str> {
  SOLARMAN_NAMES
    .iter()
    .find(|(name, _)| *name == register_name)
    .map(|(_, mapped)| *mapped)
}

fn title_case(name: &str) -> String {
  name
    .split('_')
    .map(|word| {
      let mut chars = word.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

/// Sensors this bridge announces, one per register.
pub fn sensor_schema(registers: &[RegisterDef]) -> Vec<SensorDescriptor> {
  registers
    .iter()
    .map(|reg| {
      let mut desc = SensorDescriptor::sensor(reg.name, title_case(reg.name), reg.name);
      desc.unit = reg.unit.map(str::to_string);
      desc.device_class = reg.device_class;
      desc.state_class = reg.state_class;
      desc.icon = reg.icon.map(str::to_string);
      desc.legacy_unique_id = reg.legacy_unique_id.map(str::to_string);
      // Display precision follows the scale resolution.
      if reg.scale <= 0.01 {
        desc.display_precision = Some(2);
      } else if reg.scale < 1.0 {
        desc.display_precision = Some(1);
      }
      desc
    })
    .collect()
}

/// Blocking Modbus-TCP poller; owns the connection.
pub struct ModbusPoller {
  ctx: Context,
  tick: u64,
}

impl ModbusPoller {
  /// Connect to the gateway. Hostnames are resolved here; the first address
  /// wins.
  pub fn connect(host: &str, port: u16, unit: u8) -> Result<Self, ModbusError> {
    let target: SocketAddr = (host, port)
      .to_socket_addrs()?
      .next()
      .ok_or_else(|| ModbusError::Resolve(format!("{host}:{port}")))?;
    let ctx = tcp::connect_slave(target, Slave(unit))?;
    info!("connected to modbus gateway at {target}, unit {unit}");
    Ok(ModbusPoller { ctx, tick: 0 })
  }

  /// Read one register. `Ok(None)` when the device answers with an exception
  /// for this register; transport errors propagate.
  pub fn read_register(&mut self, reg: &RegisterDef) -> Result<Option<f64>, ModbusError> {
    let words = match self
      .ctx
      .read_holding_registers(reg.address, reg.encoding.word_count())?
    {
      Ok(words) => words,
      Err(exception) => {
        debug!("register {} ({}): {exception}", reg.address, reg.name);
        return Ok(None);
      }
    };
    Ok(reg.encoding.decode(&words).map(|raw| reg.scaled(raw)))
  }

  /// Poll every register whose scan group is due this tick. Register-level
  /// failures are dropped from the result; the cycle carries on.
  pub fn poll_cycle<'a>(
    &mut self,
    registers: &'a [RegisterDef],
  ) -> Result<Vec<(&'a RegisterDef, f64)>, ModbusError> {
    let tick = self.tick;
    self.tick = self.tick.wrapping_add(1);

    let mut values = Vec::new();
    for reg in registers.iter().filter(|reg| reg.scan_group.due(tick)) {
      if let Some(value) = self.read_register(reg)? {
        values.push((reg, value));
      }
    }
    trace!("tick {tick}: {} registers read", values.len());
    Ok(values)
  }
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test_case(&[0x0000], E::Signed16, 0 ; "signed zero")]
  #[test_case(&[0x8000], E::Signed16, -32768 ; "signed minimum")]
  #[test_case(&[0xFFFF], E::Signed16, -1 ; "signed minus one")]
  #[test_case(&[0xFFFF], E::Unsigned16, 65535 ; "unsigned max")]
  #[test_case(&[0xFFFF, 0x0000], E::Unsigned32LswFirst, 65535 ; "u32 high word zero stays positive")]
  #[test_case(&[0x0000, 0x0001], E::Unsigned32LswFirst, 65536 ; "u32 word order")]
  #[test_case(&[0xFFFF, 0xFFFF], E::Signed32LswFirst, -1 ; "s32 minus one")]
  #[test_case(&[0x0000, 0x8000], E::Signed32LswFirst, i32::MIN as i64 ; "s32 minimum")]
  fn encoding_decode(words: &[u16], encoding: Encoding, expected: i64) {
    assert_eq!(encoding.decode(words), Some(expected));
  }

  #[test]
  fn decode_requires_enough_words() {
    assert_eq!(E::Unsigned32LswFirst.decode(&[0x1234]), None);
    assert_eq!(E::Signed16.decode(&[]), None);
  }

  #[test]
  fn scaling_and_offset() {
    let battery_temp = DEYE_SG04LP3_REGISTERS
      .iter()
      .find(|r| r.name == "battery_temperature")
      .unwrap();
    // Raw 1234 -> 123.4 - 100 = 23.4 °C
    assert_eq!(battery_temp.scaled(1234), 23.4);
  }

  #[test_case(0, &[G::Fast, G::Normal, G::Slow] ; "tick zero polls everything")]
  #[test_case(1, &[G::Fast] ; "tick one is fast only")]
  #[test_case(2, &[G::Fast] ; "tick two is fast only")]
  #[test_case(3, &[G::Fast, G::Normal] ; "tick three adds normal")]
  #[test_case(6, &[G::Fast, G::Normal, G::Slow] ; "tick six adds slow")]
  #[test_case(9, &[G::Fast, G::Normal] ; "tick nine adds normal")]
  fn scan_cadence(tick: u64, due: &[ScanGroup]) {
    for group in [G::Fast, G::Normal, G::Slow] {
      assert_eq!(group.due(tick), due.contains(&group), "tick {tick} {group:?}");
    }
  }

  #[test]
  fn register_names_are_unique() {
    let mut names: Vec<&str> = DEYE_SG04LP3_REGISTERS.iter().map(|r| r.name).collect();
    names.sort_unstable();
    let len = names.len();
    names.dedup();
    assert_eq!(names.len(), len);
  }

  #[test]
  fn schema_carries_table_metadata() {
    let schema = sensor_schema(DEYE_SG04LP3_REGISTERS);
    let soc = schema.iter().find(|d| d.name == "battery_soc").unwrap();
    assert_eq!(soc.display_name, "Battery Soc");
    assert_eq!(soc.legacy_unique_id.as_deref(), Some("deye-tcp-battery-soc"));
    let voltage = schema.iter().find(|d| d.name == "battery_voltage").unwrap();
    assert_eq!(voltage.display_precision, Some(2));
    assert_eq!(voltage.unit.as_deref(), Some("V"));
  }

  #[test]
  fn solarman_map_covers_the_history_set() {
    assert_eq!(solarman_name("battery_soc"), Some("Battery SOC"));
    assert_eq!(solarman_name("alert_code_1"), None);
  }
}
