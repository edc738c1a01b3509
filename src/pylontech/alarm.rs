//! Decoder for the alarm-info response (CID2 = 0x44).
//!
//! The INFO field carries per-cell and per-sensor status bytes, three pack
//! status bytes, a bit-mapped extended status block, and a final operating
//! state bitfield. Results are classified into three disjoint buckets:
//! warnings (informational, expected around top of charge), protections
//! (actual protection trips) and alarms (the protections, re-exported for the
//! consumer-facing topic).

use enumflags2::{bitflags, BitFlags};

use super::hex::HexCursor;

// Status byte codes shared by the cell / temperature / pack entries.
const STATUS_BELOW_LIMIT: u8 = 0x01;
const STATUS_ABOVE_LIMIT: u8 = 0x02;

/// Balancer flags, extended status byte 0.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceFlag {
  BalancingOn = 0x01,
  StaticBalance = 0x02,
  StaticBalanceTimeout = 0x04,
}

/// Voltage alarm and protection bits, extended status byte 4.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageStatus {
  CellOverVoltageAlarm = 0x01,
  CellUnderVoltageAlarm = 0x02,
  PackOverVoltageAlarm = 0x04,
  PackUnderVoltageAlarm = 0x08,
  CellOverVoltageProtect = 0x10,
  CellUnderVoltageProtect = 0x20,
  PackOverVoltageProtect = 0x40,
  PackUnderVoltageProtect = 0x80,
}

impl VoltageStatus {
  fn label(self) -> &'static str {
    match self {
      VoltageStatus::CellOverVoltageAlarm => "cell_over_voltage",
      VoltageStatus::CellUnderVoltageAlarm => "cell_under_voltage",
      VoltageStatus::PackOverVoltageAlarm => "pack_over_voltage",
      VoltageStatus::PackUnderVoltageAlarm => "pack_under_voltage",
      VoltageStatus::CellOverVoltageProtect => "cell_over_voltage_protect",
      VoltageStatus::CellUnderVoltageProtect => "cell_under_voltage_protect",
      VoltageStatus::PackOverVoltageProtect => "pack_over_voltage_protect",
      VoltageStatus::PackUnderVoltageProtect => "pack_under_voltage_protect",
    }
  }

  fn is_protection(self) -> bool {
    matches!(
      self,
      VoltageStatus::CellOverVoltageProtect
        | VoltageStatus::CellUnderVoltageProtect
        | VoltageStatus::PackOverVoltageProtect
        | VoltageStatus::PackUnderVoltageProtect
    )
  }
}

/// MOSFET switch states, extended status byte 8.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MosfetState {
  DischargeOn = 0x01,
  ChargeOn = 0x02,
  ChargeLimited = 0x04,
  HeaterOn = 0x08,
}

/// Operating state bitfield, the final INFO byte. Several may be set at once;
/// none set renders as "Idle".
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
  Discharge = 0x01,
  Charge = 0x02,
  Float = 0x04,
  Full = 0x08,
  Standby = 0x10,
  Shutdown = 0x20,
}

impl OperatingState {
  fn label(self) -> &'static str {
    match self {
      OperatingState::Discharge => "Discharge",
      OperatingState::Charge => "Charge",
      OperatingState::Float => "Float",
      OperatingState::Full => "Full",
      OperatingState::Standby => "Standby",
      OperatingState::Shutdown => "Shutdown",
    }
  }
}

// Offsets within the extended status block, in status bytes.
const EXT_BALANCE_BYTE: usize = 0;
const EXT_VOLTAGE_BYTE: usize = 4;
const EXT_MOSFET_BYTE: usize = 8;
const EXT_BALANCE_PAIR: usize = 9;
// The empirically-correlated alternative location of the balance pair: a
// further 9 hex chars past the documented one. Both views are decoded until
// field correlation settles which tracks the physical balancer.
const EXT_BALANCE_PAIR_CW_SKEW: usize = 9;

/// Decoded alarm info of one battery module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmInfo {
  pub cell_status: Vec<u8>,
  pub temperature_status: Vec<u8>,
  pub charge_current_status: u8,
  pub pack_voltage_status: u8,
  pub discharge_current_status: u8,
  pub balance: BitFlags<BalanceFlag>,
  pub voltage_status: BitFlags<VoltageStatus>,
  pub mosfets: BitFlags<MosfetState>,
  /// Cells with an active balancer, 1-based, from extended bytes 9-10.
  pub balancing_cells: Vec<u8>,
  /// Same, from the alternative "CW" byte pair.
  pub balancing_cells_cw: Vec<u8>,
  pub operating_state: BitFlags<OperatingState>,
}

impl AlarmInfo {
  /// Decode the INFO field of an alarm-info response. Truncation yields a
  /// partial result; `None` only when even the fixed prefix is absent.
  pub fn decode(info: &str) -> Option<AlarmInfo> {
    let mut cur = HexCursor::new(info);
    let mut out = AlarmInfo::default();

    cur.u8()?; // info flag
    cur.u8()?; // battery number
    let cell_count = cur.u8()?;
    for _ in 0..cell_count {
      match cur.u8() {
        Some(status) => out.cell_status.push(status),
        None => return Some(out),
      }
    }
    let Some(temp_count) = cur.u8() else {
      return Some(out);
    };
    for _ in 0..temp_count {
      match cur.u8() {
        Some(status) => out.temperature_status.push(status),
        None => return Some(out),
      }
    }

    out.charge_current_status = cur.u8().unwrap_or(0);
    out.pack_voltage_status = cur.u8().unwrap_or(0);
    out.discharge_current_status = cur.u8().unwrap_or(0);

    // Extended status block: bit-mapped bytes from here to the end of INFO.
    let ext_start = cur.position();
    let ext_byte = |index: usize| hex_byte_at(info, ext_start + index * 2);

    if let Some(b) = ext_byte(EXT_BALANCE_BYTE) {
      out.balance = BitFlags::from_bits_truncate(b);
    }
    if let Some(b) = ext_byte(EXT_VOLTAGE_BYTE) {
      out.voltage_status = BitFlags::from_bits_truncate(b);
    }
    if let Some(b) = ext_byte(EXT_MOSFET_BYTE) {
      out.mosfets = BitFlags::from_bits_truncate(b);
    }

    // Per-cell balance bits are only meaningful while the master balance-on
    // flag is set; without it the pair is stale and ignored.
    if out.balance.contains(BalanceFlag::BalancingOn) {
      let low = ext_byte(EXT_BALANCE_PAIR);
      let high = ext_byte(EXT_BALANCE_PAIR + 1);
      out.balancing_cells = balance_pair_cells(low, high);

      let cw_offset = ext_start + EXT_BALANCE_PAIR * 2 + EXT_BALANCE_PAIR_CW_SKEW;
      let cw_low = hex_byte_at(info, cw_offset);
      let cw_high = hex_byte_at(info, cw_offset + 2);
      out.balancing_cells_cw = balance_pair_cells(cw_low, cw_high);
    }

    // The operating state is the last INFO byte.
    if info.len() >= ext_start + 2 {
      if let Some(b) = hex_byte_at(info, info.len() - 2) {
        out.operating_state = BitFlags::from_bits_truncate(b);
      }
    }

    Some(out)
  }

  /// Informational flags, expected during normal operation near the voltage
  /// limits.
  pub fn warnings(&self) -> Vec<String> {
    let mut out = Vec::new();
    for (i, status) in self.cell_status.iter().enumerate() {
      match *status {
        STATUS_BELOW_LIMIT => out.push(format!("cell{:02}_low", i + 1)),
        STATUS_ABOVE_LIMIT => out.push(format!("cell{:02}_high", i + 1)),
        _ => {}
      }
    }
    for (i, status) in self.temperature_status.iter().enumerate() {
      match *status {
        STATUS_BELOW_LIMIT => out.push(format!("temp{}_low", i + 1)),
        STATUS_ABOVE_LIMIT => out.push(format!("temp{}_high", i + 1)),
        _ => {}
      }
    }
    if self.charge_current_status != 0 {
      out.push("charge_current".to_string());
    }
    if self.pack_voltage_status != 0 {
      out.push("pack_voltage".to_string());
    }
    if self.discharge_current_status != 0 {
      out.push("discharge_current".to_string());
    }
    for flag in self.voltage_status.iter().filter(|f| !f.is_protection()) {
      out.push(flag.label().to_string());
    }
    out
  }

  /// Protection trips.
  pub fn protections(&self) -> Vec<String> {
    self
      .voltage_status
      .iter()
      .filter(|f| f.is_protection())
      .map(|f| f.label().to_string())
      .collect()
  }

  /// The consumer-facing alarm list: protections only, warnings excluded.
  pub fn alarms(&self) -> Vec<String> {
    self.protections()
  }

  /// Operating state rendered for the state topic, e.g. `Charge|Float`, or
  /// `Idle` when no bit is set.
  pub fn operating_state_label(&self) -> String {
    if self.operating_state.is_empty() {
      return "Idle".to_string();
    }
    let labels: Vec<&str> = self.operating_state.iter().map(|s| s.label()).collect();
    labels.join("|")
  }
}

fn hex_byte_at(info: &str, offset: usize) -> Option<u8> {
  u8::from_str_radix(info.get(offset..offset + 2)?, 16).ok()
}

// LSB-first: cell 1 is bit 0 of the low byte, cell 9 bit 0 of the high byte.
fn balance_pair_cells(low: Option<u8>, high: Option<u8>) -> Vec<u8> {
  let mut cells = Vec::new();
  if let Some(low) = low {
    for bit in 0u8..8 {
      if low & (1 << bit) != 0 {
        cells.push(bit + 1);
      }
    }
  }
  if let Some(high) = high {
    for bit in 0u8..8 {
      if high & (1 << bit) != 0 {
        cells.push(bit + 9);
      }
    }
  }
  cells
}

#[cfg(test)]
mod tests {
  use super::*;

  // 16 cells, 4 temps, all idle. `ext` is appended verbatim as the extended
  // status block; the caller terminates it with the operating-state byte.
  fn build_info(cell_status: &[u8], temp_status: &[u8], ext: &str) -> String {
    let mut info = String::from("00"); // info flag
    info.push_str("00"); // battery number
    info.push_str(&format!("{:02X}", cell_status.len()));
    for s in cell_status {
      info.push_str(&format!("{s:02X}"));
    }
    info.push_str(&format!("{:02X}", temp_status.len()));
    for s in temp_status {
      info.push_str(&format!("{s:02X}"));
    }
    info.push_str("000000"); // charge current, pack voltage, discharge current
    info.push_str(ext);
    info
  }

  #[test]
  fn quiet_module_has_no_alarms() {
    let info = build_info(&[0u8; 16], &[0u8; 4], "000000000000000003000000");
    let a = AlarmInfo::decode(&info).unwrap();
    assert!(a.warnings().is_empty());
    assert!(a.protections().is_empty());
    assert!(a.alarms().is_empty());
    assert_eq!(a.mosfets, MosfetState::DischargeOn | MosfetState::ChargeOn);
    assert_eq!(a.operating_state_label(), "Idle");
    assert!(a.balancing_cells.is_empty());
  }

  #[test]
  fn cell_limit_codes_become_warnings() {
    let mut cells = [0u8; 16];
    cells[2] = STATUS_ABOVE_LIMIT;
    cells[10] = STATUS_BELOW_LIMIT;
    let info = build_info(&cells, &[0u8; 4], "000000000000000000000000");
    let a = AlarmInfo::decode(&info).unwrap();
    assert_eq!(a.warnings(), vec!["cell03_high", "cell11_low"]);
    assert!(a.protections().is_empty());
  }

  #[test]
  fn protect_bits_are_alarms_but_over_voltage_alarm_is_not() {
    // Byte 4 = 0x21: cell over-voltage alarm + cell under-voltage protect.
    let info = build_info(&[0u8; 16], &[0u8; 4], "000000002100000000000000");
    let a = AlarmInfo::decode(&info).unwrap();
    assert_eq!(a.warnings(), vec!["cell_over_voltage"]);
    assert_eq!(a.protections(), vec!["cell_under_voltage_protect"]);
    assert_eq!(a.alarms(), a.protections());
  }

  #[test]
  fn balance_bits_require_master_flag() {
    // Byte 0 = 0x00: balance pair present but the master flag is off.
    let info = build_info(&[0u8; 16], &[0u8; 4], "000000000000000000050100");
    let a = AlarmInfo::decode(&info).unwrap();
    assert!(a.balancing_cells.is_empty());

    // Byte 0 = 0x01: cells 1, 3 (low byte 0x05) and 9 (high byte 0x01).
    let info = build_info(&[0u8; 16], &[0u8; 4], "010000000000000000050100");
    let a = AlarmInfo::decode(&info).unwrap();
    assert!(a.balance.contains(BalanceFlag::BalancingOn));
    assert_eq!(a.balancing_cells, vec![1, 3, 9]);
  }

  #[test]
  fn cw_view_is_decoded_separately() {
    // Primary pair (bytes 9-10) zero; the CW pair, 9 hex chars further on,
    // carries 0x0C 0x00. Low byte 0x0C = bits 2 and 3 = cells 3 and 4.
    let ext = concat!(
      "01",               // byte 0: master balance flag on
      "0000000000000000", // bytes 1-8
      "0000",             // bytes 9-10: primary balance pair, empty
      "00000",            // skew to the CW location
      "0C00",             // CW balance pair
      "00"                // operating state
    );
    let info = build_info(&[0u8; 16], &[0u8; 4], ext);
    let a = AlarmInfo::decode(&info).unwrap();
    assert!(a.balancing_cells.is_empty());
    assert_eq!(a.balancing_cells_cw, vec![3, 4]);
  }

  #[test]
  fn operating_state_renders_combined_flags() {
    let info = build_info(&[0u8; 16], &[0u8; 4], "000000000000000000000006");
    let a = AlarmInfo::decode(&info).unwrap();
    assert_eq!(
      a.operating_state,
      OperatingState::Charge | OperatingState::Float
    );
    assert_eq!(a.operating_state_label(), "Charge|Float");
  }

  #[test]
  fn truncated_info_is_partial_not_fatal() {
    // 16 declared cells but only two status bytes present.
    let a = AlarmInfo::decode("0000100000").unwrap();
    assert_eq!(a.cell_status.len(), 2);
    assert!(a.temperature_status.is_empty());
    assert_eq!(a.operating_state_label(), "Idle");

    assert!(AlarmInfo::decode("00").is_none());
  }
}
