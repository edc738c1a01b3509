//! Decoder for the analog-values response (CID2 = 0x42).

use crate::value::round_to;

use super::hex::HexCursor;

/// Decoded analog values of one battery module.
///
/// Fields past the cell list are optional because modules answer with
/// truncated INFO under load; whatever decoded before the cut is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalogValues {
  /// Per-cell voltages in volts.
  pub cells: Vec<f64>,
  /// Temperature sensor readings in °C.
  pub temperatures: Vec<f64>,
  /// Pack current in amps, negative while discharging.
  pub current: Option<f64>,
  /// Pack terminal voltage in volts (centivolt field on the wire).
  pub terminal_voltage: Option<f64>,
  /// Remaining capacity in Ah.
  pub remaining_ah: Option<f64>,
  /// Total capacity in Ah.
  pub total_ah: Option<f64>,
  /// Charge/discharge cycle count.
  pub cycles: Option<u32>,
}

impl AnalogValues {
  /// Decode the INFO field of an analog-values response. Truncated input
  /// yields a partial result rather than an error.
  pub fn decode(info: &str) -> AnalogValues {
    let mut cur = HexCursor::new(info);
    let mut out = AnalogValues::default();

    // 4-char header: info flag + battery number, opaque here.
    cur.skip(4);

    let Some(cell_count) = cur.u8() else {
      return out;
    };
    for _ in 0..cell_count {
      match cur.u16() {
        Some(mv) => out.cells.push(round_to(f64::from(mv) / 1000.0, 3)),
        None => return out,
      }
    }

    if let Some(temp_count) = cur.u8() {
      for _ in 0..temp_count {
        match cur.u16() {
          // Sensors report deci-Kelvin.
          Some(raw) => out
            .temperatures
            .push(round_to((f64::from(raw) - 2731.0) / 10.0, 1)),
          None => return out,
        }
      }
    }

    out.current = cur.i16().map(|ca| f64::from(ca) / 100.0);
    out.terminal_voltage = cur.u16().map(|cv| f64::from(cv) / 100.0);
    out.remaining_ah = cur.u16().map(|r| f64::from(r) / 100.0);
    cur.skip(2); // user-defined byte
    out.total_ah = cur.u16().map(|t| f64::from(t) / 100.0);
    out.cycles = cur.u16().map(u32::from);
    out
  }

  pub fn cell_min(&self) -> Option<f64> {
    self.cells.iter().copied().reduce(f64::min)
  }

  pub fn cell_max(&self) -> Option<f64> {
    self.cells.iter().copied().reduce(f64::max)
  }

  /// Spread between the highest and lowest cell, in millivolts.
  pub fn cell_delta_mv(&self) -> Option<f64> {
    match (self.cell_min(), self.cell_max()) {
      (Some(min), Some(max)) => Some(round_to((max - min) * 1000.0, 1)),
      _ => None,
    }
  }

  /// Module voltage as the sum of its cells.
  pub fn cells_voltage(&self) -> f64 {
    round_to(self.cells.iter().sum(), 2)
  }

  /// State of charge in percent, derived from the capacity pair.
  pub fn soc(&self) -> Option<f64> {
    match (self.remaining_ah, self.total_ah) {
      (Some(remaining), Some(total)) if total > 0.0 => {
        Some(round_to(remaining / total * 100.0, 1))
      }
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Builds the INFO a healthy 16S module answers with: every cell at
  // `cell_mv`, four sensors at 25.0 °C, idle current, 80/100 Ah, 50 cycles.
  fn sample_info(cell_mv: u16) -> String {
    let mut info = String::from("0000");
    info.push_str("10");
    for _ in 0..16 {
      info.push_str(&format!("{cell_mv:04X}"));
    }
    info.push_str("04");
    for _ in 0..4 {
      info.push_str(&format!("{:04X}", 2731 + 250)); // 25.0 °C
    }
    info.push_str("0000"); // current
    info.push_str(&format!("{:04X}", 5360)); // 53.60 V terminal
    info.push_str(&format!("{:04X}", 8000)); // 80.00 Ah remaining
    info.push_str("03"); // user byte
    info.push_str(&format!("{:04X}", 10000)); // 100.00 Ah total
    info.push_str(&format!("{:04X}", 50)); // cycles
    info
  }

  #[test]
  fn healthy_module_decodes() {
    let v = AnalogValues::decode(&sample_info(3350));
    assert_eq!(v.cells.len(), 16);
    assert!(v.cells.iter().all(|&c| c == 3.350));
    assert_eq!(v.temperatures, vec![25.0; 4]);
    assert_eq!(v.current, Some(0.0));
    assert_eq!(v.terminal_voltage, Some(53.6));
    assert_eq!(v.remaining_ah, Some(80.0));
    assert_eq!(v.total_ah, Some(100.0));
    assert_eq!(v.cycles, Some(50));
    assert_eq!(v.soc(), Some(80.0));
    assert_eq!(v.cells_voltage(), 53.6);
    assert_eq!(v.cell_delta_mv(), Some(0.0));
  }

  #[test]
  fn zero_cells_decode_cleanly() {
    // Zero cells, zero temps, then the scalar tail.
    let info = concat!("0000", "00", "00", "0000", "0000", "0000", "03", "0000", "0000");
    let v = AnalogValues::decode(info);
    assert!(v.cells.is_empty());
    assert!(v.temperatures.is_empty());
    assert_eq!(v.current, Some(0.0));
    assert_eq!(v.cell_min(), None);
    assert_eq!(v.soc(), None);
  }

  #[test]
  fn truncated_info_keeps_prefix() {
    let full = sample_info(3350);
    // Cut in the middle of the temperature block.
    let v = AnalogValues::decode(&full[..full.len() - 30]);
    assert_eq!(v.cells.len(), 16);
    assert!(v.temperatures.len() < 4);
    assert_eq!(v.cycles, None);
  }

  #[test]
  fn discharge_current_is_twos_complement() {
    // One cell, no temps, current 0xFF38 = -200 centiamps.
    let info = "000001".to_string() + "0D16" + "00" + "FF38";
    let v = AnalogValues::decode(&info);
    assert_eq!(v.current, Some(-2.0));

    let info = "000001".to_string() + "0D16" + "00" + "8000";
    let v = AnalogValues::decode(&info);
    assert_eq!(v.current, Some(-327.68));
  }
}
