//! Roll-up of per-module readings into stack-level summaries.
//!
//! The modules are wired in parallel: stack voltage is the mean of the module
//! voltages, stack current the sum of the module currents.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::value::round_to;

use super::{alarm::AlarmInfo, analog::AnalogValues};

/// One polled module: its index on the bus plus the decoded responses.
/// Transient, consumed by the publisher in the same poll cycle.
#[derive(Debug, Clone)]
pub struct ModuleReading {
  pub index: usize,
  pub timestamp: DateTime<Utc>,
  pub analog: AnalogValues,
  pub alarm: Option<AlarmInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackSummary {
  pub modules: usize,
  pub cells: usize,
  pub cell_min: f64,
  pub cell_max: f64,
  pub cell_delta_mv: f64,
  pub temp_min: Option<f64>,
  pub temp_max: Option<f64>,
  /// Mean of module voltages (sum of cells per module).
  pub voltage: f64,
  /// Sum of module currents.
  pub current: f64,
  /// Number of cells currently balancing, across all modules.
  pub balancing: usize,
  /// Balancing cells as `B{module}C{cell}` tokens.
  pub balancing_cells: Vec<String>,
  /// Set-union of the per-module alarm lists.
  pub alarms: Vec<String>,
}

/// Aggregate the modules that answered this cycle. `None` when no module
/// produced any cell data.
pub fn aggregate(modules: &[ModuleReading]) -> Option<StackSummary> {
  let with_cells: Vec<&ModuleReading> = modules.iter().filter(|m| !m.analog.cells.is_empty()).collect();
  if with_cells.is_empty() {
    return None;
  }

  let mut cell_min = f64::INFINITY;
  let mut cell_max = f64::NEG_INFINITY;
  let mut cells = 0usize;
  let mut voltage_sum = 0.0;
  let mut current = 0.0;
  let mut temp_min: Option<f64> = None;
  let mut temp_max: Option<f64> = None;
  let mut balancing_cells = Vec::new();
  let mut alarms = BTreeSet::new();

  for module in &with_cells {
    for &cell in &module.analog.cells {
      cell_min = cell_min.min(cell);
      cell_max = cell_max.max(cell);
    }
    cells += module.analog.cells.len();
    voltage_sum += module.analog.cells_voltage();
    current += module.analog.current.unwrap_or(0.0);
    for &t in &module.analog.temperatures {
      temp_min = Some(temp_min.map_or(t, |m| m.min(t)));
      temp_max = Some(temp_max.map_or(t, |m| m.max(t)));
    }
    if let Some(alarm) = &module.alarm {
      for &cell in &alarm.balancing_cells {
        balancing_cells.push(format!("B{}C{}", module.index, cell));
      }
      alarms.extend(alarm.alarms());
    }
  }

  Some(StackSummary {
    modules: with_cells.len(),
    cells,
    cell_min: round_to(cell_min, 3),
    cell_max: round_to(cell_max, 3),
    cell_delta_mv: round_to((cell_max - cell_min) * 1000.0, 1),
    temp_min,
    temp_max,
    voltage: round_to(voltage_sum / with_cells.len() as f64, 2),
    current: round_to(current, 2),
    balancing: balancing_cells.len(),
    balancing_cells,
    alarms: alarms.into_iter().collect(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn module(index: usize, cells: Vec<f64>, temps: Vec<f64>, current: f64) -> ModuleReading {
    ModuleReading {
      index,
      timestamp: Utc::now(),
      analog: AnalogValues {
        cells,
        temperatures: temps,
        current: Some(current),
        ..AnalogValues::default()
      },
      alarm: None,
    }
  }

  #[test]
  fn parallel_stack_semantics() {
    let modules = vec![
      module(0, vec![3.30, 3.35], vec![20.0, 25.0], 5.0),
      module(1, vec![3.32, 3.40], vec![18.0], -2.0),
    ];
    let s = aggregate(&modules).unwrap();
    assert_eq!(s.modules, 2);
    assert_eq!(s.cells, 4);
    assert_eq!(s.cell_min, 3.30);
    assert_eq!(s.cell_max, 3.40);
    assert_eq!(s.cell_delta_mv, 100.0);
    assert_eq!(s.temp_min, Some(18.0));
    assert_eq!(s.temp_max, Some(25.0));
    // Mean of 6.65 and 6.72, not the sum.
    assert_eq!(s.voltage, 6.69);
    assert_eq!(s.current, 3.0);
  }

  #[test]
  fn balance_tokens_and_alarm_union() {
    let mut a = module(0, vec![3.35], vec![], 0.0);
    let mut alarm0 = AlarmInfo::default();
    alarm0.balancing_cells = vec![2, 7];
    alarm0.voltage_status =
      enumflags2::BitFlags::from(crate::pylontech::alarm::VoltageStatus::CellOverVoltageProtect);
    a.alarm = Some(alarm0);

    let mut b = module(1, vec![3.36], vec![], 0.0);
    let mut alarm1 = AlarmInfo::default();
    alarm1.balancing_cells = vec![7];
    alarm1.voltage_status =
      enumflags2::BitFlags::from(crate::pylontech::alarm::VoltageStatus::CellOverVoltageProtect);
    b.alarm = Some(alarm1);

    let s = aggregate(&[a, b]).unwrap();
    assert_eq!(s.balancing, 3);
    assert_eq!(s.balancing_cells, vec!["B0C2", "B0C7", "B1C7"]);
    // Identical protections from both modules collapse to one entry.
    assert_eq!(s.alarms, vec!["cell_over_voltage_protect"]);
  }

  #[test]
  fn silent_modules_are_skipped() {
    let modules = vec![
      module(0, vec![], vec![], 0.0),
      module(1, vec![3.33], vec![], 1.5),
    ];
    let s = aggregate(&modules).unwrap();
    assert_eq!(s.modules, 1);
    assert_eq!(s.voltage, 3.33);

    assert!(aggregate(&[module(0, vec![], vec![], 0.0)]).is_none());
  }
}
