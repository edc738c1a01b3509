//! RS485 → MQTT bridge daemon.
//!
//! Queries every battery module in the stack each poll cycle, publishes the
//! per-module readings and alarm state, then the stack roll-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use pylontech_bms_mqtt::mqtt::MqttSink;
use pylontech_bms_mqtt::pylontech::{self, aggregate, ModuleReading, Rs485Poller, StackSummary};
use pylontech_bms_mqtt::{
  Announcer, BridgeClient, BridgeConfig, ConnectionEvent, DeviceDefaults, PublishOpts, Publisher,
  Rs485Config, Supervisor, Value,
};

const DEVICE_DEFAULTS: DeviceDefaults = DeviceDefaults {
  state_prefix: "pylon_rs485",
  device_id: "pylon_rs485",
  device_name: "Pylontech Stack (RS485)",
  manufacturer: "Shoto",
  model: "Pylontech-protocol 16S",
};

const BUS_RETRY: Duration = Duration::from_secs(5);
const FLUSH_WINDOW: Duration = Duration::from_millis(500);
const MIN_INTERVAL_SOC: Duration = Duration::from_secs(5);

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_millis()
    .init();
  if let Err(e) = run() {
    error!("fatal: {e:#}");
    std::process::exit(1);
  }
}

fn run() -> anyhow::Result<()> {
  let bridge_cfg = BridgeConfig::from_env(&DEVICE_DEFAULTS)?;
  let rs485_cfg = Rs485Config::from_env()?;
  info!(
    "configuration: MQTT={}:{} RS485={} ({} modules)",
    bridge_cfg.mqtt.host, bridge_cfg.mqtt.port, rs485_cfg.port, rs485_cfg.batteries
  );

  let shutdown = Arc::new(AtomicBool::new(false));
  {
    let shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;
  }

  let availability_topic = format!("{}/status", bridge_cfg.state_prefix);
  let client = BridgeClient::connect(&bridge_cfg.mqtt, &availability_topic)?;
  let mut publisher = Publisher::new(client.sink(), bridge_cfg.state_prefix.clone());
  let announcer = Announcer::new(
    bridge_cfg.discovery_prefix.clone(),
    bridge_cfg.state_prefix.clone(),
    bridge_cfg.device.clone(),
    pylontech::sensor_schema(
      rs485_cfg.batteries,
      rs485_cfg.cells_per_module,
      rs485_cfg.temps_per_module,
    ),
  );
  announcer.announce(publisher.sink());

  let mut supervisor = Supervisor::new(rs485_cfg.stale_timeout);

  'init: while !shutdown.load(Ordering::SeqCst) {
    let mut poller = match Rs485Poller::open(&rs485_cfg.port, rs485_cfg.baud, rs485_cfg.address) {
      Ok(poller) => poller,
      Err(e) => {
        error!("RS485 port not available: {e} (retrying in {}s)", BUS_RETRY.as_secs());
        supervisor.tick(&mut publisher);
        sleep_interruptible(&shutdown, BUS_RETRY);
        continue;
      }
    };
    match poller.identity(0) {
      Ok(identity) => info!(
        "module 0: manufacturer {:?}, firmware {:?}, serial {:?}",
        identity.manufacturer, identity.firmware, identity.serial
      ),
      Err(e) => debug!("identity query failed: {e}"),
    }

    loop {
      if shutdown.load(Ordering::SeqCst) {
        break 'init;
      }
      while let Some(event) = client.poll_event() {
        if event == ConnectionEvent::Connected {
          announcer.announce(publisher.sink());
        }
      }

      let cycle_start = Instant::now();
      let mut modules: Vec<ModuleReading> = Vec::new();
      for battery in 0..rs485_cfg.batteries {
        match poller.read_module(battery) {
          Ok(reading) => modules.push(reading),
          Err(e) if e.is_bus_fault() => {
            error!("RS485 bus error: {e}, reopening port");
            supervisor.tick(&mut publisher);
            continue 'init;
          }
          // A silent or garbled module counts towards staleness only.
          Err(e) => warn!("module {battery}: {e}"),
        }
      }

      if !modules.is_empty() {
        supervisor.frame_received(&mut publisher);
        for module in &modules {
          publish_module(&mut publisher, module);
        }
        if let Some(stack) = aggregate(&modules) {
          publish_stack(&mut publisher, &stack);
        }
      }
      supervisor.tick(&mut publisher);

      let elapsed = cycle_start.elapsed();
      if elapsed < rs485_cfg.poll_interval {
        sleep_interruptible(&shutdown, rs485_cfg.poll_interval - elapsed);
      }
    }
  }

  info!("shutdown requested");
  supervisor.shutdown(&mut publisher);
  thread::sleep(FLUSH_WINDOW);
  client.disconnect();
  Ok(())
}

fn publish_module(publisher: &mut Publisher<MqttSink>, module: &ModuleReading) {
  let group = format!("battery{}", module.index);
  let analog = &module.analog;
  debug!(
    "{group}: {} cells at {}, {} temps",
    analog.cells.len(),
    module.timestamp.format("%H:%M:%S"),
    analog.temperatures.len()
  );

  for (i, &cell) in analog.cells.iter().enumerate() {
    publisher.publish(&format!("{group}/cell{:02}", i + 1), cell, PublishOpts::default());
  }
  for (i, &temp) in analog.temperatures.iter().enumerate() {
    publisher.publish(&format!("{group}/temp{}", i + 1), temp, PublishOpts::default());
  }
  if let (Some(min), Some(max), Some(delta)) =
    (analog.cell_min(), analog.cell_max(), analog.cell_delta_mv())
  {
    publisher.publish(&format!("{group}/cell_min"), min, PublishOpts::default());
    publisher.publish(&format!("{group}/cell_max"), max, PublishOpts::default());
    publisher.publish(&format!("{group}/cell_delta_mv"), delta, PublishOpts::default());
  }
  if !analog.cells.is_empty() {
    publisher.publish(&format!("{group}/voltage"), analog.cells_voltage(), PublishOpts::default());
  }
  if let Some(current) = analog.current {
    publisher.publish(&format!("{group}/current"), current, PublishOpts::default());
  }
  if let Some(voltage) = analog.terminal_voltage {
    publisher.publish(&format!("{group}/terminal_voltage"), voltage, PublishOpts::default());
  }
  if let Some(remaining) = analog.remaining_ah {
    publisher.publish(&format!("{group}/remain_ah"), remaining, PublishOpts::default());
  }
  if let Some(total) = analog.total_ah {
    publisher.publish(&format!("{group}/total_ah"), total, PublishOpts::retained());
  }
  if let Some(soc) = analog.soc() {
    publisher.publish(
      &format!("{group}/soc"),
      soc,
      PublishOpts::default().min_interval(MIN_INTERVAL_SOC),
    );
  }
  if let Some(cycles) = analog.cycles {
    publisher.publish(&format!("{group}/cycles"), cycles, PublishOpts::retained());
  }

  if let Some(alarm) = &module.alarm {
    publisher.publish(
      &format!("{group}/op_state"),
      Value::Text(alarm.operating_state_label()),
      PublishOpts::default(),
    );
    publisher.publish(
      &format!("{group}/alarms"),
      Value::Text(alarm.alarms().join(",")),
      PublishOpts::default(),
    );
    publisher.publish(
      &format!("{group}/balancing"),
      alarm.balancing_cells.len(),
      PublishOpts::default(),
    );
    publisher.publish(
      &format!("{group}/balancing_cells"),
      Value::Text(join_cells(&alarm.balancing_cells)),
      PublishOpts::default(),
    );
    publisher.publish(
      &format!("{group}/balancing_cells_cw"),
      Value::Text(join_cells(&alarm.balancing_cells_cw)),
      PublishOpts::default(),
    );
    publisher.publish(
      &format!("{group}/balancing_active"),
      if alarm.balancing_cells.is_empty() { 0u16 } else { 1u16 },
      PublishOpts::default(),
    );
  }
}

fn publish_stack(publisher: &mut Publisher<MqttSink>, stack: &StackSummary) {
  publisher.publish("stack/voltage", stack.voltage, PublishOpts::default());
  publisher.publish("stack/current", stack.current, PublishOpts::default());
  publisher.publish("stack/cell_min", stack.cell_min, PublishOpts::default());
  publisher.publish("stack/cell_max", stack.cell_max, PublishOpts::default());
  publisher.publish("stack/cell_delta_mv", stack.cell_delta_mv, PublishOpts::default());
  if let Some(temp_min) = stack.temp_min {
    publisher.publish("stack/temp_min", temp_min, PublishOpts::default());
  }
  if let Some(temp_max) = stack.temp_max {
    publisher.publish("stack/temp_max", temp_max, PublishOpts::default());
  }
  publisher.publish("stack/balancing", stack.balancing, PublishOpts::default());
  publisher.publish(
    "stack/balancing_cells",
    Value::Text(stack.balancing_cells.join(",")),
    PublishOpts::default(),
  );
  publisher.publish(
    "stack/alarms",
    Value::Text(stack.alarms.join(",")),
    PublishOpts::default(),
  );
}

fn join_cells(cells: &[u8]) -> String {
  cells
    .iter()
    .map(|c| c.to_string())
    .collect::<Vec<_>>()
    .join(",")
}

fn sleep_interruptible(shutdown: &AtomicBool, total: Duration) {
  let step = Duration::from_millis(100);
  let mut remaining = total;
  while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
    let chunk = remaining.min(step);
    thread::sleep(chunk);
    remaining -= chunk;
  }
}
