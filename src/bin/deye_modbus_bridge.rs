//! Modbus-TCP → MQTT bridge daemon.
//!
//! Polls the Deye inverter register map on a tiered cadence and publishes
//! each register as its own state topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use pylontech_bms_mqtt::modbus::{self, ModbusError, ModbusPoller, DEYE_SG04LP3_REGISTERS};
use pylontech_bms_mqtt::{
  Announcer, BridgeClient, BridgeConfig, ConnectionEvent, DeviceDefaults, ModbusConfig,
  PublishOpts, Publisher, Supervisor,
};

const DEVICE_DEFAULTS: DeviceDefaults = DeviceDefaults {
  state_prefix: "deye_inverter",
  device_id: "deye_inverter",
  device_name: "Deye Inverter",
  manufacturer: "Deye",
  model: "SUN-12K-SG04LP3-EU",
};

const BUS_RETRY: Duration = Duration::from_secs(5);
const FLUSH_WINDOW: Duration = Duration::from_millis(500);

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
  let modbus_cfg = ModbusConfig::from_env()?;
  info!(
    "configuration: MQTT={}:{} Modbus={}:{} unit {}",
    bridge_cfg.mqtt.host,
    bridge_cfg.mqtt.port,
    modbus_cfg.host,
    modbus_cfg.port,
    modbus_cfg.unit
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
    modbus::sensor_schema(DEYE_SG04LP3_REGISTERS),
  )
  .with_legacy(bridge_cfg.legacy.clone(), modbus::solarman_name);
  announcer.announce(publisher.sink());

  let mut supervisor = Supervisor::new(modbus_cfg.stale_timeout);

  'init: while !shutdown.load(Ordering::SeqCst) {
    let mut poller = match ModbusPoller::connect(&modbus_cfg.host, modbus_cfg.port, modbus_cfg.unit)
    {
      Ok(poller) => poller,
      Err(e) => {
        error!("modbus connect failed: {e} (retrying in {}s)", BUS_RETRY.as_secs());
        supervisor.tick(&mut publisher);
        sleep_interruptible(&shutdown, BUS_RETRY);
        continue;
      }
    };

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
      match poller.poll_cycle(DEYE_SG04LP3_REGISTERS) {
        Ok(values) => {
          if !values.is_empty() {
            supervisor.frame_received(&mut publisher);
          }
          for (reg, value) in values {
            let opts = PublishOpts::default().min_interval(reg.scan_group.min_publish_interval());
            publisher.publish(reg.name, value, opts);
          }
        }
        Err(e @ ModbusError::Transport(_)) | Err(e @ ModbusError::Io(_)) => {
          error!("modbus transport error: {e}, reconnecting");
          supervisor.tick(&mut publisher);
          continue 'init;
        }
        Err(e) => {
          warn!("modbus poll failed: {e}");
        }
      }
      supervisor.tick(&mut publisher);

      let elapsed = cycle_start.elapsed();
      if elapsed < modbus_cfg.poll_interval {
        sleep_interruptible(&shutdown, modbus_cfg.poll_interval - elapsed);
      }
    }
  }

  info!("shutdown requested");
  supervisor.shutdown(&mut publisher);
  thread::sleep(FLUSH_WINDOW);
  client.disconnect();
  Ok(())
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
