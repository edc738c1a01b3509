//! CAN → MQTT bridge daemon.
//!
//! Listens to the Pylontech-profile BMS frames on a socketcan interface and
//! publishes limits, state of charge, status flags and cell/temperature
//! extremes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Socket};

use pylontech_bms_mqtt::can::{self, BmsFrame};
use pylontech_bms_mqtt::{
  Announcer, BridgeClient, BridgeConfig, CanConfig, ConnectionEvent, DeviceDefaults, PublishOpts,
  Publisher, Supervisor,
};

const DEVICE_DEFAULTS: DeviceDefaults = DeviceDefaults {
  state_prefix: "deye_bms",
  device_id: "deye_bms_master",
  device_name: "Deye BMS (CAN)",
  manufacturer: "Shoto",
  model: "Pylontech-profile CAN",
};

const BUS_RETRY: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_WINDOW: Duration = Duration::from_millis(500);

// Publish tuning, per topic family.
const MIN_INTERVAL_LIMITS: Duration = Duration::from_millis(500);
const MIN_INTERVAL_SOC: Duration = Duration::from_secs(5);
const VOLT_HYST: f64 = 0.01;
const DELTA_HYST: f64 = 0.005;
const TEMP_HYST: f64 = 0.2;

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
  let can_cfg = CanConfig::from_env()?;
  info!(
    "configuration: MQTT={}:{} CAN={}",
    bridge_cfg.mqtt.host, bridge_cfg.mqtt.port, can_cfg.interface
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
    can::sensor_schema(),
  );
  announcer.announce(publisher.sink());

  let mut supervisor = Supervisor::new(can_cfg.stale_timeout);

  'init: while !shutdown.load(Ordering::SeqCst) {
    let socket = match CanSocket::open(&can_cfg.interface) {
      Ok(socket) => socket,
      Err(e) => {
        error!(
          "CAN interface {} not available: {e} (retrying in {}s)",
          can_cfg.interface,
          BUS_RETRY.as_secs()
        );
        supervisor.tick(&mut publisher);
        sleep_interruptible(&shutdown, BUS_RETRY);
        continue;
      }
    };
    if let Err(e) = socket.set_read_timeout(READ_TIMEOUT) {
      error!("cannot set CAN read timeout: {e}");
      sleep_interruptible(&shutdown, BUS_RETRY);
      continue;
    }
    info!("listening on CAN interface {}", can_cfg.interface);

    loop {
      if shutdown.load(Ordering::SeqCst) {
        break 'init;
      }
      while let Some(event) = client.poll_event() {
        if event == ConnectionEvent::Connected {
          announcer.announce(publisher.sink());
        }
      }

      match socket.read_frame() {
        Ok(CanFrame::Data(frame)) if frame.data().len() == 8 => {
          // Any well-formed frame proves the bus is alive, decoded or not.
          supervisor.frame_received(&mut publisher);
          if let Some(id) = standard_id(&frame) {
            if let Some(decoded) = can::decode(id, frame.data()) {
              publish_frame(&mut publisher, &decoded);
            }
          }
        }
        Ok(_) => {}
        Err(e) if is_timeout(&e) => {}
        Err(e) => {
          error!("CAN bus error: {e}, reopening interface");
          supervisor.tick(&mut publisher);
          continue 'init;
        }
      }
      supervisor.tick(&mut publisher);
    }
  }

  info!("shutdown requested");
  supervisor.shutdown(&mut publisher);
  thread::sleep(FLUSH_WINDOW);
  client.disconnect();
  Ok(())
}

fn publish_frame(publisher: &mut Publisher<pylontech_bms_mqtt::mqtt::MqttSink>, frame: &BmsFrame) {
  match *frame {
    BmsFrame::Limits {
      charge_voltage_max,
      charge_current_limit,
      discharge_current_limit,
      voltage_low_limit,
    } => {
      let retained = PublishOpts::retained().min_interval(MIN_INTERVAL_LIMITS);
      let live = PublishOpts::default().min_interval(MIN_INTERVAL_LIMITS);
      publisher.publish("limit/v_charge_max", charge_voltage_max, retained);
      publisher.publish("limit/v_low", voltage_low_limit, retained);
      publisher.publish("limit/i_charge", charge_current_limit, live);
      publisher.publish("limit/i_discharge", discharge_current_limit, live);
    }
    BmsFrame::State { soc, soh } => {
      publisher.publish("soc", soc, PublishOpts::default().min_interval(MIN_INTERVAL_SOC));
      publisher.publish("soh", soh, PublishOpts::retained().min_interval(MIN_INTERVAL_SOC));
    }
    BmsFrame::Flags { flags } => {
      publisher.publish(
        "flags",
        pylontech_bms_mqtt::Value::Text(can::flags_payload(flags)),
        PublishOpts::default(),
      );
    }
    BmsFrame::Extremes {
      temp_min,
      temp_max,
      cell_min,
      cell_max,
    } => {
      let volt = PublishOpts::default().hysteresis(VOLT_HYST);
      publisher.publish("ext/cell_v_min", cell_min, volt);
      publisher.publish("ext/cell_v_max", cell_max, volt);
      publisher.publish(
        "ext/cell_v_delta",
        pylontech_bms_mqtt::value::round_to(cell_max - cell_min, 3),
        PublishOpts::default()
          .min_interval(Duration::from_secs(2))
          .hysteresis(DELTA_HYST),
      );
      let temp = PublishOpts::default()
        .min_interval(Duration::from_secs(2))
        .hysteresis(TEMP_HYST);
      publisher.publish("ext/temp_min", temp_min, temp);
      publisher.publish("ext/temp_max", temp_max, temp);
    }
  }
}

fn standard_id(frame: &socketcan::CanDataFrame) -> Option<u32> {
  match frame.id() {
    socketcan::Id::Standard(id) => Some(u32::from(id.as_raw())),
    socketcan::Id::Extended(_) => None,
  }
}

fn is_timeout(e: &std::io::Error) -> bool {
  matches!(
    e.kind(),
    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
  )
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
