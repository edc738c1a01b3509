//! Serial poller for a stack of modules on one RS485 bus.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serialport::SerialPort;
use thiserror::Error;

use super::alarm::AlarmInfo;
use super::analog::AnalogValues;
use super::frame::{self, Command, FrameError, Response};
use super::stack::ModuleReading;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum PollError {
  #[error("serial port error: {0}")]
  Serial(#[from] serialport::Error),
  #[error("serial I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Frame(#[from] FrameError),
  #[error("no response from module {0}")]
  Timeout(u8),
}

impl PollError {
  /// Whether the bus handle itself is suspect and should be reopened.
  /// Timeouts and decode failures are per-request; the port stays up.
  pub fn is_bus_fault(&self) -> bool {
    matches!(self, PollError::Serial(_) | PollError::Io(_))
  }
}

/// Owns the serial handle; the only code that touches the bus.
pub struct Rs485Poller {
  port: Box<dyn SerialPort>,
  address: u8,
  buf: BytesMut,
}

impl Rs485Poller {
  pub fn open(device: &str, baud: u32, address: u8) -> Result<Self, PollError> {
    let port = serialport::new(device, baud).timeout(READ_TIMEOUT).open()?;
    info!("opened RS485 port {device} at {baud} baud, stack address {address:#04X}");
    Ok(Rs485Poller {
      port,
      address,
      buf: BytesMut::with_capacity(512),
    })
  }

  /// One request/response exchange with a module.
  pub fn query(&mut self, command: Command, battery: u8) -> Result<Response, PollError> {
    let request = frame::encode_request(self.address, command, &format!("{battery:02X}"))?;
    self.port.clear(serialport::ClearBuffer::Input)?;
    self.port.write_all(request.as_bytes())?;
    self.port.flush()?;

    self.buf.clear();
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut scratch = [0u8; 256];
    loop {
      match self.port.read(&mut scratch) {
        Ok(0) => {}
        Ok(n) => {
          self.buf.extend_from_slice(&scratch[..n]);
          if let Some(raw) = frame::take_frame(&mut self.buf) {
            trace!("module {battery}: {}", raw.trim_end());
            return Ok(frame::decode_response(&raw)?);
          }
        }
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
        Err(e) => return Err(e.into()),
      }
      if Instant::now() >= deadline {
        return Err(PollError::Timeout(battery));
      }
    }
  }

  /// Poll one module: analog values plus alarm info. A failed alarm query
  /// degrades the reading, it does not void the analog data.
  pub fn read_module(&mut self, battery: u8) -> Result<ModuleReading, PollError> {
    let analog = AnalogValues::decode(&self.query(Command::AnalogValues, battery)?.info);
    let alarm = match self.query(Command::AlarmInfo, battery) {
      Ok(response) => AlarmInfo::decode(&response.info),
      Err(e) if e.is_bus_fault() => return Err(e),
      Err(e) => {
        debug!("alarm query for module {battery} failed: {e}");
        None
      }
    };
    Ok(ModuleReading {
      index: battery as usize,
      timestamp: chrono::Utc::now(),
      analog,
      alarm,
    })
  }

  /// Manufacturer, firmware and serial strings, queried once at startup for
  /// the log.
  pub fn identity(&mut self, battery: u8) -> Result<ModuleIdentity, PollError> {
    let manufacturer = super::decode_ascii(&self.query(Command::ManufacturerInfo, battery)?.info);
    let firmware = super::decode_ascii(&self.query(Command::FirmwareVersion, battery)?.info);
    let serial = super::decode_ascii(&self.query(Command::SerialNumber, battery)?.info);
    Ok(ModuleIdentity {
      manufacturer,
      firmware,
      serial,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
  pub manufacturer: String,
  pub firmware: String,
  pub serial: String,
}
