//! Availability supervision.
//!
//! Keeps the public online/offline signal truthful across bus faults: the
//! bridge is `Online` while the bus yields valid frames, drops to `Stale`
//! (published as `offline`) when the bus goes quiet past the stale timeout,
//! and recovers on the next valid frame. A periodic heartbeat refreshes the
//! retained availability topic while healthy, covering brokers that lose
//! retained state across restarts.

use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Availability of a bridge as seen by the consumer. `Stale` and `Offline`
/// publish the same payload; they differ only in whether the process is still
/// trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
  Online,
  Stale,
  Offline,
}

impl Availability {
  pub fn payload(self) -> &'static str {
    match self {
      Availability::Online => "online",
      Availability::Stale | Availability::Offline => "offline",
    }
  }
}

/// Sink for availability transitions. Implemented by the publisher so the
/// supervisor does not need to know about the MQTT client.
pub trait AvailabilityReporter {
  fn report_availability(&mut self, availability: Availability);
}

pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Per-bridge availability state machine. Call [`Supervisor::frame_received`]
/// on every valid bus frame and [`Supervisor::tick`] at least once per poll
/// interval.
pub struct Supervisor {
  stale_timeout: Duration,
  last_bus_rx: Instant,
  last_heartbeat: Instant,
  state: Availability,
}

impl Supervisor {
  pub fn new(stale_timeout: Duration) -> Self {
    let now = Instant::now();
    Supervisor {
      stale_timeout,
      last_bus_rx: now,
      last_heartbeat: now,
      state: Availability::Online,
    }
  }

  pub fn state(&self) -> Availability {
    self.state
  }

  pub fn frame_received(&mut self, reporter: &mut dyn AvailabilityReporter) {
    self.frame_received_at(Instant::now(), reporter);
  }

  pub fn frame_received_at(&mut self, now: Instant, reporter: &mut dyn AvailabilityReporter) {
    self.last_bus_rx = now;
    if self.state == Availability::Stale {
      info!("bus data resumed, marking online");
      self.state = Availability::Online;
      self.last_heartbeat = now;
      reporter.report_availability(Availability::Online);
    }
  }

  pub fn tick(&mut self, reporter: &mut dyn AvailabilityReporter) {
    self.tick_at(Instant::now(), reporter);
  }

  pub fn tick_at(&mut self, now: Instant, reporter: &mut dyn AvailabilityReporter) {
    match self.state {
      Availability::Online => {
        if now.duration_since(self.last_bus_rx) > self.stale_timeout {
          warn!(
            "no bus data for {}s, marking offline",
            self.stale_timeout.as_secs()
          );
          self.state = Availability::Stale;
          reporter.report_availability(Availability::Stale);
        } else if now.duration_since(self.last_heartbeat) >= HEARTBEAT_INTERVAL {
          self.last_heartbeat = now;
          reporter.report_availability(Availability::Online);
        }
      }
      // No heartbeat while stale; the retained offline stands until frames
      // resume or the process exits.
      Availability::Stale | Availability::Offline => {}
    }
  }

  /// Graceful-shutdown transition; terminal.
  pub fn shutdown(&mut self, reporter: &mut dyn AvailabilityReporter) {
    self.state = Availability::Offline;
    reporter.report_availability(Availability::Offline);
  }
}
