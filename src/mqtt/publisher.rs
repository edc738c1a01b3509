//! Rate-limited, hysteresis-aware state publishing.
//!
//! Every state topic carries a small cache of the last published payload and
//! its timestamp. A new value goes out only when it cleared the per-call
//! minimum interval AND either changed (by at least the hysteresis, when one
//! is given) or the force-republish interval elapsed. The force interval is
//! the liveness bound: even a stuck sensor refreshes its topic once a minute.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::supervisor::{Availability, AvailabilityReporter};
use crate::value::Value;

/// Upper bound on the gap between publishes of an unchanged value.
pub const FORCE_PUBLISH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error("publish rejected: {0}")]
pub struct SinkError(pub String);

/// Outbound seam towards the broker. The production implementation enqueues
/// into the MQTT client; tests record.
pub trait MessageSink {
  fn send(&self, topic: &str, payload: &str, retain: bool) -> Result<(), SinkError>;
}

/// Per-call publish options.
#[derive(Debug, Clone, Copy)]
pub struct PublishOpts {
  pub retain: bool,
  /// Hard floor between successive publishes of one topic.
  pub min_interval: Duration,
  /// Minimum absolute change required to publish, numeric values only.
  pub hysteresis: Option<f64>,
}

impl Default for PublishOpts {
  fn default() -> Self {
    PublishOpts {
      retain: false,
      min_interval: Duration::from_secs(1),
      hysteresis: None,
    }
  }
}

impl PublishOpts {
  pub fn retained() -> Self {
    PublishOpts {
      retain: true,
      ..PublishOpts::default()
    }
  }

  pub fn min_interval(mut self, interval: Duration) -> Self {
    self.min_interval = interval;
    self
  }

  pub fn hysteresis(mut self, hysteresis: f64) -> Self {
    self.hysteresis = Some(hysteresis);
    self
  }
}

struct PublishState {
  last_value: Value,
  last_publish: Instant,
}

/// State-topic publisher for one bridge. There is exactly one per process, so
/// publishes to a single topic are totally ordered.
pub struct Publisher<S: MessageSink> {
  sink: S,
  prefix: String,
  availability_topic: String,
  states: HashMap<String, PublishState>,
}

impl<S: MessageSink> Publisher<S> {
  pub fn new(sink: S, prefix: impl Into<String>) -> Self {
    let prefix = prefix.into();
    let availability_topic = format!("{prefix}/status");
    Publisher {
      sink,
      prefix,
      availability_topic,
      states: HashMap::new(),
    }
  }

  pub fn availability_topic(&self) -> &str {
    &self.availability_topic
  }

  pub fn sink(&self) -> &S {
    &self.sink
  }

  /// Publish `value` under `<prefix>/<topic>`, subject to the gates described
  /// at the module level. Returns whether a message went out. Broker-side
  /// rejections are swallowed; the cache is only updated on success, so the
  /// next call retries.
  pub fn publish(&mut self, topic: &str, value: impl Into<Value>, opts: PublishOpts) -> bool {
    self.publish_at(Instant::now(), topic, value.into(), opts)
  }

  pub fn publish_at(&mut self, now: Instant, topic: &str, value: Value, opts: PublishOpts) -> bool {
    let full_topic = format!("{}/{}", self.prefix, topic);

    let (previous, force_due) = match self.states.get(&full_topic) {
      Some(state) => {
        if now.duration_since(state.last_publish) < opts.min_interval {
          return false;
        }
        let force_due = now.duration_since(state.last_publish) >= FORCE_PUBLISH_INTERVAL;
        (Some(&state.last_value), force_due)
      }
      None => (None, false),
    };

    let should_publish = match opts.hysteresis {
      Some(hysteresis) => {
        // Hysteresis only makes sense for numbers.
        let Some(new) = value.as_numeric() else {
          return false;
        };
        match previous.and_then(Value::as_numeric) {
          // Delta compared at 1e-9 resolution so representation noise cannot
          // mask an exact-threshold change.
          Some(prev) => force_due || crate::value::round_to((new - prev).abs(), 9) >= hysteresis,
          None => true,
        }
      }
      None => force_due || previous != Some(&value),
    };
    if !should_publish {
      return false;
    }

    if let Err(e) = self.sink.send(&full_topic, &value.payload(), opts.retain) {
      warn!("publish to {full_topic} failed: {e}");
      return false;
    }
    self.states.insert(
      full_topic,
      PublishState {
        last_value: value,
        last_publish: now,
      },
    );
    true
  }

  /// Uncached publish of an absolute topic. Availability edges and discovery
  /// documents go through here: they must reach the broker every time, not be
  /// deduplicated against earlier payloads.
  pub fn send_raw(&self, topic: &str, payload: &str, retain: bool) -> bool {
    match self.sink.send(topic, payload, retain) {
      Ok(()) => true,
      Err(e) => {
        warn!("publish to {topic} failed: {e}");
        false
      }
    }
  }
}

impl<S: MessageSink> AvailabilityReporter for Publisher<S> {
  fn report_availability(&mut self, availability: Availability) {
    let topic = self.availability_topic.clone();
    self.send_raw(&topic, availability.payload(), true);
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use super::*;

  /// Sink that records every accepted message, optionally failing.
  #[derive(Default)]
  struct RecordingSink {
    messages: RefCell<Vec<(String, String, bool)>>,
    fail: std::cell::Cell<bool>,
  }

  impl MessageSink for RecordingSink {
    fn send(&self, topic: &str, payload: &str, retain: bool) -> Result<(), SinkError> {
      if self.fail.get() {
        return Err(SinkError("broker unavailable".into()));
      }
      self
        .messages
        .borrow_mut()
        .push((topic.to_string(), payload.to_string(), retain));
      Ok(())
    }
  }

  fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
  }

  #[test]
  fn first_publish_is_unconditional() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    assert!(p.publish("soc", 80.0, PublishOpts::default()));
    let messages = p.sink().messages.borrow();
    assert_eq!(messages[0], ("deye_bms/soc".to_string(), "80".to_string(), false));
  }

  #[test]
  fn unchanged_value_is_suppressed_until_force_interval() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let t0 = Instant::now();
    assert!(p.publish_at(t0, "soc", Value::Numeric(80.0), PublishOpts::default()));
    // Same value every 10 s: quiet until the 60 s force point.
    for offset in [10.0, 20.0, 30.0, 40.0, 50.0] {
      assert!(!p.publish_at(t0 + secs(offset), "soc", Value::Numeric(80.0), PublishOpts::default()));
    }
    assert!(p.publish_at(t0 + secs(60.0), "soc", Value::Numeric(80.0), PublishOpts::default()));
    assert_eq!(p.sink().messages.borrow().len(), 2);
  }

  #[test]
  fn hysteresis_scenario() {
    // min_interval 1 s, hysteresis 0.01 V over the sequence
    // (0.0, 3.350) (0.5, 3.351) (1.5, 3.353) (2.5, 3.360):
    // exactly the first and last publish.
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let opts = PublishOpts::default().hysteresis(0.01);
    let t0 = Instant::now();
    assert!(p.publish_at(t0, "ext/cell_v_min", Value::Numeric(3.350), opts));
    assert!(!p.publish_at(t0 + secs(0.5), "ext/cell_v_min", Value::Numeric(3.351), opts));
    assert!(!p.publish_at(t0 + secs(1.5), "ext/cell_v_min", Value::Numeric(3.353), opts));
    assert!(p.publish_at(t0 + secs(2.5), "ext/cell_v_min", Value::Numeric(3.360), opts));
    assert_eq!(p.sink().messages.borrow().len(), 2);
  }

  #[test]
  fn hysteresis_quietness_with_forced_refresh() {
    // Values jitter within the hysteresis band: at most one publish per
    // force window.
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let opts = PublishOpts::default().hysteresis(0.01);
    let t0 = Instant::now();
    let jitter = [3.350, 3.351, 3.352, 3.351, 3.350, 3.352];
    let mut published = 0;
    for i in 0..120 {
      let value = jitter[i % jitter.len()];
      if p.publish_at(t0 + secs(i as f64), "cell", Value::Numeric(value), opts) {
        published += 1;
      }
    }
    // t=0 plus one forced refresh per elapsed minute.
    assert_eq!(published, 2);
  }

  #[test]
  fn min_interval_floors_even_changed_values() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let opts = PublishOpts::default().min_interval(secs(5.0));
    let t0 = Instant::now();
    assert!(p.publish_at(t0, "soc", Value::Numeric(80.0), opts));
    assert!(!p.publish_at(t0 + secs(2.0), "soc", Value::Numeric(81.0), opts));
    assert!(p.publish_at(t0 + secs(5.0), "soc", Value::Numeric(81.0), opts));
  }

  #[test]
  fn type_switch_always_publishes() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let t0 = Instant::now();
    assert!(p.publish_at(t0, "flags", Value::Numeric(5.0), PublishOpts::default()));
    assert!(p.publish_at(t0 + secs(2.0), "flags", Value::Text("5x".into()), PublishOpts::default()));
    assert!(p.publish_at(t0 + secs(4.0), "flags", Value::Numeric(5.0), PublishOpts::default()));
  }

  #[test]
  fn numeric_strings_compare_canonically() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let t0 = Instant::now();
    assert!(p.publish_at(t0, "soc", Value::from("5"), PublishOpts::default()));
    assert!(!p.publish_at(t0 + secs(2.0), "soc", Value::from("5.0"), PublishOpts::default()));
  }

  #[test]
  fn non_numeric_value_with_hysteresis_is_suppressed() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let opts = PublishOpts::default().hysteresis(0.01);
    assert!(!p.publish("state", Value::Text("Charge".into()), opts));
    assert!(p.sink().messages.borrow().is_empty());
  }

  #[test]
  fn failed_send_leaves_cache_untouched() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    let t0 = Instant::now();
    p.sink().fail.set(true);
    assert!(!p.publish_at(t0, "soc", Value::Numeric(80.0), PublishOpts::default()));
    p.sink().fail.set(false);
    // Same value goes straight out once the broker accepts again.
    assert!(p.publish_at(t0 + secs(1.0), "soc", Value::Numeric(80.0), PublishOpts::default()));
  }

  #[test]
  fn availability_reports_are_retained_and_uncached() {
    let mut p = Publisher::new(RecordingSink::default(), "deye_bms");
    p.report_availability(Availability::Online);
    p.report_availability(Availability::Online);
    let messages = p.sink().messages.borrow();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], ("deye_bms/status".to_string(), "online".to_string(), true));
  }
}
