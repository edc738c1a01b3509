/// Scalar payload of a state topic.
///
/// Numeric payloads are canonicalized to `f64` so that `5` and `5.0` compare
/// equal. A change between the two variants always counts as a change.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Numeric(f64),
  Text(String),
}

impl Value {
  pub fn as_numeric(&self) -> Option<f64> {
    match self {
      Value::Numeric(n) => Some(*n),
      Value::Text(_) => None,
    }
  }

  /// Wire payload rendering. Numerics use the shortest round-trip form.
  pub fn payload(&self) -> String {
    match self {
      Value::Numeric(n) => format!("{n}"),
      Value::Text(s) => s.clone(),
    }
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Self {
    Value::Numeric(n)
  }
}

impl From<u16> for Value {
  fn from(n: u16) -> Self {
    Value::Numeric(f64::from(n))
  }
}

impl From<u32> for Value {
  fn from(n: u32) -> Self {
    Value::Numeric(f64::from(n))
  }
}

impl From<usize> for Value {
  fn from(n: usize) -> Self {
    Value::Numeric(n as f64)
  }
}

impl From<&str> for Value {
  // Strings that parse as a number are canonicalized, mirroring the numeric
  // comparison rule for payloads arriving in string form.
  fn from(s: &str) -> Self {
    match s.trim().parse::<f64>() {
      Ok(n) => Value::Numeric(n),
      Err(_) => Value::Text(s.to_string()),
    }
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::from(s.as_str())
  }
}

/// Round to a fixed number of decimal places.
///
/// Readings are rounded before publication so that jitter below the display
/// resolution does not defeat the equality gate in the publisher.
pub fn round_to(value: f64, decimals: u32) -> f64 {
  let factor = 10f64.powi(decimals as i32);
  (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn integer_and_float_forms_are_equal() {
    assert_eq!(Value::from("5"), Value::Numeric(5.0));
    assert_eq!(Value::from("5.0"), Value::Numeric(5.0));
    assert_eq!(Value::from(5.0f64), Value::from("5"));
  }

  #[test]
  fn text_never_equals_numeric() {
    assert_ne!(Value::Text("5".into()), Value::Numeric(5.0));
    assert_ne!(Value::from("on"), Value::Numeric(1.0));
  }

  #[test]
  fn payload_rendering() {
    assert_eq!(Value::Numeric(3.35).payload(), "3.35");
    assert_eq!(Value::Numeric(80.0).payload(), "80");
    assert_eq!(Value::Text("0x00FF".into()).payload(), "0x00FF");
  }

  #[test]
  fn rounding() {
    assert_eq!(round_to(3.14159, 3), 3.142);
    assert_eq!(round_to(48.649999, 1), 48.6);
    assert_eq!(round_to(-0.0049, 2), -0.0);
  }
}
