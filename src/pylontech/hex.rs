/// Streaming cursor over the ASCII-hex INFO field of a response.
///
/// Reads advance in whole hex characters. Any read past the end of the input,
/// or over a non-hex character, returns `None` and leaves the cursor parked at
/// the end, so a truncated response terminates decoding cleanly with whatever
/// was decoded so far.
pub struct HexCursor<'a> {
  data: &'a str,
  pos: usize,
}

impl<'a> HexCursor<'a> {
  pub fn new(data: &'a str) -> Self {
    HexCursor { data, pos: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.data.len().saturating_sub(self.pos)
  }

  pub fn position(&self) -> usize {
    self.pos
  }

  /// Skip `chars` hex characters. Returns false (and exhausts the cursor) if
  /// fewer remain.
  pub fn skip(&mut self, chars: usize) -> bool {
    if self.remaining() < chars {
      self.pos = self.data.len();
      return false;
    }
    self.pos += chars;
    true
  }

  fn take(&mut self, chars: usize) -> Option<&'a str> {
    // `get` also rejects slicing through a non-ASCII character.
    match self.data.get(self.pos..self.pos + chars) {
      Some(s) => {
        self.pos += chars;
        Some(s)
      }
      None => {
        self.pos = self.data.len();
        None
      }
    }
  }

  fn parse(&mut self, chars: usize) -> Option<u32> {
    let s = self.take(chars)?;
    match u32::from_str_radix(s, 16) {
      Ok(v) => Some(v),
      Err(_) => {
        self.pos = self.data.len();
        None
      }
    }
  }

  /// Two hex characters.
  pub fn u8(&mut self) -> Option<u8> {
    self.parse(2).map(|v| v as u8)
  }

  /// Four hex characters.
  pub fn u16(&mut self) -> Option<u16> {
    self.parse(4).map(|v| v as u16)
  }

  /// Four hex characters, two's complement.
  pub fn i16(&mut self) -> Option<i16> {
    self.u16().map(|v| v as i16)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sequential_reads() {
    let mut c = HexCursor::new("0A10FFFF8000");
    assert_eq!(c.u8(), Some(0x0A));
    assert_eq!(c.u8(), Some(0x10));
    assert_eq!(c.u16(), Some(0xFFFF));
    assert_eq!(c.i16(), Some(i16::MIN));
    assert_eq!(c.remaining(), 0);
  }

  #[test]
  fn truncated_input_terminates() {
    let mut c = HexCursor::new("0A1");
    assert_eq!(c.u8(), Some(0x0A));
    assert_eq!(c.u8(), None);
    // Cursor is exhausted; further reads stay None.
    assert_eq!(c.u16(), None);
    assert_eq!(c.remaining(), 0);
  }

  #[test]
  fn non_hex_terminates() {
    let mut c = HexCursor::new("ZZ34");
    assert_eq!(c.u8(), None);
    assert_eq!(c.u8(), None);
  }
}
