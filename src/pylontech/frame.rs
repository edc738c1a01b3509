//! Pylontech RS485 frame codec.
//!
//! Frames are ASCII over 9600-8N1 serial:
//!
//! ```text
//! '~' VER(2) ADR(2) CID1(2) CID2(2) LENID(4) INFO(..) CHKSUM(4) '\r'    request
//! '~' VER(2) ADR(2) CID1(2) RTN(2)  LENID(4) INFO(..) CHKSUM(4) '\r'    response
//! ```
//!
//! All fields are uppercase hex digits. LENID carries the INFO length in its
//! low 12 bits and a 4-bit nibble-sum checksum of the three length digits in
//! its top nibble. CHKSUM is the negated 16-bit sum of the ASCII bytes between
//! `~` and CHKSUM.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 0x20;
/// Device type: lithium battery BMS.
pub const CID1_BATTERY: u8 = 0x46;

// '~' + 12 header chars + 4 checksum chars, terminator already trimmed.
const MIN_FRAME_CHARS: usize = 17;

/// Request commands understood by the battery modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  AnalogValues,
  AlarmInfo,
  SystemParameters,
  ManufacturerInfo,
  FirmwareVersion,
  SerialNumber,
}

impl Command {
  pub fn cid2(self) -> u8 {
    match self {
      Command::AnalogValues => 0x42,
      Command::AlarmInfo => 0x44,
      Command::SystemParameters => 0x4F,
      Command::ManufacturerInfo => 0x61,
      Command::FirmwareVersion => 0x62,
      Command::SerialNumber => 0x63,
    }
  }

  pub fn from_cid2(cid2: u8) -> Option<Command> {
    match cid2 {
      0x42 => Some(Command::AnalogValues),
      0x44 => Some(Command::AlarmInfo),
      0x4F => Some(Command::SystemParameters),
      0x61 => Some(Command::ManufacturerInfo),
      0x62 => Some(Command::FirmwareVersion),
      0x63 => Some(Command::SerialNumber),
      _ => None,
    }
  }
}

/// RTN byte of a response. Anything but `Ok` means the INFO field carries
/// nothing useful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
  Ok,
  VersionError,
  ChecksumError,
  LengthChecksumError,
  InvalidCid2,
  CommandFormatError,
  InvalidData,
  AddressError,
  CommunicationError,
  Other(u8),
}

impl ReturnCode {
  pub fn from_u8(v: u8) -> ReturnCode {
    match v {
      0x00 => ReturnCode::Ok,
      0x01 => ReturnCode::VersionError,
      0x02 => ReturnCode::ChecksumError,
      0x03 => ReturnCode::LengthChecksumError,
      0x04 => ReturnCode::InvalidCid2,
      0x05 => ReturnCode::CommandFormatError,
      0x06 => ReturnCode::InvalidData,
      0x90 => ReturnCode::AddressError,
      0x91 => ReturnCode::CommunicationError,
      other => ReturnCode::Other(other),
    }
  }
}

#[derive(Debug, Error)]
pub enum FrameError {
  #[error("frame too short: {0} chars")]
  TooShort(usize),
  #[error("frame does not start with '~'")]
  MissingStart,
  #[error("frame checksum mismatch: computed {computed:04X}, frame carries {carried:04X}")]
  ChecksumMismatch { computed: u16, carried: u16 },
  #[error("non-hex characters in frame header")]
  BadHex,
  #[error("INFO length {0} exceeds the 12-bit LENID range")]
  InfoTooLong(usize),
  #[error("device returned error status {0:?}")]
  Device(ReturnCode),
}

/// 16-bit frame checksum: negated sum of the ASCII bytes of the frame body
/// (everything between `~` and the checksum itself).
pub fn frame_checksum(body: &str) -> u16 {
  let total: u32 = body.bytes().map(u32::from).sum();
  (total.wrapping_neg() & 0xFFFF) as u16
}

/// Encode an INFO length into the 16-bit LENID field: top nibble is the
/// negated sum of the three length nibbles, low 12 bits are the length.
pub fn lenid_encode(info_chars: usize) -> Result<u16, FrameError> {
  if info_chars > 0xFFF {
    return Err(FrameError::InfoTooLong(info_chars));
  }
  let len = info_chars as u16;
  let nibble_sum = (len & 0xF) + ((len >> 4) & 0xF) + ((len >> 8) & 0xF);
  let check = nibble_sum.wrapping_neg() & 0xF;
  Ok((check << 12) | len)
}

/// Extract the INFO length from a LENID field, verifying its nibble checksum.
pub fn lenid_decode(lenid: u16) -> Option<usize> {
  let len = lenid & 0xFFF;
  let nibble_sum = (len & 0xF) + ((len >> 4) & 0xF) + ((len >> 8) & 0xF);
  let check = nibble_sum.wrapping_neg() & 0xF;
  if check == lenid >> 12 {
    Some(len as usize)
  } else {
    None
  }
}

/// Build a request frame. INFO is already hex-encoded (for the battery
/// commands it is a single battery-number byte, e.g. `"00"`).
pub fn encode_request(address: u8, command: Command, info: &str) -> Result<String, FrameError> {
  let lenid = lenid_encode(info.len())?;
  let body = format!(
    "{PROTOCOL_VERSION:02X}{address:02X}{CID1_BATTERY:02X}{cid2:02X}{lenid:04X}{info}",
    cid2 = command.cid2(),
  );
  let checksum = frame_checksum(&body);
  Ok(format!("~{body}{checksum:04X}\r"))
}

/// A parsed request, as a module on the bus would see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub version: u8,
  pub address: u8,
  pub cid1: u8,
  pub cid2: u8,
  pub info: String,
}

/// A parsed response. `info` is the raw hex INFO field, handed on to the
/// per-command decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub version: u8,
  pub address: u8,
  pub cid1: u8,
  pub info: String,
}

// Both frame kinds share the outer grammar; only the byte at offset 6 differs
// (CID2 for requests, RTN for responses).
fn frame_body(frame: &str) -> Result<&str, FrameError> {
  let frame = frame.trim_end_matches(['\r', '\n']);
  if !frame.starts_with('~') {
    return Err(FrameError::MissingStart);
  }
  // Keeps the fixed-offset slicing below byte-safe on line noise.
  if !frame.is_ascii() {
    return Err(FrameError::BadHex);
  }
  if frame.len() < MIN_FRAME_CHARS {
    return Err(FrameError::TooShort(frame.len()));
  }
  let content = &frame[1..];
  let (body, checksum_hex) = content.split_at(content.len() - 4);
  let carried = u16::from_str_radix(checksum_hex, 16).map_err(|_| FrameError::BadHex)?;
  let computed = frame_checksum(body);
  if computed != carried {
    return Err(FrameError::ChecksumMismatch { computed, carried });
  }
  Ok(body)
}

fn header_byte(body: &str, offset: usize) -> Result<u8, FrameError> {
  u8::from_str_radix(&body[offset..offset + 2], 16).map_err(|_| FrameError::BadHex)
}

/// Parse and checksum-verify a request frame.
pub fn decode_request(frame: &str) -> Result<Request, FrameError> {
  let body = frame_body(frame)?;
  Ok(Request {
    version: header_byte(body, 0)?,
    address: header_byte(body, 2)?,
    cid1: header_byte(body, 4)?,
    cid2: header_byte(body, 6)?,
    info: body[12..].to_string(),
  })
}

/// Parse and checksum-verify a response frame. A non-zero RTN is surfaced as
/// `FrameError::Device` since the INFO field is meaningless to the caller in
/// that case.
pub fn decode_response(frame: &str) -> Result<Response, FrameError> {
  let body = frame_body(frame)?;
  let rtn = ReturnCode::from_u8(header_byte(body, 6)?);
  if rtn != ReturnCode::Ok {
    return Err(FrameError::Device(rtn));
  }
  let info = &body[12..];
  if let Ok(lenid) = u16::from_str_radix(&body[8..12], 16) {
    // LENID is advisory on the read path; fixed offsets are authoritative.
    if lenid_decode(lenid) != Some(info.len()) {
      log::debug!("LENID disagrees with INFO length {} in response", info.len());
    }
  }
  Ok(Response {
    version: header_byte(body, 0)?,
    address: header_byte(body, 2)?,
    cid1: header_byte(body, 4)?,
    info: info.to_string(),
  })
}

/// Pull the next complete `~...\r` frame out of a serial accumulation buffer.
/// Garbage before the frame start is discarded.
pub fn take_frame(buf: &mut BytesMut) -> Option<String> {
  let start = buf.iter().position(|&b| b == b'~')?;
  if start > 0 {
    buf.advance(start);
  }
  let end = buf.iter().position(|&b| b == b'\r')?;
  let frame = buf.split_to(end + 1);
  Some(String::from_utf8_lossy(&frame).into_owned())
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test]
  fn lenid_round_trips_for_all_lengths() {
    for len in 0usize..=0xFFF {
      let lenid = lenid_encode(len).unwrap();
      assert_eq!(lenid_decode(lenid), Some(len), "len={len}");
    }
  }

  #[test]
  fn lenid_rejects_corrupt_check_nibble() {
    let lenid = lenid_encode(1).unwrap();
    assert_eq!(lenid_decode(lenid ^ 0x1000), None);
  }

  #[test]
  fn known_request_frame() {
    // Analog-values request with empty INFO to address 2.
    let frame = encode_request(0x02, Command::AnalogValues, "").unwrap();
    assert_eq!(frame, "~200246420000FDAC\r");
  }

  #[test_case(Command::AnalogValues, "00" ; "analog")]
  #[test_case(Command::AlarmInfo, "02" ; "alarm")]
  #[test_case(Command::SerialNumber, "" ; "serial")]
  fn request_round_trip(command: Command, info: &str) {
    let encoded = encode_request(0x02, command, info).unwrap();
    let decoded = decode_request(&encoded).unwrap();
    assert_eq!(decoded.version, PROTOCOL_VERSION);
    assert_eq!(decoded.address, 0x02);
    assert_eq!(decoded.cid1, CID1_BATTERY);
    assert_eq!(decoded.cid2, command.cid2());
    assert_eq!(decoded.info, info);
  }

  fn build_response(address: u8, rtn: u8, info: &str) -> String {
    let lenid = lenid_encode(info.len()).unwrap();
    let body = format!("{PROTOCOL_VERSION:02X}{address:02X}{CID1_BATTERY:02X}{rtn:02X}{lenid:04X}{info}");
    let checksum = frame_checksum(&body);
    format!("~{body}{checksum:04X}\r")
  }

  #[test]
  fn response_decode() {
    let frame = build_response(0x02, 0x00, "00010203");
    let resp = decode_response(&frame).unwrap();
    assert_eq!(resp.address, 0x02);
    assert_eq!(resp.info, "00010203");
  }

  #[test]
  fn response_with_error_status() {
    let frame = build_response(0x02, 0x04, "");
    match decode_response(&frame) {
      Err(FrameError::Device(ReturnCode::InvalidCid2)) => {}
      other => panic!("expected device error, got {other:?}"),
    }
  }

  #[test]
  fn corrupted_checksum_is_rejected() {
    let mut frame = build_response(0x02, 0x00, "00");
    // Flip one INFO character without fixing the checksum.
    frame.replace_range(13..14, "1");
    assert!(matches!(
      decode_response(&frame),
      Err(FrameError::ChecksumMismatch { .. })
    ));
  }

  #[test]
  fn frame_extraction_skips_noise() {
    let mut buf = BytesMut::from(&b"\x00\x00~2002464200"[..]);
    assert_eq!(take_frame(&mut buf), None);
    buf.extend_from_slice(b"00FDAC\r~20");
    assert_eq!(take_frame(&mut buf).as_deref(), Some("~200246420000FDAC\r"));
    // The partial second frame stays buffered.
    assert_eq!(&buf[..], b"~20");
  }
}
