//! # WebSocket Codec
//!
//! RFC 6455 frame (de)serialization for intercepted streams. The engine
//! relays wire bytes untouched and runs this codec over a copy, so parsing
//! returns how many bytes each frame occupied. Masking direction rules are
//! enforced here: client frames must be masked, server frames must not.

use sha1::{Digest, Sha1};

use crate::{errors::WsError, records::Direction};

/// GUID appended to the client key for the handshake digest.
pub const HANDSHAKE_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` = base64(SHA-1(client_key || MAGIC)).
pub fn accept_key(client_key: &str) -> String {
  use base64::Engine;
  let mut hasher = Sha1::new();
  hasher.update(client_key.as_bytes());
  hasher.update(HANDSHAKE_MAGIC.as_bytes());
  base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// XOR of payload byte `i` with key byte `i mod 4`; involutive.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
  for (i, byte) in payload.iter_mut().enumerate() {
    *byte ^= key[i % 4];
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
  Continuation,
  Text,
  Binary,
  Close,
  Ping,
  Pong,
}

impl Opcode {
  pub fn from_wire(nibble: u8) -> Result<Opcode, WsError> {
    match nibble {
      0x0 => Ok(Opcode::Continuation),
      0x1 => Ok(Opcode::Text),
      0x2 => Ok(Opcode::Binary),
      0x8 => Ok(Opcode::Close),
      0x9 => Ok(Opcode::Ping),
      0xA => Ok(Opcode::Pong),
      other => Err(WsError::ProtocolViolation(format!("reserved opcode {other:#x}"))),
    }
  }

  pub fn to_wire(self) -> u8 {
    match self {
      Opcode::Continuation => 0x0,
      Opcode::Text => 0x1,
      Opcode::Binary => 0x2,
      Opcode::Close => 0x8,
      Opcode::Ping => 0x9,
      Opcode::Pong => 0xA,
    }
  }

  pub fn is_control(self) -> bool { self.to_wire() >= 0x8 }
}

/// One decoded frame; the payload is stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub fin:     bool,
  pub opcode:  Opcode,
  pub masked:  bool,
  pub payload: Vec<u8>,
}

/// Parses one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered, else the frame and the
/// number of wire bytes it occupied. `direction` drives the masking rule.
pub fn parse_frame(buf: &[u8], direction: Direction) -> Result<Option<(Frame, usize)>, WsError> {
  if buf.len() < 2 {
    return Ok(None);
  }
  if buf[0] & 0x70 != 0 {
    return Err(WsError::ProtocolViolation("non-zero RSV bits without extension".into()));
  }
  let fin = buf[0] & 0x80 != 0;
  let opcode = Opcode::from_wire(buf[0] & 0x0F)?;
  let masked = buf[1] & 0x80 != 0;

  match direction {
    Direction::ClientToServer if !masked =>
      return Err(WsError::ProtocolViolation("client frame is not masked".into())),
    Direction::ServerToClient if masked =>
      return Err(WsError::ProtocolViolation("server frame is masked".into())),
    _ => {},
  }

  let len7 = (buf[1] & 0x7F) as u64;
  let (length, mut offset) = match len7 {
    126 => {
      if buf.len() < 4 {
        return Ok(None);
      }
      (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
    },
    127 => {
      if buf.len() < 10 {
        return Ok(None);
      }
      (u64::from_be_bytes(buf[2..10].try_into().expect("slice is 8 bytes")), 10)
    },
    n => (n, 2),
  };

  if opcode.is_control() {
    if !fin {
      return Err(WsError::ProtocolViolation("fragmented control frame".into()));
    }
    if length > 125 {
      return Err(WsError::ProtocolViolation("control payload exceeds 125 bytes".into()));
    }
  }

  let key = if masked {
    if buf.len() < offset + 4 {
      return Ok(None);
    }
    let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
    offset += 4;
    Some(key)
  } else {
    None
  };

  let total = offset
    .checked_add(length as usize)
    .ok_or_else(|| WsError::ProtocolViolation("frame length overflow".into()))?;
  if buf.len() < total {
    return Ok(None);
  }

  let mut payload = buf[offset..total].to_vec();
  if let Some(key) = key {
    apply_mask(&mut payload, key);
  }

  Ok(Some((Frame { fin, opcode, masked, payload }, total)))
}

/// Serializes a frame, masking the payload when `mask` is given.
pub fn build_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
  let mut out = Vec::with_capacity(payload.len() + 14);
  out.push(if fin { 0x80 } else { 0x00 } | opcode.to_wire());

  let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
  match payload.len() {
    n if n < 126 => out.push(mask_bit | n as u8),
    n if n <= u16::MAX as usize => {
      out.push(mask_bit | 126);
      out.extend_from_slice(&(n as u16).to_be_bytes());
    },
    n => {
      out.push(mask_bit | 127);
      out.extend_from_slice(&(n as u64).to_be_bytes());
    },
  }

  match mask {
    Some(key) => {
      out.extend_from_slice(&key);
      let start = out.len();
      out.extend_from_slice(payload);
      apply_mask(&mut out[start..], key);
    },
    None => out.extend_from_slice(payload),
  }
  out
}

/// A complete application message or a pass-through control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub opcode:  Opcode,
  pub payload: Vec<u8>,
}

/// Per-direction fragmentation state: one buffer and the in-flight opcode.
///
/// Control frames pass through immediately, even interleaved with a
/// fragmented message.
#[derive(Debug, Default)]
pub struct MessageAssembler {
  buffer:    Vec<u8>,
  in_flight: Option<Opcode>,
}

impl MessageAssembler {
  pub fn new() -> Self { Self::default() }

  /// Feeds one frame; returns a completed message when FIN closes it.
  pub fn push(&mut self, frame: &Frame) -> Result<Option<Message>, WsError> {
    if frame.opcode.is_control() {
      return Ok(Some(Message { opcode: frame.opcode, payload: frame.payload.clone() }));
    }
    match frame.opcode {
      Opcode::Continuation => {
        let opcode = self.in_flight.ok_or_else(|| {
          WsError::ProtocolViolation("continuation frame without a message in flight".into())
        })?;
        self.buffer.extend_from_slice(&frame.payload);
        if frame.fin {
          self.in_flight = None;
          Ok(Some(Message { opcode, payload: std::mem::take(&mut self.buffer) }))
        } else {
          Ok(None)
        }
      },
      opcode => {
        if self.in_flight.is_some() {
          return Err(WsError::ProtocolViolation(
            "data frame interleaved with a fragmented message".into(),
          ));
        }
        if frame.fin {
          return Ok(Some(Message { opcode, payload: frame.payload.clone() }));
        }
        self.in_flight = Some(opcode);
        self.buffer.extend_from_slice(&frame.payload);
        Ok(None)
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_accept_key_rfc_sample() {
    assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
  }

  #[test]
  fn test_mask_is_involutive() {
    let key = [0x37, 0xFA, 0x21, 0x3D];
    let original = b"some payload bytes".to_vec();
    let mut masked = original.clone();
    apply_mask(&mut masked, key);
    assert_ne!(masked, original);
    apply_mask(&mut masked, key);
    assert_eq!(masked, original);
  }

  #[test]
  fn test_parse_unmasked_server_text_frame() {
    // RFC 6455 §5.7: "Hello" from the server.
    let wire = [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F];
    let (frame, consumed) = parse_frame(&wire, Direction::ServerToClient).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(frame.fin);
    assert!(!frame.masked);
    assert_eq!(frame.payload, b"Hello");
  }

  #[test]
  fn test_parse_masked_client_text_frame() {
    // RFC 6455 §5.7: masked "Hello" from the client.
    let wire = [0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58];
    let (frame, _) = parse_frame(&wire, Direction::ClientToServer).unwrap().unwrap();
    assert_eq!(frame.payload, b"Hello");
    assert!(frame.masked);
  }

  #[test]
  fn test_masking_direction_rules() {
    let unmasked = [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F];
    assert!(matches!(
      parse_frame(&unmasked, Direction::ClientToServer),
      Err(WsError::ProtocolViolation(_))
    ));
    let masked = [0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58];
    assert!(matches!(
      parse_frame(&masked, Direction::ServerToClient),
      Err(WsError::ProtocolViolation(_))
    ));
  }

  #[test]
  fn test_parse_incomplete_frame() {
    let wire = [0x81, 0x05, 0x48, 0x65];
    assert_eq!(parse_frame(&wire, Direction::ServerToClient).unwrap(), None);
    assert_eq!(parse_frame(&[0x81], Direction::ServerToClient).unwrap(), None);
  }

  #[test]
  fn test_extended_16_bit_length_round_trip() {
    let payload = vec![0xAB; 300];
    let wire = build_frame(true, Opcode::Binary, &payload, None);
    assert_eq!(wire[1], 126);
    let (frame, consumed) = parse_frame(&wire, Direction::ServerToClient).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    assert_eq!(frame.payload, payload);
  }

  #[test]
  fn test_build_masked_frame_round_trip() {
    let wire = build_frame(true, Opcode::Text, b"hi", Some([1, 2, 3, 4]));
    let (frame, _) = parse_frame(&wire, Direction::ClientToServer).unwrap().unwrap();
    assert_eq!(frame.payload, b"hi");
  }

  #[test]
  fn test_control_frame_rules() {
    // Fragmented ping.
    let wire = [0x09, 0x00];
    assert!(matches!(
      parse_frame(&wire, Direction::ServerToClient),
      Err(WsError::ProtocolViolation(_))
    ));
    // Oversize close payload.
    let big = build_frame(true, Opcode::Binary, &vec![0; 200], None);
    let mut forged = big.clone();
    forged[0] = 0x88;
    assert!(matches!(
      parse_frame(&forged, Direction::ServerToClient),
      Err(WsError::ProtocolViolation(_))
    ));
  }

  #[test]
  fn test_rsv_bits_rejected() {
    let wire = [0xC1, 0x00];
    assert!(matches!(
      parse_frame(&wire, Direction::ServerToClient),
      Err(WsError::ProtocolViolation(_))
    ));
  }

  #[test]
  fn test_reassembly_of_fragmented_message() {
    let mut assembler = MessageAssembler::new();
    let first = Frame { fin: false, opcode: Opcode::Text, masked: false, payload: b"Hel".to_vec() };
    let last =
      Frame { fin: true, opcode: Opcode::Continuation, masked: false, payload: b"lo".to_vec() };
    assert_eq!(assembler.push(&first).unwrap(), None);
    let message = assembler.push(&last).unwrap().unwrap();
    assert_eq!(message.opcode, Opcode::Text);
    assert_eq!(message.payload, b"Hello");
  }

  #[test]
  fn test_control_frames_pass_through_mid_message() {
    let mut assembler = MessageAssembler::new();
    let first = Frame { fin: false, opcode: Opcode::Text, masked: false, payload: b"Hel".to_vec() };
    assert_eq!(assembler.push(&first).unwrap(), None);

    let ping = Frame { fin: true, opcode: Opcode::Ping, masked: false, payload: b"p".to_vec() };
    let out = assembler.push(&ping).unwrap().unwrap();
    assert_eq!(out.opcode, Opcode::Ping);

    let last =
      Frame { fin: true, opcode: Opcode::Continuation, masked: false, payload: b"lo".to_vec() };
    assert_eq!(assembler.push(&last).unwrap().unwrap().payload, b"Hello");
  }

  #[test]
  fn test_reassembly_violations() {
    let mut assembler = MessageAssembler::new();
    let orphan =
      Frame { fin: true, opcode: Opcode::Continuation, masked: false, payload: vec![] };
    assert!(matches!(assembler.push(&orphan), Err(WsError::ProtocolViolation(_))));

    let mut assembler = MessageAssembler::new();
    let first = Frame { fin: false, opcode: Opcode::Text, masked: false, payload: b"a".to_vec() };
    assembler.push(&first).unwrap();
    let interleaved =
      Frame { fin: true, opcode: Opcode::Binary, masked: false, payload: b"b".to_vec() };
    assert!(matches!(assembler.push(&interleaved), Err(WsError::ProtocolViolation(_))));
  }
}
