//! # DER Codec
//!
//! Primitive ASN.1 encoders per ITU-T X.690, used by the X.509 builder. Each
//! function returns a complete tag/length/value byte sequence. A minimal
//! structural reader backs the round-trip guarantees of the certificate
//! builder.

use chrono::{DateTime, Datelike, Utc};

use crate::errors::DerError;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// First calendar year that requires GeneralizedTime instead of UTCTime.
const GENERALIZED_TIME_FLOOR: i32 = 2050;

/// Encodes a tag, DER length octets, and the value in one buffer.
pub fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(2 + value.len());
  out.push(tag);
  encode_length(value.len(), &mut out);
  out.extend_from_slice(value);
  out
}

/// Short form below 128, long form `0x80 | N` followed by N big-endian bytes.
fn encode_length(len: usize, out: &mut Vec<u8>) {
  if len < 128 {
    out.push(len as u8);
  } else {
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
  }
}

/// INTEGER from an unsigned big-endian magnitude. Leading zeros are stripped
/// to the minimal form and `0x00` is prepended when the MSB is set.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
  let stripped: &[u8] = {
    let skip = magnitude.iter().take_while(|b| **b == 0).count();
    &magnitude[skip.min(magnitude.len().saturating_sub(1))..]
  };
  if stripped.is_empty() {
    return tlv(TAG_INTEGER, &[0]);
  }
  if stripped[0] & 0x80 != 0 {
    let mut value = Vec::with_capacity(stripped.len() + 1);
    value.push(0x00);
    value.extend_from_slice(stripped);
    tlv(TAG_INTEGER, &value)
  } else {
    tlv(TAG_INTEGER, stripped)
  }
}

/// BIT STRING with no unused bits: a single zero prefix byte.
pub fn bit_string(bits: &[u8]) -> Vec<u8> {
  let mut value = Vec::with_capacity(bits.len() + 1);
  value.push(0x00);
  value.extend_from_slice(bits);
  tlv(TAG_BIT_STRING, &value)
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> { tlv(TAG_OCTET_STRING, bytes) }

pub fn boolean(value: bool) -> Vec<u8> { tlv(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]) }

pub fn null() -> Vec<u8> { tlv(TAG_NULL, &[]) }

/// OBJECT IDENTIFIER: base-40 packing for the first two arcs, then 7-bit
/// variable-length encoding with the continuation bit on all non-terminal
/// bytes.
pub fn oid(arcs: &[u64]) -> Vec<u8> {
  debug_assert!(arcs.len() >= 2, "an OID has at least two arcs");
  let mut value = Vec::new();
  encode_base128(arcs[0] * 40 + arcs[1], &mut value);
  for arc in &arcs[2..] {
    encode_base128(*arc, &mut value);
  }
  tlv(TAG_OID, &value)
}

fn encode_base128(mut arc: u64, out: &mut Vec<u8>) {
  let mut chunk = [0u8; 10];
  let mut n = 0;
  loop {
    chunk[n] = (arc & 0x7F) as u8;
    arc >>= 7;
    n += 1;
    if arc == 0 {
      break;
    }
  }
  for i in (0..n).rev() {
    let continuation = if i == 0 { 0x00 } else { 0x80 };
    out.push(chunk[i] | continuation);
  }
}

pub fn printable_string(s: &str) -> Vec<u8> { tlv(TAG_PRINTABLE_STRING, s.as_bytes()) }

pub fn utf8_string(s: &str) -> Vec<u8> { tlv(TAG_UTF8_STRING, s.as_bytes()) }

pub fn ia5_string(s: &str) -> Vec<u8> { tlv(TAG_IA5_STRING, s.as_bytes()) }

/// UTCTime `YYMMDDHHMMSSZ` in UTC. Only valid for dates before 2050.
pub fn utc_time(at: &DateTime<Utc>) -> Vec<u8> {
  tlv(TAG_UTC_TIME, at.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

/// GeneralizedTime `YYYYMMDDHHMMSSZ` in UTC.
pub fn generalized_time(at: &DateTime<Utc>) -> Vec<u8> {
  tlv(TAG_GENERALIZED_TIME, at.format("%Y%m%d%H%M%SZ").to_string().as_bytes())
}

/// X.509 Time: UTCTime through 2049, GeneralizedTime from 2050 on.
pub fn time(at: &DateTime<Utc>) -> Vec<u8> {
  if at.year() >= GENERALIZED_TIME_FLOOR {
    generalized_time(at)
  } else {
    utc_time(at)
  }
}

/// SEQUENCE over already-encoded children.
pub fn sequence(content: &[u8]) -> Vec<u8> { tlv(TAG_SEQUENCE, content) }

/// SET over already-encoded children.
pub fn set(content: &[u8]) -> Vec<u8> { tlv(TAG_SET, content) }

/// Context-specific EXPLICIT tag: class bits `0b10` with the constructed bit.
pub fn explicit(tag: u8, content: &[u8]) -> Vec<u8> { tlv(0xA0 | tag, content) }

/// Context-specific IMPLICIT tag: class bits `0b10`, primitive. The content
/// is the raw value of the underlying type, re-tagged.
pub fn implicit(tag: u8, content: &[u8]) -> Vec<u8> { tlv(0x80 | tag, content) }

/// Concatenates encoded elements, the building block for composites.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
  let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
  for part in parts {
    out.extend_from_slice(part);
  }
  out
}

/// One decoded tag/length/value triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
  pub tag:   u8,
  pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
  pub fn is_constructed(&self) -> bool { self.tag & 0x20 != 0 }
}

/// Reads one TLV from the front of `input`, returning it and the remainder.
pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), DerError> {
  if input.len() < 2 {
    return Err(DerError::Truncated);
  }
  let tag = input[0];
  let (len, header) = if input[1] < 0x80 {
    (input[1] as usize, 2)
  } else {
    let count = (input[1] & 0x7F) as usize;
    if count == 0 || count > 8 || input.len() < 2 + count {
      return Err(DerError::InvalidLength);
    }
    let mut len = 0usize;
    for byte in &input[2..2 + count] {
      len = len.checked_shl(8).ok_or(DerError::InvalidLength)? | *byte as usize;
    }
    (len, 2 + count)
  };
  if input.len() < header + len {
    return Err(DerError::Truncated);
  }
  Ok((Tlv { tag, value: &input[header..header + len] }, &input[header + len..]))
}

/// Decodes `input` structurally and re-encodes it. Constructed values are
/// walked recursively, primitives copied verbatim; the result must be
/// byte-identical for anything this codec produced.
pub fn reencode(input: &[u8]) -> Result<Vec<u8>, DerError> {
  let mut out = Vec::with_capacity(input.len());
  let mut rest = input;
  while !rest.is_empty() {
    let (element, remainder) = read_tlv(rest)?;
    let value =
      if element.is_constructed() { reencode(element.value)? } else { element.value.to_vec() };
    out.extend_from_slice(&tlv(element.tag, &value));
    rest = remainder;
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn test_short_and_long_form_lengths() {
    assert_eq!(tlv(TAG_OCTET_STRING, &[0xAB; 127])[..2], [0x04, 0x7F]);
    let long = tlv(TAG_OCTET_STRING, &[0xAB; 128]);
    assert_eq!(long[..3], [0x04, 0x81, 0x80]);
    let longer = tlv(TAG_OCTET_STRING, &[0xAB; 300]);
    assert_eq!(longer[..4], [0x04, 0x82, 0x01, 0x2C]);
  }

  #[test]
  fn test_integer_prepends_zero_for_high_msb() {
    assert_eq!(integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
    assert_eq!(integer(&[0x7F]), vec![0x02, 0x01, 0x7F]);
    assert_eq!(integer(&[2]), vec![0x02, 0x01, 0x02]);
  }

  #[test]
  fn test_integer_strips_redundant_leading_zeros() {
    assert_eq!(integer(&[0x00, 0x00, 0x01]), vec![0x02, 0x01, 0x01]);
    assert_eq!(integer(&[0x00, 0x8F]), vec![0x02, 0x02, 0x00, 0x8F]);
    assert_eq!(integer(&[0x00]), vec![0x02, 0x01, 0x00]);
  }

  #[test]
  fn test_bit_string_has_zero_unused_bits_prefix() {
    assert_eq!(bit_string(&[0xA0]), vec![0x03, 0x02, 0x00, 0xA0]);
  }

  #[test]
  fn test_oid_known_vectors() {
    // sha256WithRSAEncryption 1.2.840.113549.1.1.11
    assert_eq!(oid(&[1, 2, 840, 113549, 1, 1, 11]), vec![
      0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B
    ]);
    // id-ce-basicConstraints 2.5.29.19
    assert_eq!(oid(&[2, 5, 29, 19]), vec![0x06, 0x03, 0x55, 0x1D, 0x13]);
  }

  #[test]
  fn test_time_switches_to_generalized_in_2050() {
    let before = Utc.with_ymd_and_hms(2035, 6, 1, 12, 0, 0).unwrap();
    assert_eq!(time(&before)[0], TAG_UTC_TIME);
    assert_eq!(&time(&before)[2..], b"350601120000Z");

    let after = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(time(&after)[0], TAG_GENERALIZED_TIME);
    assert_eq!(&time(&after)[2..], b"20500101000000Z");
  }

  #[test]
  fn test_explicit_and_implicit_tag_classes() {
    assert_eq!(explicit(0, &[0x02, 0x01, 0x02])[0], 0xA0);
    assert_eq!(implicit(2, b"example.com")[0], 0x82);
    assert_eq!(implicit(7, &[127, 0, 0, 1])[0], 0x87);
  }

  #[test]
  fn test_reencode_round_trip() {
    let inner = concat(&[&integer(&[0x42]), &ia5_string("example.com"), &boolean(true)]);
    let original = sequence(&concat(&[&sequence(&inner), &octet_string(&[1, 2, 3])]));
    assert_eq!(reencode(&original).unwrap(), original);
  }

  #[test]
  fn test_read_tlv_rejects_truncated_input() {
    assert_eq!(read_tlv(&[0x30]), Err(DerError::Truncated));
    assert_eq!(read_tlv(&[0x30, 0x05, 0x01]), Err(DerError::Truncated));
  }
}
