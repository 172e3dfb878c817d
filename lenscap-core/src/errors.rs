//! Error types for the `lenscap-core` crate.

use thiserror::Error;

/// Errors raised by the DER reader used for structural round-trips.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerError {
  /// Input ended before a complete tag/length/value triple
  #[error("truncated DER input")]
  Truncated,

  /// A length octet sequence that DER forbids
  #[error("invalid DER length encoding")]
  InvalidLength,
}

/// Errors raised while generating or signing certificates.
#[derive(Debug, Error)]
pub enum CertError {
  /// RSA key generation failed
  #[error("key generation failed: {0}")]
  KeyGeneration(rsa::Error),

  /// Producing the PKCS#1 signature failed
  #[error("signing failed: {0}")]
  Signing(rsa::Error),

  /// Serializing key material failed
  #[error("key encoding failed: {0}")]
  KeyEncoding(String),
}

/// Errors raised by the HTTP/1.1 codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
  #[error("malformed request: {0}")]
  MalformedRequest(String),

  #[error("malformed response: {0}")]
  MalformedResponse(String),

  /// The header block exceeded [`crate::http::MAX_HEADER_BYTES`]
  #[error("header block too large")]
  HeaderTooLarge,

  /// A bounded body read had to abort
  #[error("body exceeds configured cap")]
  BodyTooLarge,
}

/// Errors raised by the WebSocket codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
  /// A peer violated RFC 6455 framing rules
  #[error("websocket protocol violation: {0}")]
  ProtocolViolation(String),
}
