use lenscap_core::errors::{CertError, HttpError, WsError};
use thiserror::Error;

/// Which TLS leg of an intercepted connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  Client,
  Server,
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Side::Client => f.write_str("client-facing"),
      Side::Server => f.write_str("server-facing"),
    }
  }
}

/// Which timed wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Classify,
  ResponseHeaders,
  TunnelIdle,
  TlsHandshake,
  UpstreamConnect,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Phase::Classify => f.write_str("request classification"),
      Phase::ResponseHeaders => f.write_str("response headers"),
      Phase::TunnelIdle => f.write_str("tunnel traffic"),
      Phase::TlsHandshake => f.write_str("tls handshake"),
      Phase::UpstreamConnect => f.write_str("upstream connect"),
    }
  }
}

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("no certificate authority loaded")]
  CaUnavailable,

  #[error("certificate issuance failed: {0}")]
  CertIssue(#[from] CertError),

  #[error("upstream unreachable: {0}")]
  UpstreamUnreachable(String),

  #[error("upstream proxy protocol error: {0}")]
  UpstreamProtocol(String),

  #[error("{side} tls handshake failed: {detail}")]
  TlsHandshake { side: Side, detail: String },

  #[error(transparent)]
  Http(#[from] HttpError),

  #[error(transparent)]
  Ws(#[from] WsError),

  #[error("timed out waiting for {0}")]
  Timeout(Phase),

  #[error("persistence error: {0}")]
  Persistence(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl ProxyError {
  /// Stable label for the error column of a traffic record.
  pub fn record_label(&self) -> &'static str {
    match self {
      ProxyError::Config(_) => "ConfigError",
      ProxyError::CaUnavailable => "CaUnavailable",
      ProxyError::CertIssue(_) => "CertIssueFailed",
      ProxyError::UpstreamUnreachable(_) => "UpstreamUnreachable",
      ProxyError::UpstreamProtocol(_) => "UpstreamProtocol",
      ProxyError::TlsHandshake { .. } => "TlsHandshakeFailed",
      ProxyError::Http(HttpError::MalformedRequest(_)) => "MalformedRequest",
      ProxyError::Http(HttpError::MalformedResponse(_)) => "MalformedResponse",
      ProxyError::Http(HttpError::HeaderTooLarge) => "HeaderTooLarge",
      ProxyError::Http(HttpError::BodyTooLarge) => "BodyTooLarge",
      ProxyError::Ws(_) => "ProtocolViolation",
      ProxyError::Timeout(_) => "Timeout",
      ProxyError::Persistence(_) => "PersistenceError",
      ProxyError::Io(_) => "Io",
    }
  }
}
