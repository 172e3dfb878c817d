//! Traffic record model: the immutable capture rows the engine persists and
//! the in-flight [`Exchange`] that accumulates one request/response pair.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  http::{Request, Response},
  websocket::{Frame, Opcode},
};

/// Application protocol of a captured exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Http,
  Https,
  Ws,
  Wss,
}

impl Protocol {
  pub fn as_str(&self) -> &'static str {
    match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
      Protocol::Ws => "ws",
      Protocol::Wss => "wss",
    }
  }

  pub fn from_str(s: &str) -> Option<Protocol> {
    match s {
      "http" => Some(Protocol::Http),
      "https" => Some(Protocol::Https),
      "ws" => Some(Protocol::Ws),
      "wss" => Some(Protocol::Wss),
      _ => None,
    }
  }

  /// Default port elided from rendered URLs.
  fn default_port(&self) -> u16 {
    match self {
      Protocol::Http | Protocol::Ws => 80,
      Protocol::Https | Protocol::Wss => 443,
    }
  }

  /// The frame-relay protocol an upgraded exchange switches to.
  pub fn upgraded(&self) -> Protocol {
    match self {
      Protocol::Http | Protocol::Ws => Protocol::Ws,
      Protocol::Https | Protocol::Wss => Protocol::Wss,
    }
  }
}

impl std::fmt::Display for Protocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Who produced the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  ClientToServer,
  ServerToClient,
}

/// One decoded WebSocket frame observed on an intercepted connection.
#[derive(Debug, Clone)]
pub struct WsFrameRecord {
  pub connection_id: Uuid,
  pub direction:     Direction,
  pub opcode:        Opcode,
  pub fin:           bool,
  /// Payload after unmasking
  pub payload:       Vec<u8>,
}

impl WsFrameRecord {
  pub fn new(connection_id: Uuid, direction: Direction, frame: &Frame) -> Self {
    Self {
      connection_id,
      direction,
      opcode: frame.opcode,
      fin: frame.fin,
      payload: frame.payload.clone(),
    }
  }
}

/// Immutable capture row. One per completed HTTP exchange or decoded
/// WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
  pub id: Uuid,
  pub timestamp: DateTime<Utc>,
  pub protocol: Protocol,
  pub method: Option<String>,
  pub url: Option<String>,
  pub host: String,
  pub port: u16,
  pub path: Option<String>,
  pub status: Option<u16>,
  /// JSON object of request header name/value pairs
  pub request_headers: serde_json::Value,
  pub request_body: Vec<u8>,
  pub response_headers: serde_json::Value,
  pub response_body: Vec<u8>,
  pub response_content_type: Option<String>,
  /// Seconds from first request byte to response completion
  pub duration: Option<f64>,
  pub error: Option<String>,
  pub connection_id: Uuid,
}

impl TrafficRecord {
  /// Maps one WebSocket frame into a capture row: the opcode becomes the
  /// method, the payload lands in the body column matching its direction.
  pub fn from_ws_frame(record: &WsFrameRecord, protocol: Protocol, host: &str, port: u16, path: &str) -> Self {
    let (request_body, response_body) = match record.direction {
      Direction::ClientToServer => (record.payload.clone(), Vec::new()),
      Direction::ServerToClient => (Vec::new(), record.payload.clone()),
    };
    TrafficRecord {
      id: Uuid::new_v4(),
      timestamp: Utc::now(),
      protocol,
      method: Some(opcode_name(record.opcode).to_string()),
      url: Some(build_url(protocol, host, port, path)),
      host: host.to_string(),
      port,
      path: Some(path.to_string()),
      status: None,
      request_headers: serde_json::Value::Object(Default::default()),
      request_body,
      response_headers: serde_json::Value::Object(Default::default()),
      response_body,
      response_content_type: None,
      duration: None,
      error: None,
      connection_id: record.connection_id,
    }
  }
}

fn opcode_name(opcode: Opcode) -> &'static str {
  match opcode {
    Opcode::Continuation => "CONTINUATION",
    Opcode::Text => "TEXT",
    Opcode::Binary => "BINARY",
    Opcode::Close => "CLOSE",
    Opcode::Ping => "PING",
    Opcode::Pong => "PONG",
  }
}

fn build_url(protocol: Protocol, host: &str, port: u16, path: &str) -> String {
  let rendered_path = if path.is_empty() { "/" } else { path };
  if port == protocol.default_port() {
    format!("{protocol}://{host}{rendered_path}")
  } else {
    format!("{protocol}://{host}:{port}{rendered_path}")
  }
}

/// One in-flight request/response pair, finalized into a [`TrafficRecord`].
#[derive(Debug)]
pub struct Exchange {
  connection_id: Uuid,
  protocol:      Protocol,
  host:          String,
  port:          u16,
  started_at:    DateTime<Utc>,
  start:         Instant,
  method:        Option<String>,
  path:          Option<String>,
  request_headers: serde_json::Value,
  request_body:  Vec<u8>,
  status:        Option<u16>,
  response_headers: serde_json::Value,
  response_body: Vec<u8>,
  response_content_type: Option<String>,
  truncated:     bool,
}

impl Exchange {
  /// Starts an exchange from a parsed request head.
  pub fn begin(
    connection_id: Uuid,
    protocol: Protocol,
    host: &str,
    port: u16,
    request: &Request,
  ) -> Self {
    Exchange {
      connection_id,
      protocol,
      host: host.to_string(),
      port,
      started_at: Utc::now(),
      start: Instant::now(),
      method: Some(request.method.clone()),
      path: Some(request.path()),
      request_headers: request.headers.to_json(),
      request_body: Vec::new(),
      status: None,
      response_headers: serde_json::Value::Object(Default::default()),
      response_body: Vec::new(),
      response_content_type: None,
      truncated: false,
    }
  }

  /// Starts a record for a tunnel that is never parsed (opaque CONNECT).
  pub fn opaque(connection_id: Uuid, protocol: Protocol, host: &str, port: u16) -> Self {
    Exchange {
      connection_id,
      protocol,
      host: host.to_string(),
      port,
      started_at: Utc::now(),
      start: Instant::now(),
      method: None,
      path: None,
      request_headers: serde_json::Value::Object(Default::default()),
      request_body: Vec::new(),
      status: None,
      response_headers: serde_json::Value::Object(Default::default()),
      response_body: Vec::new(),
      response_content_type: None,
      truncated: false,
    }
  }

  pub fn set_request_body(&mut self, body: Vec<u8>, truncated: bool) {
    self.request_body = body;
    self.truncated |= truncated;
  }

  pub fn set_response(&mut self, response: &Response) {
    self.status = Some(response.status);
    self.response_headers = response.headers.to_json();
    self.response_content_type = response.headers.get("Content-Type").map(str::to_string);
  }

  pub fn set_response_body(&mut self, body: Vec<u8>, truncated: bool) {
    self.response_body = body;
    self.truncated |= truncated;
  }

  pub fn host(&self) -> &str { &self.host }

  /// Completes the exchange. A truncated capture is marked through the error
  /// column without discarding what was captured.
  pub fn finish(self) -> TrafficRecord { self.into_record(None) }

  /// Completes the exchange with an error label.
  pub fn fail(self, error: impl Into<String>) -> TrafficRecord { self.into_record(Some(error.into())) }

  fn into_record(self, error: Option<String>) -> TrafficRecord {
    let error = error.or(if self.truncated { Some("BodyTooLarge".to_string()) } else { None });
    let url = self
      .path
      .as_deref()
      .map(|path| build_url(self.protocol, &self.host, self.port, path));
    TrafficRecord {
      id: Uuid::new_v4(),
      timestamp: self.started_at,
      protocol: self.protocol,
      method: self.method,
      url,
      host: self.host,
      port: self.port,
      path: self.path,
      status: self.status,
      request_headers: self.request_headers,
      request_body: self.request_body,
      response_headers: self.response_headers,
      response_body: self.response_body,
      response_content_type: self.response_content_type,
      duration: Some(self.start.elapsed().as_secs_f64()),
      error,
      connection_id: self.connection_id,
    }
  }
}
