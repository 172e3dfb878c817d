//! # HTTP/1.1 Codec
//!
//! Message heads, body framing, and target resolution for the proxy engine.
//! Parsing is head-only: bodies are relayed as byte streams by the engine and
//! delimited with [`BodyFraming`] plus the incremental [`ChunkedDecoder`].
//!
//! Header names keep their original spelling on the wire but compare
//! case-insensitively, so a rewritten request is byte-faithful to what the
//! client sent.

use tracing::debug;
use url::Url;

use crate::{errors::HttpError, websocket};

/// Cap on the size of a request or response head.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Returns the index just past the first `CRLF CRLF`, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
  buf.windows(CRLF_CRLF.len()).position(|w| w == CRLF_CRLF).map(|i| i + CRLF_CRLF.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
  Http10,
  Http11,
}

impl Version {
  pub fn as_str(&self) -> &'static str {
    match self {
      Version::Http10 => "HTTP/1.0",
      Version::Http11 => "HTTP/1.1",
    }
  }

  fn parse(token: &str) -> Option<Version> {
    match token {
      "HTTP/1.0" => Some(Version::Http10),
      "HTTP/1.1" => Some(Version::Http11),
      _ => None,
    }
  }
}

/// Ordered header collection. Lookup is case-insensitive; iteration and
/// serialization preserve the original names and order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
  entries: Vec<(String, String)>,
}

impl HeaderMap {
  pub fn new() -> Self { Self::default() }

  pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.entries.push((name.into(), value.into()));
  }

  /// First value for `name`, compared case-insensitively.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// True when any comma-separated element of `name` equals `token`
  /// case-insensitively. `Connection: keep-alive, Upgrade` matches `upgrade`.
  pub fn contains_token(&self, name: &str, token: &str) -> bool {
    self
      .entries
      .iter()
      .filter(|(n, _)| n.eq_ignore_ascii_case(name))
      .flat_map(|(_, v)| v.split(','))
      .any(|element| element.trim().eq_ignore_ascii_case(token))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// JSON object for the traffic record envelope; repeated names are joined
  /// with `", "`, compared case-insensitively like every other lookup here.
  /// The first spelling seen becomes the key.
  pub fn to_json(&self) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (name, value) in &self.entries {
      let existing_key = object.keys().find(|k| k.eq_ignore_ascii_case(name)).cloned();
      match existing_key {
        Some(key) => {
          if let Some(serde_json::Value::String(existing)) = object.get_mut(&key) {
            existing.push_str(", ");
            existing.push_str(value);
          }
        },
        None => {
          object.insert(name.clone(), serde_json::Value::String(value.clone()));
        },
      }
    }
    serde_json::Value::Object(object)
  }
}

fn parse_header_lines(
  lines: std::str::Lines<'_>,
  malformed: impl Fn(String) -> HttpError,
) -> Result<HeaderMap, HttpError> {
  let mut headers = HeaderMap::new();
  for line in lines {
    if line.is_empty() {
      continue;
    }
    let (name, value) =
      line.split_once(':').ok_or_else(|| malformed(format!("invalid header line: {line}")))?;
    if name.is_empty() || name.contains(' ') {
      return Err(malformed(format!("invalid header name: {name}")));
    }
    headers.push(name, value.trim());
  }
  Ok(headers)
}

/// A parsed request head. Bodies are delimited separately via
/// [`request_framing`] and relayed by the engine.
#[derive(Debug, Clone)]
pub struct Request {
  pub method:  String,
  pub target:  String,
  pub version: Version,
  pub headers: HeaderMap,
}

impl Request {
  /// Parses a request head from the front of `buf`.
  ///
  /// Returns `Ok(None)` until the `CRLF CRLF` terminator is present, and
  /// `Ok(Some((request, consumed)))` once it is; `consumed` is the offset of
  /// the first body byte. [`HttpError::HeaderTooLarge`] when the terminator
  /// does not appear within [`MAX_HEADER_BYTES`].
  pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>, HttpError> {
    let Some(end) = find_header_end(buf) else {
      if buf.len() > MAX_HEADER_BYTES {
        debug!(bytes = buf.len(), "request head exceeds the header cap");
        return Err(HttpError::HeaderTooLarge);
      }
      return Ok(None);
    };
    if end > MAX_HEADER_BYTES {
      return Err(HttpError::HeaderTooLarge);
    }
    let head = std::str::from_utf8(&buf[..end - CRLF_CRLF.len()])
      .map_err(|_| HttpError::MalformedRequest("head is not valid UTF-8".into()))?;
    let mut lines = head.lines();
    let start_line =
      lines.next().ok_or_else(|| HttpError::MalformedRequest("empty head".into()))?;

    let mut parts = start_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
      (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
      _ =>
        return Err(HttpError::MalformedRequest(format!("invalid request line: {start_line}"))),
    };
    let version = Version::parse(version)
      .ok_or_else(|| HttpError::MalformedRequest(format!("unsupported version: {version}")))?;
    let headers = parse_header_lines(lines, HttpError::MalformedRequest)?;

    Ok(Some((
      Request { method: method.to_string(), target: target.to_string(), version, headers },
      end,
    )))
  }

  /// Serializes the head back to wire bytes, terminator included.
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(
      format!("{} {} {}\r\n", self.method, self.target, self.version.as_str()).as_bytes(),
    );
    for (name, value) in self.headers.iter() {
      out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
  }

  pub fn is_connect(&self) -> bool { self.method.eq_ignore_ascii_case("CONNECT") }

  /// Effective host and port for forwarding: the target's own authority wins,
  /// then the `Host` header. `tls` selects the origin-form default port.
  pub fn effective_target(&self, tls: bool) -> Result<(String, u16), HttpError> {
    if self.is_connect() {
      return split_host_port(&self.target, 443)
        .ok_or_else(|| HttpError::MalformedRequest(format!("invalid authority: {}", self.target)));
    }
    if self.target.contains("://") {
      let url = Url::parse(&self.target)
        .map_err(|e| HttpError::MalformedRequest(format!("invalid target url: {e}")))?;
      let host = url
        .host_str()
        .ok_or_else(|| HttpError::MalformedRequest("target url has no host".into()))?;
      let port = url
        .port_or_known_default()
        .ok_or_else(|| HttpError::MalformedRequest("target url has no port".into()))?;
      return Ok((host.to_string(), port));
    }
    let default_port = if tls { 443 } else { 80 };
    let host = self
      .headers
      .get("Host")
      .ok_or_else(|| HttpError::MalformedRequest("origin-form target without Host".into()))?;
    split_host_port(host, default_port)
      .ok_or_else(|| HttpError::MalformedRequest(format!("invalid Host header: {host}")))
  }

  /// Path and query for the traffic record: `/path[?query]`.
  pub fn path(&self) -> String {
    if self.is_connect() {
      return String::new();
    }
    if self.target.contains("://") {
      if let Ok(url) = Url::parse(&self.target) {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
          path.push('?');
          path.push_str(query);
        }
        return path;
      }
    }
    self.target.clone()
  }

  /// Rewrites an absolute-form target to origin-form for direct forwarding;
  /// the `Host` header is left untouched.
  pub fn rewrite_origin_form(&mut self) {
    if self.target.contains("://") {
      let path = self.path();
      self.target = if path.is_empty() { "/".to_string() } else { path };
    }
  }

  /// `Upgrade: websocket` plus `Connection` containing the `upgrade` token.
  pub fn wants_websocket_upgrade(&self) -> bool {
    self
      .headers
      .get("Upgrade")
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
      && self.headers.contains_token("Connection", "upgrade")
  }

  pub fn keep_alive(&self) -> bool { keep_alive(self.version, &self.headers) }
}

/// A parsed response head.
#[derive(Debug, Clone)]
pub struct Response {
  pub version: Version,
  pub status:  u16,
  pub reason:  String,
  pub headers: HeaderMap,
}

impl Response {
  /// Parses a response head; same contract as [`Request::parse`].
  pub fn parse(buf: &[u8]) -> Result<Option<(Response, usize)>, HttpError> {
    let Some(end) = find_header_end(buf) else {
      if buf.len() > MAX_HEADER_BYTES {
        debug!(bytes = buf.len(), "response head exceeds the header cap");
        return Err(HttpError::HeaderTooLarge);
      }
      return Ok(None);
    };
    if end > MAX_HEADER_BYTES {
      return Err(HttpError::HeaderTooLarge);
    }
    let head = std::str::from_utf8(&buf[..end - CRLF_CRLF.len()])
      .map_err(|_| HttpError::MalformedResponse("head is not valid UTF-8".into()))?;
    let mut lines = head.lines();
    let start_line =
      lines.next().ok_or_else(|| HttpError::MalformedResponse("empty head".into()))?;

    let mut parts = start_line.splitn(3, ' ');
    let (version, status) = match (parts.next(), parts.next()) {
      (Some(v), Some(s)) => (v, s),
      _ =>
        return Err(HttpError::MalformedResponse(format!("invalid status line: {start_line}"))),
    };
    let reason = parts.next().unwrap_or("").to_string();
    let version = Version::parse(version)
      .ok_or_else(|| HttpError::MalformedResponse(format!("unsupported version: {version}")))?;
    let status: u16 = status
      .parse()
      .map_err(|_| HttpError::MalformedResponse(format!("invalid status code: {status}")))?;
    let headers = parse_header_lines(lines, HttpError::MalformedResponse)?;

    Ok(Some((Response { version, status, reason, headers }, end)))
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(
      format!("{} {} {}\r\n", self.version.as_str(), self.status, self.reason).as_bytes(),
    );
    for (name, value) in self.headers.iter() {
      out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
  }

  /// RFC 6455 §4.2.2: 101, upgrade headers, and a `Sec-WebSocket-Accept`
  /// matching the client's key.
  pub fn confirms_websocket_upgrade(&self, client_key: &str) -> bool {
    self.status == 101
      && self
        .headers
        .get("Upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
      && self.headers.contains_token("Connection", "upgrade")
      && self.headers.get("Sec-WebSocket-Accept").map(str::trim)
        == Some(websocket::accept_key(client_key).as_str())
  }

  pub fn keep_alive(&self) -> bool { keep_alive(self.version, &self.headers) }

  /// Body delimitation for this response to a `request_method` request.
  pub fn framing(&self, request_method: &str) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
      || self.status / 100 == 1
      || self.status == 204
      || self.status == 304
    {
      return BodyFraming::None;
    }
    if self.headers.contains_token("Transfer-Encoding", "chunked") {
      return BodyFraming::Chunked;
    }
    if let Some(value) = self.headers.get("Content-Length") {
      if let Ok(n) = value.trim().parse::<u64>() {
        return BodyFraming::ContentLength(n);
      }
    }
    if !keep_alive(self.version, &self.headers) {
      return BodyFraming::ReadToEof;
    }
    BodyFraming::None
  }
}

/// Body delimitation for a request. Requests never read to EOF.
pub fn request_framing(request: &Request) -> BodyFraming {
  if request.headers.contains_token("Transfer-Encoding", "chunked") {
    return BodyFraming::Chunked;
  }
  if let Some(value) = request.headers.get("Content-Length") {
    if let Ok(n) = value.trim().parse::<u64>() {
      if n > 0 {
        return BodyFraming::ContentLength(n);
      }
    }
  }
  BodyFraming::None
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  if headers.contains_token("Connection", "close") {
    return false;
  }
  match version {
    Version::Http11 => true,
    Version::Http10 => headers.contains_token("Connection", "keep-alive"),
  }
}

/// How a message body ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body at all
  None,
  /// Exactly this many bytes
  ContentLength(u64),
  /// `Transfer-Encoding: chunked` until the terminal zero chunk
  Chunked,
  /// Body runs to connection EOF
  ReadToEof,
}

/// Splits `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
  if authority.is_empty() {
    return None;
  }
  if let Some(rest) = authority.strip_prefix('[') {
    // [v6]:port or [v6]
    let (host, after) = rest.split_once(']')?;
    return match after.strip_prefix(':') {
      Some(port) => Some((host.to_string(), port.parse().ok()?)),
      None if after.is_empty() => Some((host.to_string(), default_port)),
      None => None,
    };
  }
  // A bare IPv6 literal has multiple colons and no brackets.
  if authority.matches(':').count() > 1 {
    return Some((authority.to_string(), default_port));
  }
  match authority.split_once(':') {
    Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
    Some(_) => None,
    None => Some((authority.to_string(), default_port)),
  }
}

enum ChunkState {
  Size,
  Data,
  DataEnd,
  Trailer,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Feed raw wire bytes with [`decode`](Self::decode); decoded chunk payloads
/// are appended to the caller's buffer, framing excluded. The decoder reports
/// how many input bytes it consumed so the caller can carry leftover bytes
/// (the start of the next message) forward once the terminal chunk and
/// trailers are complete.
pub struct ChunkedDecoder {
  state:      ChunkState,
  line:       Vec<u8>,
  remaining:  u64,
  is_request: bool,
}

const MAX_CHUNK_LINE: usize = 16 * 1024;

impl ChunkedDecoder {
  pub fn request() -> Self { Self::new(true) }

  pub fn response() -> Self { Self::new(false) }

  fn new(is_request: bool) -> Self {
    Self { state: ChunkState::Size, line: Vec::new(), remaining: 0, is_request }
  }

  fn malformed(&self, detail: &str) -> HttpError {
    if self.is_request {
      HttpError::MalformedRequest(format!("chunked body: {detail}"))
    } else {
      HttpError::MalformedResponse(format!("chunked body: {detail}"))
    }
  }

  /// Consumes bytes from `input`, appending decoded payload to `out`.
  /// Returns `(consumed, done)`; once `done`, bytes past `consumed` belong to
  /// the next message.
  pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(usize, bool), HttpError> {
    let mut pos = 0;
    while pos < input.len() {
      match self.state {
        ChunkState::Size => {
          let Some(line) = self.take_line(input, &mut pos)? else { break };
          let size_text = line.split(';').next().unwrap_or("").trim();
          let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| self.malformed(&format!("invalid chunk size: {size_text}")))?;
          if size == 0 {
            self.state = ChunkState::Trailer;
          } else {
            self.remaining = size;
            self.state = ChunkState::Data;
          }
        },
        ChunkState::Data => {
          let take = (self.remaining as usize).min(input.len() - pos);
          out.extend_from_slice(&input[pos..pos + take]);
          pos += take;
          self.remaining -= take as u64;
          if self.remaining == 0 {
            self.state = ChunkState::DataEnd;
          }
        },
        ChunkState::DataEnd => {
          let Some(line) = self.take_line(input, &mut pos)? else { break };
          if !line.is_empty() {
            return Err(self.malformed("missing CRLF after chunk data"));
          }
          self.state = ChunkState::Size;
        },
        ChunkState::Trailer => {
          let Some(line) = self.take_line(input, &mut pos)? else { break };
          if line.is_empty() {
            // Terminal: trailers (if any) are discarded.
            self.state = ChunkState::Size;
            return Ok((pos, true));
          }
        },
      }
    }
    Ok((pos, false))
  }

  /// Accumulates until LF; returns the line without CR/LF, or `None` when
  /// more input is needed.
  fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<String>, HttpError> {
    while *pos < input.len() {
      let byte = input[*pos];
      *pos += 1;
      if byte == b'\n' {
        if self.line.last() == Some(&b'\r') {
          self.line.pop();
        }
        let line = String::from_utf8(std::mem::take(&mut self.line))
          .map_err(|_| self.malformed("non-ascii chunk framing"))?;
        return Ok(Some(line));
      }
      self.line.push(byte);
      if self.line.len() > MAX_CHUNK_LINE {
        return Err(self.malformed("chunk line too long"));
      }
    }
    Ok(None)
  }
}
