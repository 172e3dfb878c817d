//! # Connection State Machine
//!
//! Drives one accepted socket through classification, plain-HTTP forwarding,
//! CONNECT tunnelling (opaque or TLS-intercepted), and WebSocket frame relay.
//! Each connection runs as one task; tunnel directions run as concurrent
//! futures within it. Completed exchanges land in the traffic store; a
//! failing exchange is recorded with an error label and the connection
//! closes. No retries.

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use lenscap_core::{
  errors::HttpError,
  http::{self, BodyFraming, ChunkedDecoder, Request, Response},
  records::{Direction, Exchange, Protocol, TrafficRecord, WsFrameRecord},
  websocket::{self, MessageAssembler},
};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpStream,
  time::timeout,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
  errors::{Phase, ProxyError, Side},
  io::Rewound,
  store::TrafficStore,
  tls::TlsEngine,
  Engine,
};

/// Per-cycle relay read size; the next read waits for the forward write.
pub const RELAY_CHUNK: usize = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_502: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Classifying,
  PlainHttp,
  AwaitUpstreamTunnel,
  TlsTerminating,
  InterceptedStream,
  OpaqueTunnel,
  Closed,
}

pub struct Connection {
  id:      Uuid,
  engine:  Arc<Engine>,
  mode:    Mode,
  /// The in-flight exchange; finalized by the success path, the error path
  /// in [`handle_connection`], or cancellation.
  pending: Arc<Mutex<Option<Exchange>>>,
}

/// Entry point for one accepted socket. Runs until the connection closes,
/// fails, or the listener shuts down; the in-flight exchange is always
/// finalized.
pub async fn handle_connection(
  engine: Arc<Engine>,
  stream: TcpStream,
  mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
  let mut connection = Connection::new(engine.clone());
  let id = connection.id;
  let pending = connection.pending.clone();

  tokio::select! {
    result = connection.drive(stream) => {
      if let Err(e) = result {
        let exchange = pending.lock().unwrap().take();
        if let Some(exchange) = exchange {
          engine.store.insert(exchange.fail(e.record_label())).await;
        }
        debug!(%id, error = %e, "connection failed");
      }
    },
    _ = shutdown.changed() => {
      let exchange = pending.lock().unwrap().take();
      if let Some(exchange) = exchange {
        engine.store.insert(exchange.fail("cancelled")).await;
      }
      debug!(%id, "connection cancelled");
    },
  }
}

impl Connection {
  pub fn new(engine: Arc<Engine>) -> Self {
    Self {
      id: Uuid::new_v4(),
      engine,
      mode: Mode::Classifying,
      pending: Arc::new(Mutex::new(None)),
    }
  }

  pub fn id(&self) -> Uuid { self.id }

  pub fn mode(&self) -> Mode { self.mode }

  fn set_mode(&mut self, mode: Mode) {
    if self.mode != mode {
      debug!(id = %self.id, from = ?self.mode, to = ?mode, "mode transition");
      self.mode = mode;
    }
  }

  fn stash(&self, exchange: Exchange) { *self.pending.lock().unwrap() = Some(exchange); }

  fn unstash(&self) -> Option<Exchange> { self.pending.lock().unwrap().take() }

  fn update_pending(&self, apply: impl FnOnce(&mut Exchange)) {
    if let Some(exchange) = self.pending.lock().unwrap().as_mut() {
      apply(exchange);
    }
  }

  async fn finish_pending(&self) {
    if let Some(exchange) = self.unstash() {
      self.engine.store.insert(exchange.finish()).await;
    }
  }

  async fn fail_pending(&self, label: &str) {
    if let Some(exchange) = self.unstash() {
      self.engine.store.insert(exchange.fail(label)).await;
    }
  }

  /// Classification loop. Plain HTTP exchanges return here on keep-alive;
  /// CONNECT and WebSocket paths consume the socket and never come back.
  pub async fn drive(&mut self, mut client: TcpStream) -> Result<(), ProxyError> {
    let mut residual: Vec<u8> = Vec::new();
    loop {
      self.set_mode(Mode::Classifying);
      let classify = self.engine.config.classify_timeout();
      let request =
        match read_request_head(&mut client, &mut residual, classify, Phase::Classify).await {
          Ok(Some(request)) => request,
          Ok(None) => {
            self.set_mode(Mode::Closed);
            return Ok(());
          },
          Err(ProxyError::Http(e)) => {
            return self.unclassifiable(client, residual, e).await;
          },
          Err(e) => return Err(e),
        };

      if request.is_connect() {
        let result = self.connect_exchange(client, request, std::mem::take(&mut residual)).await;
        self.set_mode(Mode::Closed);
        return result;
      }

      self.set_mode(Mode::PlainHttp);
      if !self.plain_exchange(&mut client, request, &mut residual).await? {
        self.set_mode(Mode::Closed);
        return Ok(());
      }
    }
  }

  /// Bytes that never parsed as HTTP: relay them opaquely to the upstream
  /// proxy when one is configured, otherwise record a diagnostic and close.
  async fn unclassifiable(
    &mut self,
    client: TcpStream,
    residual: Vec<u8>,
    cause: HttpError,
  ) -> Result<(), ProxyError> {
    let Some((proxy_host, proxy_port)) =
      self.engine.config.upstream_proxy().map(|(h, p)| (h.to_string(), p))
    else {
      self.stash(Exchange::opaque(self.id, Protocol::Http, "", 0));
      return Err(cause.into());
    };

    debug!(id = %self.id, "unparsable bytes, forwarding opaquely to upstream proxy");
    self.set_mode(Mode::OpaqueTunnel);
    let connect = self.engine.config.upstream_connect_timeout();
    let server =
      match timeout(connect, TcpStream::connect((proxy_host.as_str(), proxy_port))).await {
        Ok(Ok(server)) => server,
        _ => {
          return Err(ProxyError::UpstreamUnreachable(format!("{proxy_host}:{proxy_port}")));
        },
      };
    self.stash(Exchange::opaque(self.id, Protocol::Http, &proxy_host, proxy_port));
    relay_opaque(client, server, residual, Vec::new(), self.engine.config.tunnel_idle_timeout())
      .await?;
    self.finish_pending().await;
    self.set_mode(Mode::Closed);
    Ok(())
  }

  /// One plain-HTTP exchange: forward the request (rewritten to origin-form
  /// when direct), frame and relay the response, capture both. Returns
  /// whether the client socket can be reused.
  async fn plain_exchange(
    &mut self,
    client: &mut TcpStream,
    request: Request,
    residual: &mut Vec<u8>,
  ) -> Result<bool, ProxyError> {
    let cap = self.engine.config.max_body_bytes;
    let idle = self.engine.config.tunnel_idle_timeout();

    let (host, port) = match request.effective_target(false) {
      Ok(target) => target,
      Err(e) => {
        self.stash(Exchange::begin(self.id, Protocol::Http, "", 0, &request));
        return Err(e.into());
      },
    };
    self.stash(Exchange::begin(self.id, Protocol::Http, &host, port, &request));

    let upstream = self.engine.config.upstream_proxy().map(|(h, p)| (h.to_string(), p));
    let (connect_host, connect_port) =
      upstream.clone().unwrap_or_else(|| (host.clone(), port));
    let connect = self.engine.config.upstream_connect_timeout();
    let mut server =
      match timeout(connect, TcpStream::connect((connect_host.as_str(), connect_port))).await {
        Ok(Ok(server)) => server,
        _ => {
          let _ = client.write_all(RESPONSE_502).await;
          self.fail_pending("UpstreamUnreachable").await;
          return Ok(false);
        },
      };

    let mut outbound = request.clone();
    if upstream.is_none() {
      outbound.rewrite_origin_form();
    }
    server.write_all(&outbound.to_bytes()).await?;

    let request_framing = http::request_framing(&request);
    let (body, truncated) =
      relay_body(client, &mut server, residual, request_framing, true, cap, idle).await?;
    self.update_pending(move |exchange| exchange.set_request_body(body, truncated));

    let mut server_residual = Vec::new();
    let response_wait = self.engine.config.response_timeout();
    let response =
      read_response_head(&mut server, &mut server_residual, response_wait, Phase::ResponseHeaders)
        .await?
        .ok_or_else(|| {
          ProxyError::Http(HttpError::MalformedResponse("server closed before responding".into()))
        })?;
    self.update_pending(|exchange| exchange.set_response(&response));
    client.write_all(&response.to_bytes()).await?;

    let response_framing = response.framing(&request.method);
    let (body, truncated) =
      relay_body(&mut server, client, &mut server_residual, response_framing, false, cap, idle)
        .await?;
    self.update_pending(move |exchange| exchange.set_response_body(body, truncated));

    let client_key = request.headers.get("Sec-WebSocket-Key").map(str::to_string);
    if request.wants_websocket_upgrade()
      && client_key.as_deref().is_some_and(|key| response.confirms_websocket_upgrade(key))
    {
      self.finish_pending().await;
      self.set_mode(Mode::InterceptedStream);
      let path = request.path();
      let relay = WsRelay {
        store: self.engine.store.clone(),
        connection_id: self.id,
        protocol: Protocol::Ws,
        host,
        port,
        path,
        idle,
      };
      relay
        .run(client, &mut server, std::mem::take(residual), std::mem::take(&mut server_residual))
        .await?;
      return Ok(false);
    }

    self.finish_pending().await;
    Ok(
      request.keep_alive()
        && response.keep_alive()
        && response_framing != BodyFraming::ReadToEof,
    )
  }

  /// CONNECT handling: open the tunnel (directly or through the upstream
  /// proxy), answer `200 Connection Established`, then either intercept TLS
  /// or relay opaquely.
  async fn connect_exchange(
    &mut self,
    mut client: TcpStream,
    request: Request,
    client_residual: Vec<u8>,
  ) -> Result<(), ProxyError> {
    let (host, port) = match request.effective_target(false) {
      Ok(target) => target,
      Err(e) => {
        self.stash(Exchange::opaque(self.id, Protocol::Https, "", 0));
        return Err(e.into());
      },
    };

    let connect = self.engine.config.upstream_connect_timeout();
    let upstream = self.engine.config.upstream_proxy().map(|(h, p)| (h.to_string(), p));
    let mut server_residual = Vec::new();

    let server = match &upstream {
      Some((proxy_host, proxy_port)) => {
        self.set_mode(Mode::AwaitUpstreamTunnel);
        let mut server =
          match timeout(connect, TcpStream::connect((proxy_host.as_str(), *proxy_port))).await {
            Ok(Ok(server)) => server,
            _ => {
              let _ = client.write_all(RESPONSE_502).await;
              let exchange = Exchange::opaque(self.id, Protocol::Https, &host, port);
              self.engine.store.insert(exchange.fail("UpstreamUnreachable")).await;
              return Ok(());
            },
          };

        // Forward the CONNECT literally and require a 2xx.
        let connect_head =
          format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        server.write_all(connect_head.as_bytes()).await?;
        let upstream_response = read_response_head(
          &mut server,
          &mut server_residual,
          connect,
          Phase::UpstreamConnect,
        )
        .await;
        let failure = match upstream_response {
          Ok(Some(response)) if response.status / 100 == 2 => None,
          Ok(Some(response)) => Some(ProxyError::UpstreamProtocol(format!(
            "upstream proxy returned {}",
            response.status
          ))),
          Ok(None) => Some(ProxyError::UpstreamProtocol(
            "upstream proxy closed before responding".into(),
          )),
          Err(ProxyError::Http(e)) => Some(ProxyError::UpstreamProtocol(e.to_string())),
          Err(e) => Some(e),
        };
        if let Some(e) = failure {
          debug!(id = %self.id, error = %e, "upstream CONNECT failed");
          let _ = client.write_all(RESPONSE_502).await;
          let exchange = Exchange::opaque(self.id, Protocol::Https, &host, port);
          self.engine.store.insert(exchange.fail(e.record_label())).await;
          return Ok(());
        }
        server
      },
      None => match timeout(connect, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(server)) => server,
        _ => {
          let _ = client.write_all(RESPONSE_502).await;
          let exchange = Exchange::opaque(self.id, Protocol::Https, &host, port);
          self.engine.store.insert(exchange.fail("UpstreamUnreachable")).await;
          return Ok(());
        },
      },
    };

    client.write_all(CONNECT_ESTABLISHED).await?;

    let ca = if self.engine.config.intercept_tls && !self.engine.config.is_excluded(&host) {
      self.engine.ca.load().await?
    } else {
      None
    };

    match ca {
      Some(ca) => {
        self
          .intercept(client, server, client_residual, server_residual, &ca.certificate_der, host, port)
          .await
      },
      None => {
        self.set_mode(Mode::OpaqueTunnel);
        self.stash(Exchange::opaque(self.id, Protocol::Https, &host, port));
        relay_opaque(
          client,
          server,
          client_residual,
          server_residual,
          self.engine.config.tunnel_idle_timeout(),
        )
        .await?;
        self.finish_pending().await;
        Ok(())
      },
    }
  }

  /// Terminates TLS toward the client with a minted leaf while opening the
  /// server-facing TLS leg, then parses exchanges in the clear.
  #[allow(clippy::too_many_arguments)]
  async fn intercept(
    &mut self,
    client: TcpStream,
    server: TcpStream,
    client_residual: Vec<u8>,
    server_residual: Vec<u8>,
    ca_der: &[u8],
    host: String,
    port: u16,
  ) -> Result<(), ProxyError> {
    self.set_mode(Mode::TlsTerminating);
    // Mint/handshake failures finalize this placeholder through the error
    // path; it is discarded once the exchange loop takes over.
    self.stash(Exchange::opaque(self.id, Protocol::Https, &host, port));

    let identity = self.engine.minter.identity_for(&host).await?;
    let acceptor = TlsEngine::acceptor_for(&identity, ca_der)?;
    let handshake = self.engine.config.tls_handshake_timeout();

    let accept_client = async {
      timeout(handshake, acceptor.accept(Rewound::new(client_residual, client)))
        .await
        .map_err(|_| ProxyError::Timeout(Phase::TlsHandshake))?
        .map_err(|e| ProxyError::TlsHandshake { side: Side::Client, detail: e.to_string() })
    };
    let connect_server = async {
      timeout(handshake, self.engine.tls.connect(Rewound::new(server_residual, server), &host))
        .await
        .map_err(|_| ProxyError::Timeout(Phase::TlsHandshake))?
    };
    let (client_tls, server_tls) = tokio::try_join!(accept_client, connect_server)?;

    self.unstash();
    self.set_mode(Mode::InterceptedStream);
    self.exchange_loop(client_tls, server_tls, host, port, Protocol::Https).await
  }

  /// Alternating request/response exchanges over two plaintext legs, with a
  /// switch to frame relay on a confirmed WebSocket upgrade.
  async fn exchange_loop<C, S>(
    &mut self,
    mut client: C,
    mut server: S,
    host: String,
    port: u16,
    protocol: Protocol,
  ) -> Result<(), ProxyError>
  where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let cap = self.engine.config.max_body_bytes;
    let idle = self.engine.config.tunnel_idle_timeout();
    let mut client_residual = Vec::new();
    let mut server_residual = Vec::new();
    let mut first = true;

    loop {
      let wait = if first { self.engine.config.classify_timeout() } else { idle };
      first = false;
      let request =
        match read_request_head(&mut client, &mut client_residual, wait, Phase::Classify).await? {
          Some(request) => request,
          None => {
            let _ = server.shutdown().await;
            return Ok(());
          },
        };
      self.stash(Exchange::begin(self.id, protocol, &host, port, &request));

      server.write_all(&request.to_bytes()).await?;
      let request_framing = http::request_framing(&request);
      let (body, truncated) =
        relay_body(&mut client, &mut server, &mut client_residual, request_framing, true, cap, idle)
          .await?;
      self.update_pending(move |exchange| exchange.set_request_body(body, truncated));

      let response_wait = self.engine.config.response_timeout();
      let response = read_response_head(
        &mut server,
        &mut server_residual,
        response_wait,
        Phase::ResponseHeaders,
      )
      .await?
      .ok_or_else(|| {
        ProxyError::Http(HttpError::MalformedResponse("server closed before responding".into()))
      })?;
      self.update_pending(|exchange| exchange.set_response(&response));
      client.write_all(&response.to_bytes()).await?;

      let response_framing = response.framing(&request.method);
      let (body, truncated) =
        relay_body(&mut server, &mut client, &mut server_residual, response_framing, false, cap, idle)
          .await?;
      self.update_pending(move |exchange| exchange.set_response_body(body, truncated));

      let client_key = request.headers.get("Sec-WebSocket-Key").map(str::to_string);
      if request.wants_websocket_upgrade()
        && client_key.as_deref().is_some_and(|key| response.confirms_websocket_upgrade(key))
      {
        self.finish_pending().await;
        let relay = WsRelay {
          store: self.engine.store.clone(),
          connection_id: self.id,
          protocol: protocol.upgraded(),
          host,
          port,
          path: request.path(),
          idle,
        };
        return relay.run(&mut client, &mut server, client_residual, server_residual).await;
      }

      self.finish_pending().await;
      if !(request.keep_alive() && response.keep_alive())
        || response_framing == BodyFraming::ReadToEof
      {
        // Graceful close so the TLS legs send close_notify.
        let _ = client.shutdown().await;
        let _ = server.shutdown().await;
        return Ok(());
      }
    }
  }
}

/// Reads until a full request head is buffered. `Ok(None)` on clean EOF
/// before any bytes.
async fn read_request_head<IO>(
  io: &mut IO,
  buffer: &mut Vec<u8>,
  wait: Duration,
  phase: Phase,
) -> Result<Option<Request>, ProxyError>
where
  IO: AsyncRead + Unpin,
{
  loop {
    if let Some((request, consumed)) = Request::parse(buffer)? {
      buffer.drain(..consumed);
      return Ok(Some(request));
    }
    let mut chunk = [0u8; 8192];
    let n = timeout(wait, io.read(&mut chunk)).await.map_err(|_| ProxyError::Timeout(phase))??;
    if n == 0 {
      if buffer.is_empty() {
        return Ok(None);
      }
      return Err(HttpError::MalformedRequest("connection closed mid-request".into()).into());
    }
    buffer.extend_from_slice(&chunk[..n]);
  }
}

async fn read_response_head<IO>(
  io: &mut IO,
  buffer: &mut Vec<u8>,
  wait: Duration,
  phase: Phase,
) -> Result<Option<Response>, ProxyError>
where
  IO: AsyncRead + Unpin,
{
  loop {
    if let Some((response, consumed)) = Response::parse(buffer)? {
      buffer.drain(..consumed);
      return Ok(Some(response));
    }
    let mut chunk = [0u8; 8192];
    let n = timeout(wait, io.read(&mut chunk)).await.map_err(|_| ProxyError::Timeout(phase))??;
    if n == 0 {
      if buffer.is_empty() {
        return Ok(None);
      }
      return Err(HttpError::MalformedResponse("connection closed mid-response".into()).into());
    }
    buffer.extend_from_slice(&chunk[..n]);
  }
}

/// Streams one message body from `src` to `dst` per `framing`, capturing up
/// to `cap` bytes. Returns the capture and whether it was truncated. Bytes
/// already read past the head arrive in `residual`; on chunked bodies the
/// leftover past the terminal chunk is left there for the next message.
async fn relay_body<R, W>(
  src: &mut R,
  dst: &mut W,
  residual: &mut Vec<u8>,
  framing: BodyFraming,
  is_request: bool,
  cap: usize,
  wait: Duration,
) -> Result<(Vec<u8>, bool), ProxyError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut captured: Vec<u8> = Vec::new();
  let mut truncated = false;
  let mut capture = |data: &[u8], captured: &mut Vec<u8>, truncated: &mut bool| {
    let room = cap.saturating_sub(captured.len());
    if data.len() > room {
      *truncated = true;
    }
    captured.extend_from_slice(&data[..room.min(data.len())]);
  };
  let ended_early = || -> ProxyError {
    if is_request {
      HttpError::MalformedRequest("body ended before its declared length".into()).into()
    } else {
      HttpError::MalformedResponse("body ended before its declared length".into()).into()
    }
  };

  match framing {
    BodyFraming::None => {},
    BodyFraming::ContentLength(total) => {
      let mut remaining = total;
      let mut chunk = vec![0u8; RELAY_CHUNK];
      while remaining > 0 {
        if residual.is_empty() {
          let n =
            timeout(wait, src.read(&mut chunk)).await.map_err(|_| ProxyError::Timeout(Phase::TunnelIdle))??;
          if n == 0 {
            return Err(ended_early());
          }
          residual.extend_from_slice(&chunk[..n]);
        }
        let take = residual.len().min(remaining as usize);
        dst.write_all(&residual[..take]).await?;
        capture(&residual[..take], &mut captured, &mut truncated);
        residual.drain(..take);
        remaining -= take as u64;
      }
    },
    BodyFraming::Chunked => {
      let mut decoder =
        if is_request { ChunkedDecoder::request() } else { ChunkedDecoder::response() };
      let mut chunk = vec![0u8; RELAY_CHUNK];
      loop {
        if residual.is_empty() {
          let n =
            timeout(wait, src.read(&mut chunk)).await.map_err(|_| ProxyError::Timeout(Phase::TunnelIdle))??;
          if n == 0 {
            return Err(ended_early());
          }
          residual.extend_from_slice(&chunk[..n]);
        }
        let input = std::mem::take(residual);
        let mut decoded = Vec::new();
        let (consumed, done) = decoder.decode(&input, &mut decoded)?;
        dst.write_all(&input[..consumed]).await?;
        capture(&decoded, &mut captured, &mut truncated);
        if done {
          *residual = input[consumed..].to_vec();
          break;
        }
      }
    },
    BodyFraming::ReadToEof => {
      if !residual.is_empty() {
        dst.write_all(residual).await?;
        capture(residual, &mut captured, &mut truncated);
        residual.clear();
      }
      let mut chunk = vec![0u8; RELAY_CHUNK];
      loop {
        let n =
          timeout(wait, src.read(&mut chunk)).await.map_err(|_| ProxyError::Timeout(Phase::TunnelIdle))??;
        if n == 0 {
          break;
        }
        dst.write_all(&chunk[..n]).await?;
        capture(&chunk[..n], &mut captured, &mut truncated);
      }
    },
  }
  Ok((captured, truncated))
}

/// Verbatim bidirectional relay with half-close propagation: an EOF in one
/// direction shuts down the peer's write side so the other direction can
/// drain and exit.
pub(crate) async fn relay_opaque<A, B>(
  a: A,
  b: B,
  a_residual: Vec<u8>,
  b_residual: Vec<u8>,
  idle: Duration,
) -> Result<(), ProxyError>
where
  A: AsyncRead + AsyncWrite,
  B: AsyncRead + AsyncWrite,
{
  let (a_read, a_write) = tokio::io::split(a);
  let (b_read, b_write) = tokio::io::split(b);
  tokio::try_join!(
    pump(a_read, b_write, a_residual, idle),
    pump(b_read, a_write, b_residual, idle),
  )?;
  Ok(())
}

async fn pump<R, W>(
  mut src: R,
  mut dst: W,
  residual: Vec<u8>,
  idle: Duration,
) -> Result<(), ProxyError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  if !residual.is_empty() {
    dst.write_all(&residual).await?;
  }
  let mut chunk = vec![0u8; RELAY_CHUNK];
  loop {
    let n = timeout(idle, src.read(&mut chunk))
      .await
      .map_err(|_| ProxyError::Timeout(Phase::TunnelIdle))??;
    if n == 0 {
      let _ = dst.shutdown().await;
      return Ok(());
    }
    dst.write_all(&chunk[..n]).await?;
  }
}

/// Context for relaying an upgraded WebSocket stream: bytes are forwarded
/// verbatim while a copy runs through the frame codec to emit one record per
/// decoded frame.
struct WsRelay {
  store:         Arc<TrafficStore>,
  connection_id: Uuid,
  protocol:      Protocol,
  host:          String,
  port:          u16,
  path:          String,
  idle:          Duration,
}

impl WsRelay {
  async fn run<C, S>(
    &self,
    client: C,
    server: S,
    client_residual: Vec<u8>,
    server_residual: Vec<u8>,
  ) -> Result<(), ProxyError>
  where
    C: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite,
  {
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    tokio::try_join!(
      self.pump(client_read, server_write, client_residual, Direction::ClientToServer),
      self.pump(server_read, client_write, server_residual, Direction::ServerToClient),
    )?;
    Ok(())
  }

  async fn pump<R, W>(
    &self,
    mut src: R,
    mut dst: W,
    initial: Vec<u8>,
    direction: Direction,
  ) -> Result<(), ProxyError>
  where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut assembler = MessageAssembler::new();
    let mut parse_buffer = initial;
    if !parse_buffer.is_empty() {
      dst.write_all(&parse_buffer).await?;
    }
    self.drain_frames(&mut parse_buffer, &mut assembler, direction).await?;

    let mut chunk = vec![0u8; RELAY_CHUNK];
    loop {
      let n = timeout(self.idle, src.read(&mut chunk))
        .await
        .map_err(|_| ProxyError::Timeout(Phase::TunnelIdle))??;
      if n == 0 {
        let _ = dst.shutdown().await;
        return Ok(());
      }
      dst.write_all(&chunk[..n]).await?;
      parse_buffer.extend_from_slice(&chunk[..n]);
      self.drain_frames(&mut parse_buffer, &mut assembler, direction).await?;
    }
  }

  async fn drain_frames(
    &self,
    buffer: &mut Vec<u8>,
    assembler: &mut MessageAssembler,
    direction: Direction,
  ) -> Result<(), ProxyError> {
    while let Some((frame, consumed)) = websocket::parse_frame(buffer, direction)? {
      buffer.drain(..consumed);
      // Validates fragmentation sequencing; assembled messages are not
      // stored separately, records are per frame.
      assembler.push(&frame)?;
      let record = WsFrameRecord::new(self.connection_id, direction, &frame);
      self
        .store
        .insert(TrafficRecord::from_ws_frame(
          &record,
          self.protocol,
          &self.host,
          self.port,
          &self.path,
        ))
        .await;
    }
    Ok(())
  }
}
