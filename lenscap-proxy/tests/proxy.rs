//! End-to-end scenarios: a real listener, scripted origin servers on
//! ephemeral ports, and raw client sockets speaking the proxy protocol.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use lenscap_core::{
  records::{Protocol, TrafficRecord},
  websocket,
};
use lenscap_proxy::{
  ca::CaStore,
  config::Config,
  listener::ProxyListener,
  secrets::MemorySecretStore,
  store::{RecordFilter, TrafficStore},
  tls::TlsEngine,
  Engine,
};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};

async fn start_proxy(config: Config) -> (Arc<Engine>, SocketAddr) {
  start_proxy_with_secrets(config, Arc::new(MemorySecretStore::default())).await
}

async fn start_proxy_with_secrets(
  config: Config,
  secrets: Arc<MemorySecretStore>,
) -> (Arc<Engine>, SocketAddr) {
  let store = Arc::new(TrafficStore::open(None, config.max_records).unwrap());
  let engine = Engine::with_storage(Arc::new(config), secrets, store).unwrap();
  let listener = ProxyListener::bind(engine.clone()).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(listener.run());
  (engine, addr)
}

/// Reads from the stream until the head terminator, returning everything
/// read (head plus any early body bytes).
async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];
  loop {
    let n = stream.read(&mut chunk).await.unwrap();
    assert!(n > 0, "peer closed before a full head arrived");
    buf.extend_from_slice(&chunk[..n]);
    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
      return buf;
    }
  }
}

/// Polls the traffic store until `matches` finds a record or 10 s elapse.
async fn wait_for_record(
  engine: &Engine,
  matches: impl Fn(&TrafficRecord) -> bool,
) -> TrafficRecord {
  for _ in 0..200 {
    let records = engine.store.list(RecordFilter::default()).await.unwrap();
    if let Some(record) = records.into_iter().find(|r| matches(r)) {
      return record;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("expected traffic record never appeared");
}

fn no_intercept_config() -> Config { Config { intercept_tls: false, ..Config::default() } }

#[tokio::test]
async fn test_plain_http_forward() {
  let (engine, proxy_addr) = start_proxy(no_intercept_config()).await;

  // Scripted origin: one GET, fixed response.
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  let (head_tx, head_rx) = tokio::sync::oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    head_tx.send(head).unwrap();
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nbar")
      .await
      .unwrap();
    // Hold the socket open; the client closes first.
    let mut sink = [0u8; 16];
    let _ = stream.read(&mut sink).await;
  });

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{origin_addr}/foo HTTP/1.1\r\nHost: {origin_addr}\r\nAccept: */*\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let mut response = Vec::new();
  let mut chunk = [0u8; 1024];
  while !response.ends_with(b"bar") {
    let n = client.read(&mut chunk).await.unwrap();
    assert!(n > 0, "proxy closed before the response body");
    response.extend_from_slice(&chunk[..n]);
  }
  let response_text = String::from_utf8_lossy(&response);
  assert!(response_text.starts_with("HTTP/1.1 200 OK\r\n"));

  // Direct forwarding rewrites the absolute-form target to origin-form.
  let origin_head = head_rx.await.unwrap();
  assert!(origin_head.starts_with(b"GET /foo HTTP/1.1\r\n"));

  let record = wait_for_record(&engine, |r| r.status == Some(200)).await;
  assert_eq!(record.protocol, Protocol::Http);
  assert_eq!(record.method.as_deref(), Some("GET"));
  assert_eq!(record.host, "127.0.0.1");
  assert_eq!(record.port, origin_addr.port());
  assert_eq!(record.path.as_deref(), Some("/foo"));
  assert_eq!(record.response_body, b"bar");
  assert_eq!(record.response_content_type.as_deref(), Some("text/plain"));
  assert!(record.duration.unwrap() > 0.0);
  assert!(record.error.is_none());
}

#[tokio::test]
async fn test_connect_opaque_tunnel() {
  let (engine, proxy_addr) = start_proxy(no_intercept_config()).await;

  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    stream.write_all(b"pong").await.unwrap();
    let mut sink = [0u8; 16];
    let _ = stream.read(&mut sink).await;
  });

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let established = read_head(&mut client).await;
  assert!(established.starts_with(b"HTTP/1.1 200 Connection Established\r\n"));

  // Bytes relay verbatim in both directions.
  client.write_all(b"ping").await.unwrap();
  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"pong");
  drop(client);

  let record = wait_for_record(&engine, |r| r.protocol == Protocol::Https).await;
  assert_eq!(record.host, "127.0.0.1");
  assert_eq!(record.port, origin_addr.port());
  assert!(record.status.is_none());
  assert!(record.method.is_none());
  assert!(record.error.is_none());
}

#[tokio::test]
async fn test_connect_intercepted() {
  // The engine's own CA also signs the origin's certificate, and the
  // connector trusts it through extra_root_certificates.
  let secrets = Arc::new(MemorySecretStore::default());
  let bootstrap = CaStore::new(secrets.clone());
  let ca = bootstrap.generate().await.unwrap();

  let ca_path = std::env::temp_dir().join(format!("lenscap-test-ca-{}.der", uuid::Uuid::new_v4()));
  std::fs::write(&ca_path, &ca.certificate_der).unwrap();
  let config = Config {
    extra_root_certificates: vec![ca_path.to_string_lossy().into_owned()],
    ..Config::default()
  };
  let (engine, proxy_addr) = start_proxy_with_secrets(config, secrets).await;

  // TLS origin presenting a leaf for 127.0.0.1 signed by the same CA.
  let origin_identity = engine.minter.identity_for("127.0.0.1").await.unwrap();
  let origin_acceptor = TlsEngine::acceptor_for(&origin_identity, &ca.certificate_der).unwrap();
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (stream, _) = origin.accept().await.unwrap();
      let acceptor = origin_acceptor.clone();
      tokio::spawn(async move {
        let mut tls = match acceptor.accept(stream).await {
          Ok(tls) => tls,
          Err(_) => return,
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
          let n = tls.read(&mut chunk).await.unwrap_or(0);
          if n == 0 {
            return;
          }
          buf.extend_from_slice(&chunk[..n]);
          if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
          }
        }
        let _ = tls
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
          .await;
      });
    }
  });

  // Client trusts the CA and handshakes through the established tunnel.
  let mut roots = rustls::RootCertStore::empty();
  roots.add(rustls::pki_types::CertificateDer::from(ca.certificate_der.clone())).unwrap();
  let client_config = rustls::ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

  for _ in 0..2 {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
      .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port()).as_bytes())
      .await
      .unwrap();
    let established = read_head(&mut client).await;
    assert!(established.starts_with(b"HTTP/1.1 200 Connection Established\r\n"));

    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();
    tls
      .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    while !response.ends_with(b"hello") {
      let n = tls.read(&mut chunk).await.unwrap();
      assert!(n > 0, "proxy closed the intercepted leg before the body");
      response.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  }

  // The same leaf served both connections within the TTL.
  let reused = engine.minter.identity_for("127.0.0.1").await.unwrap();
  assert!(Arc::ptr_eq(&origin_identity, &reused));

  let record = wait_for_record(&engine, |r| r.status == Some(200)).await;
  assert_eq!(record.protocol, Protocol::Https);
  assert_eq!(record.method.as_deref(), Some("GET"));
  assert_eq!(record.response_body, b"hello");

  let _ = std::fs::remove_file(&ca_path);
}

#[tokio::test]
async fn test_upstream_proxy_connect() {
  // Origin behind a mini upstream proxy that answers CONNECT itself.
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(b"pong").await.unwrap();
    let mut sink = [0u8; 16];
    let _ = stream.read(&mut sink).await;
  });

  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = upstream.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    let head_text = String::from_utf8_lossy(&head).into_owned();
    seen_tx.send(head_text.clone()).unwrap();

    let target = head_text.split_whitespace().nth(1).unwrap().to_string();
    let mut server = TcpStream::connect(&target).await.unwrap();
    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut server).await;
  });

  let config = Config {
    intercept_tls: false,
    upstream_proxy_host: "127.0.0.1".to_string(),
    upstream_proxy_port: upstream_addr.port(),
    ..Config::default()
  };
  let (engine, proxy_addr) = start_proxy(config).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let established = read_head(&mut client).await;
  assert!(established.starts_with(b"HTTP/1.1 200 Connection Established\r\n"));

  client.write_all(b"ping").await.unwrap();
  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"pong");
  drop(client);

  // The engine forwarded the CONNECT literally, Host header included.
  let seen = seen_rx.await.unwrap();
  assert!(seen.starts_with(&format!("CONNECT {origin_addr} HTTP/1.1\r\n")));
  assert!(seen.contains(&format!("Host: {origin_addr}\r\n")));

  let record = wait_for_record(&engine, |r| r.protocol == Protocol::Https).await;
  assert!(record.error.is_none());
}

#[tokio::test]
async fn test_upstream_connect_rejection_yields_502() {
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = upstream.accept().await.unwrap();
    let _ = read_head(&mut stream).await;
    stream.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await.unwrap();
  });

  let config = Config {
    intercept_tls: false,
    upstream_proxy_host: "127.0.0.1".to_string(),
    upstream_proxy_port: upstream_addr.port(),
    ..Config::default()
  };
  let (engine, proxy_addr) = start_proxy(config).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let response = read_head(&mut client).await;
  assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

  let record = wait_for_record(&engine, |r| r.error.is_some()).await;
  assert_eq!(record.error.as_deref(), Some("UpstreamProtocol"));
  assert_eq!(record.host, "example.com");
  assert_eq!(record.port, 443);
}

#[tokio::test]
async fn test_websocket_upgrade_and_frames() {
  let (engine, proxy_addr) = start_proxy(no_intercept_config()).await;

  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    let head_text = String::from_utf8_lossy(&head).into_owned();
    let key = head_text
      .lines()
      .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
      .unwrap()
      .trim()
      .to_string();
    let response = format!(
      "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: \
       Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
      websocket::accept_key(&key)
    );
    stream.write_all(response.as_bytes()).await.unwrap();

    // One masked client frame in, one unmasked server frame out.
    let mut frame = [0u8; 8];
    stream.read_exact(&mut frame).await.unwrap();
    let hello = websocket::build_frame(true, websocket::Opcode::Text, b"hello", None);
    stream.write_all(&hello).await.unwrap();
    let mut sink = [0u8; 16];
    let _ = stream.read(&mut sink).await;
  });

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{origin_addr}/ws HTTP/1.1\r\nHost: {origin_addr}\r\nUpgrade: \
     websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
     Sec-WebSocket-Version: 13\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let upgrade = read_head(&mut client).await;
  assert!(upgrade.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
  assert!(String::from_utf8_lossy(&upgrade).contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

  let hi = websocket::build_frame(true, websocket::Opcode::Text, b"hi", Some([1, 2, 3, 4]));
  assert_eq!(hi.len(), 8);
  client.write_all(&hi).await.unwrap();

  // The server's frame relays verbatim (still unmasked).
  let expected = websocket::build_frame(true, websocket::Opcode::Text, b"hello", None);
  let mut relayed = vec![0u8; expected.len()];
  client.read_exact(&mut relayed).await.unwrap();
  assert_eq!(relayed, expected);
  drop(client);

  let upgrade_record = wait_for_record(&engine, |r| r.status == Some(101)).await;
  assert_eq!(upgrade_record.protocol, Protocol::Http);
  assert_eq!(upgrade_record.path.as_deref(), Some("/ws"));

  let client_frame = wait_for_record(&engine, |r| {
    r.protocol == Protocol::Ws && !r.request_body.is_empty()
  })
  .await;
  assert_eq!(client_frame.method.as_deref(), Some("TEXT"));
  assert_eq!(client_frame.request_body, b"hi");

  let server_frame = wait_for_record(&engine, |r| {
    r.protocol == Protocol::Ws && !r.response_body.is_empty()
  })
  .await;
  assert_eq!(server_frame.method.as_deref(), Some("TEXT"));
  assert_eq!(server_frame.response_body, b"hello");
}

#[tokio::test]
async fn test_direct_connect_failure_yields_502() {
  let (engine, proxy_addr) = start_proxy(no_intercept_config()).await;

  // A port nothing listens on: bind then drop to reserve-and-release.
  let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_addr = unused.local_addr().unwrap();
  drop(unused);

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(format!("CONNECT {dead_addr} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = read_head(&mut client).await;
  assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

  let record = wait_for_record(&engine, |r| r.error.is_some()).await;
  assert_eq!(record.error.as_deref(), Some("UpstreamUnreachable"));
}
