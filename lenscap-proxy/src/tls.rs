//! TLS glue around rustls: a connector with webpki roots (plus configured
//! extras) for the server-facing leg, and per-leaf acceptors for the
//! client-facing leg.

use std::sync::Arc;

use rustls::{
  pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
  ClientConfig, RootCertStore, ServerConfig,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use crate::{
  errors::{ProxyError, Side},
  mint::LeafIdentity,
};

pub struct TlsEngine {
  connector: TlsConnector,
}

impl TlsEngine {
  /// Builds the outbound connector. `extra_roots` are DER certificates
  /// trusted in addition to the webpki bundle (e.g. a private CA).
  pub fn new(extra_roots: &[Vec<u8>]) -> Result<Self, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for der in extra_roots {
      roots
        .add(CertificateDer::from(der.clone()))
        .map_err(|e| ProxyError::Config(format!("unusable extra root certificate: {e}")))?;
    }
    let config =
      ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Self { connector: TlsConnector::from(Arc::new(config)) })
  }

  /// Acceptor presenting a minted leaf with the CA appended to the chain.
  pub fn acceptor_for(identity: &LeafIdentity, ca_der: &[u8]) -> Result<TlsAcceptor, ProxyError> {
    let chain = vec![
      CertificateDer::from(identity.certificate_der.clone()),
      CertificateDer::from(ca_der.to_vec()),
    ];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key_der.clone()));
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| ProxyError::TlsHandshake { side: Side::Client, detail: e.to_string() })?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
  }

  /// Opens the server-facing TLS leg over an established stream.
  pub async fn connect<IO>(&self, stream: IO, host: &str) -> Result<client::TlsStream<IO>, ProxyError>
  where IO: AsyncRead + AsyncWrite + Unpin {
    let name = ServerName::try_from(host.to_string())
      .map_err(|_| ProxyError::TlsHandshake {
        side:   Side::Server,
        detail: format!("invalid server name: {host}"),
      })?;
    self
      .connector
      .connect(name, stream)
      .await
      .map_err(|e| ProxyError::TlsHandshake { side: Side::Server, detail: e.to_string() })
  }
}
