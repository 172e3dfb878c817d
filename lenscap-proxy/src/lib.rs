//! The Lenscap interception engine: listener, connection state machine, CA
//! and leaf minting, TLS glue, and the traffic store, assembled around the
//! codecs in `lenscap-core`.

use std::{fs, path::PathBuf, sync::Arc};

pub mod ca;
pub mod config;
pub mod connection;
pub mod errors;
pub mod io;
pub mod listener;
pub mod mint;
pub mod secrets;
pub mod store;
pub mod tls;

use crate::{
  ca::CaStore,
  config::Config,
  errors::ProxyError,
  mint::LeafMinter,
  secrets::{FsSecretStore, SecretStore},
  store::TrafficStore,
  tls::TlsEngine,
};

/// Shared context every connection task runs against. Built once at startup;
/// there is no process-wide mutable state.
pub struct Engine {
  pub config: Arc<Config>,
  pub ca:     Arc<CaStore>,
  pub minter: Arc<LeafMinter>,
  pub tls:    Arc<TlsEngine>,
  pub store:  Arc<TrafficStore>,
}

impl Engine {
  /// Engine with filesystem-backed secrets and traffic.db under the state
  /// directory.
  pub async fn new(config: Arc<Config>) -> Result<Arc<Engine>, ProxyError> {
    config.validate()?;
    let state_dir = PathBuf::from(&config.state_dir);
    tokio::fs::create_dir_all(&state_dir)
      .await
      .map_err(|e| ProxyError::Persistence(e.to_string()))?;
    let secrets = Arc::new(FsSecretStore::new(state_dir.join("secrets")));
    let store = Arc::new(TrafficStore::open_in(&state_dir, config.max_records)?);
    Self::assemble(config, secrets, store)
  }

  /// Engine over caller-provided storage; tests use an in-memory secret
  /// store and an in-memory traffic store.
  pub fn with_storage(
    config: Arc<Config>,
    secrets: Arc<dyn SecretStore>,
    store: Arc<TrafficStore>,
  ) -> Result<Arc<Engine>, ProxyError> {
    config.validate()?;
    Self::assemble(config, secrets, store)
  }

  fn assemble(
    config: Arc<Config>,
    secrets: Arc<dyn SecretStore>,
    store: Arc<TrafficStore>,
  ) -> Result<Arc<Engine>, ProxyError> {
    let extra_roots = load_extra_roots(&config)?;
    let tls = Arc::new(TlsEngine::new(&extra_roots)?);
    let ca = Arc::new(CaStore::new(secrets));
    let minter = Arc::new(LeafMinter::new(
      ca.clone(),
      std::time::Duration::from_secs(config.cache_ttl_secs),
    ));
    Ok(Arc::new(Engine { config, ca, minter, tls, store }))
  }
}

/// Reads the configured extra root certificates (PEM or raw DER files) for
/// the outbound trust store.
fn load_extra_roots(config: &Config) -> Result<Vec<Vec<u8>>, ProxyError> {
  let mut roots = Vec::new();
  for path in &config.extra_root_certificates {
    let bytes = fs::read(path)
      .map_err(|e| ProxyError::Config(format!("cannot read root certificate {path}: {e}")))?;
    if bytes.starts_with(b"-----BEGIN") {
      let mut reader = std::io::BufReader::new(bytes.as_slice());
      for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
          .map_err(|e| ProxyError::Config(format!("unparsable PEM in {path}: {e}")))?;
        roots.push(cert.as_ref().to_vec());
      }
    } else {
      roots.push(bytes);
    }
  }
  Ok(roots)
}
