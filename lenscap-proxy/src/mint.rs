//! # Leaf Minter
//!
//! Produces per-host leaf identities signed by the active CA, cached by
//! hostname. Concurrent misses for the same host mint once (per-host
//! single-flight); the TTL is an eviction hint and a replaced CA invalidates
//! every cached entry through the generation counter.

use std::{
  collections::HashMap,
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::Utc;
use lenscap_core::x509::{self, CertificateParams, DistinguishedName, Profile};
use rsa::pkcs8::EncodePrivateKey;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::{
  ca::{CaStore, CertificateAuthority},
  errors::ProxyError,
};

const LEAF_VALIDITY_DAYS: i64 = 30;
/// Leaves are backdated slightly so clock skew does not reject them.
const LEAF_BACKDATE_SECS: i64 = 300;
const DEFAULT_KEY_BITS: usize = 2048;

/// A minted leaf: PKCS#8 key DER plus certificate DER, ready for a TLS
/// acceptor.
pub struct LeafIdentity {
  pub host:            String,
  pub private_key_der: Vec<u8>,
  pub certificate_der: Vec<u8>,
  pub minted_at:       Instant,
  pub ca_generation:   u64,
}

pub struct LeafMinter {
  ca:       Arc<CaStore>,
  ttl:      Duration,
  key_bits: usize,
  cache:    RwLock<HashMap<String, Arc<LeafIdentity>>>,
  inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LeafMinter {
  pub fn new(ca: Arc<CaStore>, ttl: Duration) -> Self {
    Self::with_key_bits(ca, ttl, DEFAULT_KEY_BITS)
  }

  pub fn with_key_bits(ca: Arc<CaStore>, ttl: Duration, key_bits: usize) -> Self {
    Self {
      ca,
      ttl,
      key_bits,
      cache: RwLock::new(HashMap::new()),
      inflight: Mutex::new(HashMap::new()),
    }
  }

  /// Returns the cached identity for `host`, minting one on a miss.
  /// [`ProxyError::CaUnavailable`] when no CA is loaded.
  pub async fn identity_for(&self, host: &str) -> Result<Arc<LeafIdentity>, ProxyError> {
    let ca = self.ca.load().await?.ok_or(ProxyError::CaUnavailable)?;
    let generation = self.ca.generation();

    if let Some(identity) = self.cached(host, generation).await {
      return Ok(identity);
    }

    // Single-flight per hostname: concurrent misses wait on the first mint.
    let gate = {
      let mut inflight = self.inflight.lock().await;
      inflight.entry(host.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    };
    let _minting = gate.lock().await;

    if let Some(identity) = self.cached(host, generation).await {
      return Ok(identity);
    }

    debug!(host, "minting leaf certificate");
    let identity = Arc::new(mint(host, &ca, generation, self.key_bits).await?);
    // Last write wins.
    self.cache.write().await.insert(host.to_string(), identity.clone());
    self.inflight.lock().await.remove(host);
    Ok(identity)
  }

  /// Drops every cached leaf; used when the CA is deleted.
  pub async fn invalidate(&self) { self.cache.write().await.clear(); }

  async fn cached(&self, host: &str, generation: u64) -> Option<Arc<LeafIdentity>> {
    let cache = self.cache.read().await;
    let identity = cache.get(host)?;
    if identity.ca_generation == generation && identity.minted_at.elapsed() < self.ttl {
      Some(identity.clone())
    } else {
      None
    }
  }
}

async fn mint(
  host: &str,
  ca: &Arc<CertificateAuthority>,
  generation: u64,
  key_bits: usize,
) -> Result<LeafIdentity, ProxyError> {
  let host = host.to_string();
  let ca = ca.clone();
  tokio::task::spawn_blocking(move || -> Result<LeafIdentity, ProxyError> {
    let private_key = x509::generate_rsa_key(key_bits)?;
    let now = Utc::now();
    let params = CertificateParams {
      serial:     x509::random_serial().to_vec(),
      issuer:     CertificateAuthority::subject(),
      subject:    DistinguishedName::common_name(&host),
      not_before: now - chrono::Duration::seconds(LEAF_BACKDATE_SECS),
      not_after:  now + chrono::Duration::days(LEAF_VALIDITY_DAYS),
      profile:    Profile::Leaf { subject_alt_names: vec![host.clone()] },
    };
    let certificate_der =
      x509::build_certificate(&params, &private_key.to_public_key(), &ca.private_key)?;
    let private_key_der = private_key
      .to_pkcs8_der()
      .map_err(|e| ProxyError::Persistence(format!("key serialization failed: {e}")))?
      .as_bytes()
      .to_vec();
    Ok(LeafIdentity {
      host,
      private_key_der,
      certificate_der,
      minted_at: Instant::now(),
      ca_generation: generation,
    })
  })
  .await
  .map_err(|e| ProxyError::Persistence(format!("minting task failed: {e}")))?
}
