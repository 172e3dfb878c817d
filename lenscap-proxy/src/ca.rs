//! # CA Store
//!
//! Owns the root key pair and its DER certificate. Material is persisted as
//! two named blobs in the [`SecretStore`] and deleted as an atomic pair.
//! Generation counts let the leaf cache detect a replaced root.

use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

use chrono::{Duration, Utc};
use lenscap_core::x509::{
  self, CertificateParams, DistinguishedName, Profile,
};
use rsa::{
  pkcs8::{DecodePrivateKey, EncodePrivateKey},
  RsaPrivateKey,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::{errors::ProxyError, secrets::SecretStore};

pub const CA_CERTIFICATE_SECRET: &str = "ca_certificate.der";
pub const CA_PRIVATE_KEY_SECRET: &str = "ca_private_key.der";

const CA_COMMON_NAME: &str = "Lenscap Root CA";
const CA_VALIDITY_DAYS: i64 = 3650;
const DEFAULT_KEY_BITS: usize = 2048;

/// The active root: private key plus self-signed DER certificate.
pub struct CertificateAuthority {
  pub private_key:     RsaPrivateKey,
  pub certificate_der: Vec<u8>,
}

impl CertificateAuthority {
  pub fn subject() -> DistinguishedName {
    DistinguishedName {
      country:      Some("US".to_string()),
      organization: Some("Lenscap".to_string()),
      common_name:  CA_COMMON_NAME.to_string(),
    }
  }

  /// SHA-256 of the DER certificate.
  pub fn fingerprint(&self) -> [u8; 32] { x509::sha256_fingerprint(&self.certificate_der) }
}

pub struct CaStore {
  secrets:    Arc<dyn SecretStore>,
  current:    RwLock<Option<Arc<CertificateAuthority>>>,
  generation: AtomicU64,
  key_bits:   usize,
}

impl CaStore {
  pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
    Self::with_key_bits(secrets, DEFAULT_KEY_BITS)
  }

  pub fn with_key_bits(secrets: Arc<dyn SecretStore>, key_bits: usize) -> Self {
    Self { secrets, current: RwLock::new(None), generation: AtomicU64::new(0), key_bits }
  }

  /// Counter bumped on every generate/delete; leaves minted under an older
  /// generation are stale.
  pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }

  /// The in-memory root, if one has been loaded or generated.
  pub async fn current(&self) -> Option<Arc<CertificateAuthority>> {
    self.current.read().await.clone()
  }

  /// Loads the persisted root, caching it in memory. `None` when the secret
  /// store has no CA.
  pub async fn load(&self) -> Result<Option<Arc<CertificateAuthority>>, ProxyError> {
    if let Some(ca) = self.current().await {
      return Ok(Some(ca));
    }
    let certificate_der = self.secrets.get(CA_CERTIFICATE_SECRET).await?;
    let key_der = self.secrets.get(CA_PRIVATE_KEY_SECRET).await?;
    let (Some(certificate_der), Some(key_der)) = (certificate_der, key_der) else {
      return Ok(None);
    };
    let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
      .map_err(|e| ProxyError::Persistence(format!("stored CA key is unreadable: {e}")))?;

    let ca = Arc::new(CertificateAuthority { private_key, certificate_der });
    let mut slot = self.current.write().await;
    if slot.is_none() {
      *slot = Some(ca.clone());
    }
    Ok(Some(slot.clone().expect("slot was just filled")))
  }

  /// Generates a fresh self-signed root and persists it, replacing any
  /// previous one.
  pub async fn generate(&self) -> Result<Arc<CertificateAuthority>, ProxyError> {
    let key_bits = self.key_bits;
    let ca = tokio::task::spawn_blocking(move || -> Result<CertificateAuthority, ProxyError> {
      let private_key = x509::generate_rsa_key(key_bits)?;
      let now = Utc::now();
      let params = CertificateParams {
        serial:     x509::random_serial().to_vec(),
        issuer:     CertificateAuthority::subject(),
        subject:    CertificateAuthority::subject(),
        not_before: now,
        not_after:  now + Duration::days(CA_VALIDITY_DAYS),
        profile:    Profile::Authority,
      };
      let certificate_der =
        x509::build_certificate(&params, &private_key.to_public_key(), &private_key)?;
      Ok(CertificateAuthority { private_key, certificate_der })
    })
    .await
    .map_err(|e| ProxyError::Persistence(format!("generation task failed: {e}")))??;

    let key_der = ca
      .private_key
      .to_pkcs8_der()
      .map_err(|e| ProxyError::Persistence(format!("key serialization failed: {e}")))?;
    self.secrets.put(CA_CERTIFICATE_SECRET, &ca.certificate_der).await?;
    self.secrets.put(CA_PRIVATE_KEY_SECRET, key_der.as_bytes()).await?;

    let ca = Arc::new(ca);
    *self.current.write().await = Some(ca.clone());
    self.generation.fetch_add(1, Ordering::Release);
    info!(fingerprint = %hex::encode(ca.fingerprint()), "generated certificate authority");
    Ok(ca)
  }

  pub async fn load_or_generate(&self) -> Result<Arc<CertificateAuthority>, ProxyError> {
    match self.load().await? {
      Some(ca) => Ok(ca),
      None => self.generate().await,
    }
  }

  /// Removes the root from memory and the secret store as a pair.
  pub async fn delete(&self) -> Result<(), ProxyError> {
    let mut slot = self.current.write().await;
    self.secrets.delete(CA_CERTIFICATE_SECRET).await?;
    self.secrets.delete(CA_PRIVATE_KEY_SECRET).await?;
    *slot = None;
    self.generation.fetch_add(1, Ordering::Release);
    Ok(())
  }

  pub async fn fingerprint(&self) -> Option<[u8; 32]> {
    self.current().await.map(|ca| ca.fingerprint())
  }

  /// PEM export of the active root certificate.
  pub async fn certificate_pem(&self) -> Option<String> {
    self.current().await.map(|ca| x509::certificate_to_pem(&ca.certificate_der))
  }
}
