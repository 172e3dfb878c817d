//! # X.509 Builder
//!
//! Assembles a TBSCertificate, signs it with SHA-256 / RSA PKCS#1 v1.5, and
//! emits DER. The same builder serves the self-signed root and the per-host
//! leaves; the two differ only in their [`Profile`].

use chrono::{DateTime, Utc};
use rand::Rng;
use rsa::{pkcs1::EncodeRsaPublicKey, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::{der, errors::CertError};

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const OID_COUNTRY: &[u64] = &[2, 5, 4, 6];
const OID_ORGANIZATION: &[u64] = &[2, 5, 4, 10];
const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
const OID_EKU_SERVER_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 1];
const OID_EKU_CLIENT_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 2];

/// KeyUsage bits 5 and 6: keyCertSign, cRLSign.
const KEY_USAGE_CA: u8 = 0x06;
/// KeyUsage bits 0 and 2: digitalSignature, keyEncipherment.
const KEY_USAGE_LEAF: u8 = 0xA0;

/// Subject or issuer name. Components are emitted in C, O, CN order and only
/// when present; C uses PrintableString, O and CN UTF8String.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
  pub country:      Option<String>,
  pub organization: Option<String>,
  pub common_name:  String,
}

impl DistinguishedName {
  /// A name carrying only a CN, the shape every leaf subject uses.
  pub fn common_name(cn: impl Into<String>) -> Self {
    Self { country: None, organization: None, common_name: cn.into() }
  }

  fn to_der(&self) -> Vec<u8> {
    let mut rdns = Vec::new();
    if let Some(country) = &self.country {
      rdns.extend_from_slice(&rdn(OID_COUNTRY, der::printable_string(country)));
    }
    if let Some(organization) = &self.organization {
      rdns.extend_from_slice(&rdn(OID_ORGANIZATION, der::utf8_string(organization)));
    }
    rdns.extend_from_slice(&rdn(OID_COMMON_NAME, der::utf8_string(&self.common_name)));
    der::sequence(&rdns)
  }
}

/// One RDN: SET { SEQUENCE { type, value } }.
fn rdn(attr_type: &[u64], value: Vec<u8>) -> Vec<u8> {
  der::set(&der::sequence(&der::concat(&[&der::oid(attr_type), &value])))
}

/// What kind of certificate to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
  /// Self-signed root: BasicConstraints CA=true, KeyUsage keyCertSign+cRLSign.
  Authority,
  /// Server leaf: KeyUsage digitalSignature+keyEncipherment, EKU
  /// serverAuth+clientAuth, SubjectAltName from `subject_alt_names`.
  Leaf {
    /// DNS names or IP literals; a name that parses as an IP address becomes
    /// an IP SAN.
    subject_alt_names: Vec<String>,
  },
}

/// Inputs to [`build_certificate`].
#[derive(Debug, Clone)]
pub struct CertificateParams {
  /// Unsigned big-endian serial number
  pub serial:     Vec<u8>,
  pub issuer:     DistinguishedName,
  pub subject:    DistinguishedName,
  pub not_before: DateTime<Utc>,
  pub not_after:  DateTime<Utc>,
  pub profile:    Profile,
}

/// 16 random bytes with the MSB cleared so the INTEGER is always positive.
pub fn random_serial() -> [u8; 16] {
  let mut serial = [0u8; 16];
  rand::thread_rng().fill(&mut serial);
  serial[0] &= 0x7F;
  serial
}

/// Generates a fresh RSA key of the given modulus size.
pub fn generate_rsa_key(bits: usize) -> Result<RsaPrivateKey, CertError> {
  RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(CertError::KeyGeneration)
}

/// Builds and signs a certificate, returning its DER bytes.
///
/// The TBSCertificate carries, in order: version [0] EXPLICIT INTEGER(2),
/// serialNumber, signature AlgorithmIdentifier, issuer, validity, subject,
/// SubjectPublicKeyInfo, and extensions [3] EXPLICIT.
pub fn build_certificate(
  params: &CertificateParams,
  subject_key: &RsaPublicKey,
  signing_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CertError> {
  let signature_algorithm =
    der::sequence(&der::concat(&[&der::oid(OID_SHA256_WITH_RSA), &der::null()]));

  let public_key_der =
    subject_key.to_pkcs1_der().map_err(|e| CertError::KeyEncoding(e.to_string()))?;
  let spki = der::sequence(&der::concat(&[
    &der::sequence(&der::concat(&[&der::oid(OID_RSA_ENCRYPTION), &der::null()])),
    &der::bit_string(public_key_der.as_bytes()),
  ]));

  let validity = der::sequence(&der::concat(&[
    &der::time(&params.not_before),
    &der::time(&params.not_after),
  ]));

  let tbs = der::sequence(&der::concat(&[
    &der::explicit(0, &der::integer(&[2])),
    &der::integer(&params.serial),
    &signature_algorithm,
    &params.issuer.to_der(),
    &validity,
    &params.subject.to_der(),
    &spki,
    &der::explicit(3, &der::sequence(&extensions(&params.profile))),
  ]));

  let digest = Sha256::digest(&tbs);
  let signature =
    signing_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).map_err(CertError::Signing)?;

  Ok(der::sequence(&der::concat(&[&tbs, &signature_algorithm, &der::bit_string(&signature)])))
}

fn extensions(profile: &Profile) -> Vec<u8> {
  let mut out = Vec::new();
  match profile {
    Profile::Authority => {
      out.extend_from_slice(&extension(
        OID_BASIC_CONSTRAINTS,
        true,
        &der::sequence(&der::boolean(true)),
      ));
      out.extend_from_slice(&extension(OID_KEY_USAGE, true, &der::bit_string(&[KEY_USAGE_CA])));
    },
    Profile::Leaf { subject_alt_names } => {
      out.extend_from_slice(&extension(OID_BASIC_CONSTRAINTS, true, &der::sequence(&[])));
      out.extend_from_slice(&extension(OID_KEY_USAGE, true, &der::bit_string(&[KEY_USAGE_LEAF])));
      out.extend_from_slice(&extension(
        OID_EXT_KEY_USAGE,
        false,
        &der::sequence(&der::concat(&[
          &der::oid(OID_EKU_SERVER_AUTH),
          &der::oid(OID_EKU_CLIENT_AUTH),
        ])),
      ));
      if !subject_alt_names.is_empty() {
        let mut names = Vec::new();
        for name in subject_alt_names {
          names.extend_from_slice(&general_name(name));
        }
        out.extend_from_slice(&extension(OID_SUBJECT_ALT_NAME, false, &der::sequence(&names)));
      }
    },
  }
  out
}

/// GeneralName: `[2] IMPLICIT IA5String` for DNS names, `[7] IMPLICIT OCTET
/// STRING` (4 or 16 bytes) for IP addresses.
fn general_name(name: &str) -> Vec<u8> {
  match name.parse::<std::net::IpAddr>() {
    Ok(std::net::IpAddr::V4(v4)) => der::implicit(7, &v4.octets()),
    Ok(std::net::IpAddr::V6(v6)) => der::implicit(7, &v6.octets()),
    Err(_) => der::implicit(2, name.as_bytes()),
  }
}

/// Extension ::= SEQUENCE { extnID, critical (absent when false), extnValue }.
fn extension(oid_arcs: &[u64], critical: bool, value: &[u8]) -> Vec<u8> {
  let mut content = der::oid(oid_arcs);
  if critical {
    content.extend_from_slice(&der::boolean(true));
  }
  content.extend_from_slice(&der::octet_string(value));
  der::sequence(&content)
}

/// SHA-256 over the DER certificate, the fingerprint users pin.
pub fn sha256_fingerprint(certificate_der: &[u8]) -> [u8; 32] {
  Sha256::digest(certificate_der).into()
}

/// PEM rendering with 64-column base64 lines.
pub fn certificate_to_pem(certificate_der: &[u8]) -> String {
  use base64::Engine;
  let encoded = base64::engine::general_purpose::STANDARD.encode(certificate_der);
  let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
  for chunk in encoded.as_bytes().chunks(64) {
    pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
    pem.push('\n');
  }
  pem.push_str("-----END CERTIFICATE-----\n");
  pem
}
