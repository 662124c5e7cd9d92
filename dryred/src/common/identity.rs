// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt::{Debug, Display, Formatter};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which side of a reverse connection a client plays
///
/// Back clients sit behind NAT and park listeners at the broker;
/// front clients ask the broker to be joined to a parked back client.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Front,
  Back,
}

impl Display for Role {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Role::Front => f.write_str("front"),
      Role::Back => f.write_str("back"),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum PublicKeyError {
  #[error("Public key is empty")]
  Empty,
  #[error("Public key is not valid base64: {0}")]
  Encoding(#[from] base64::DecodeError),
  #[error("Certificate could not be parsed: {0}")]
  Certificate(String),
}

/// A client's public key, held as its DER-encoded SubjectPublicKeyInfo
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
  pub fn from_spki_der(der: impl Into<Vec<u8>>) -> Result<Self, PublicKeyError> {
    let der = der.into();
    if der.is_empty() {
      return Err(PublicKeyError::Empty);
    }
    Ok(Self(der))
  }

  /// Extracts the subject public key from a DER-encoded X.509 certificate
  pub fn from_certificate_der(certificate: &[u8]) -> Result<Self, PublicKeyError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(certificate)
      .map_err(|e| PublicKeyError::Certificate(e.to_string()))?;
    Self::from_spki_der(parsed.public_key().raw)
  }

  pub fn from_base64(encoded: &str) -> Result<Self, PublicKeyError> {
    Self::from_spki_der(general_purpose::STANDARD.decode(encoded.trim())?)
  }

  pub fn to_base64(&self) -> String {
    general_purpose::STANDARD.encode(&self.0)
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// `SHA256:` followed by the unpadded base64 digest of the key
  pub fn fingerprint(&self) -> String {
    let digest = Sha256::digest(&self.0);
    format!("SHA256:{}", general_purpose::STANDARD_NO_PAD.encode(digest))
  }
}

impl Debug for PublicKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("PublicKey")
      .field(&self.fingerprint())
      .finish()
  }
}

/// An authenticated client as known to the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
  name: String,
  role: Role,
  public_key: PublicKey,
  fingerprint: String,
}

impl Identity {
  pub fn new(name: impl Into<String>, role: Role, public_key: PublicKey) -> Self {
    let fingerprint = public_key.fingerprint();
    Self {
      name: name.into(),
      role,
      public_key,
      fingerprint,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn public_key(&self) -> &PublicKey {
    &self.public_key
  }

  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

#[cfg(test)]
mod tests {
  use super::{Identity, PublicKey, PublicKeyError, Role};

  #[test]
  fn fingerprint_format() {
    let key = PublicKey::from_spki_der(b"not really a key".to_vec()).unwrap();
    let fingerprint = key.fingerprint();
    assert!(fingerprint.starts_with("SHA256:"));
    // 32 digest bytes encode to 43 unpadded base64 characters
    assert_eq!(fingerprint.len(), "SHA256:".len() + 43);
    assert!(!fingerprint.ends_with('='));
    assert_eq!(
      Identity::new("pi", Role::Back, key.clone()).fingerprint(),
      fingerprint
    );
  }

  #[test]
  fn certificate_key_matches_generated_key() {
    let cert = rcgen::generate_simple_self_signed(vec!["pi".into()]).unwrap();
    let der = cert.serialize_der().unwrap();
    let from_cert = PublicKey::from_certificate_der(&der).unwrap();
    assert_eq!(from_cert.as_bytes(), cert.get_key_pair().public_key_der());
    let reparsed = PublicKey::from_base64(&from_cert.to_base64()).unwrap();
    assert_eq!(from_cert, reparsed);
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(
      PublicKey::from_base64("!!!"),
      Err(PublicKeyError::Encoding(_))
    ));
    assert!(matches!(PublicKey::from_base64(""), Err(PublicKeyError::Empty)));
    assert!(matches!(
      PublicKey::from_certificate_der(b"garbage"),
      Err(PublicKeyError::Certificate(_))
    ));
  }

  #[test]
  fn roles_serialize_lowercase() {
    assert_eq!(serde_json::to_string(&Role::Back).unwrap(), "\"back\"");
    assert_eq!(Role::Front.to_string(), "front");
  }
}
