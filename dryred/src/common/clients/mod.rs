// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Known clients and the forwarding policy between their roles
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::identity::{Identity, PublicKey, PublicKeyError, Role};

/// Read-only view of the clients a broker will talk to
///
/// Lookups must be safe to call concurrently from every connection handler.
#[cfg_attr(test, mockall::automock)]
pub trait ClientRegistry: Send + Sync {
  fn find_by_public_key(&self, key: &PublicKey) -> Option<Identity>;

  fn find_by_name(&self, name: &str) -> Option<Identity>;

  /// Whether a client in role `from` may be forwarded to a client in role `to`
  fn is_forward_allowed(&self, from: Role, to: Role) -> bool;
}

#[derive(thiserror::Error, Debug)]
pub enum ClientRegistryError {
  #[error("Failed to read clients file {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Clients file is not valid: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Client {name:?} has an invalid public key: {source}")]
  InvalidKey {
    name: String,
    #[source]
    source: PublicKeyError,
  },
  #[error("Client name {0:?} is registered more than once")]
  DuplicateName(String),
  #[error("Client {name:?} reuses key {fingerprint} of another client")]
  DuplicateKey { name: String, fingerprint: String },
}

/// On-disk layout of a clients file
///
/// ```json
/// { "front": [{ "name": "laptop", "public_key": "<base64 SPKI>" }],
///   "back":  [{ "name": "pi", "public_key": "<base64 SPKI>" }] }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientsFile {
  #[serde(default)]
  pub front: Vec<ClientEntry>,
  #[serde(default)]
  pub back: Vec<ClientEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
  pub name: String,
  pub public_key: String,
}

/// A fixed set of clients, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticClientRegistry {
  by_key: HashMap<PublicKey, Identity>,
  by_name: HashMap<String, Identity>,
}

impl StaticClientRegistry {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn with_client(
    mut self,
    name: impl Into<String>,
    role: Role,
    public_key: PublicKey,
  ) -> Result<Self, ClientRegistryError> {
    self.insert(Identity::new(name, role, public_key))?;
    Ok(self)
  }

  pub fn insert(&mut self, identity: Identity) -> Result<(), ClientRegistryError> {
    if self.by_name.contains_key(identity.name()) {
      return Err(ClientRegistryError::DuplicateName(identity.name().into()));
    }
    if self.by_key.contains_key(identity.public_key()) {
      return Err(ClientRegistryError::DuplicateKey {
        name: identity.name().into(),
        fingerprint: identity.fingerprint().into(),
      });
    }
    self
      .by_name
      .insert(identity.name().to_owned(), identity.clone());
    self.by_key.insert(identity.public_key().clone(), identity);
    Ok(())
  }

  pub fn from_clients_file(file: ClientsFile) -> Result<Self, ClientRegistryError> {
    let mut registry = Self::new();
    let entries = file
      .front
      .into_iter()
      .map(|entry| (Role::Front, entry))
      .chain(file.back.into_iter().map(|entry| (Role::Back, entry)));
    for (role, entry) in entries {
      let key = PublicKey::from_base64(&entry.public_key).map_err(|source| {
        ClientRegistryError::InvalidKey {
          name: entry.name.clone(),
          source,
        }
      })?;
      registry.insert(Identity::new(entry.name, role, key))?;
    }
    Ok(registry)
  }

  pub fn from_json_str(contents: &str) -> Result<Self, ClientRegistryError> {
    Self::from_clients_file(serde_json::from_str(contents)?)
  }

  #[tracing::instrument(level = "debug", err)]
  pub fn from_json_file(path: &Path) -> Result<Self, ClientRegistryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ClientRegistryError::Io {
      path: path.to_owned(),
      source,
    })?;
    let registry = Self::from_json_str(&contents)?;
    tracing::info!(clients = registry.len(), "Loaded client registry");
    Ok(registry)
  }

  pub fn len(&self) -> usize {
    self.by_name.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_name.is_empty()
  }
}

impl ClientRegistry for StaticClientRegistry {
  fn find_by_public_key(&self, key: &PublicKey) -> Option<Identity> {
    self.by_key.get(key).cloned()
  }

  fn find_by_name(&self, name: &str) -> Option<Identity> {
    self.by_name.get(name).cloned()
  }

  fn is_forward_allowed(&self, from: Role, to: Role) -> bool {
    from == Role::Front && to == Role::Back
  }
}

#[cfg(test)]
mod tests {
  use super::{ClientRegistry, ClientRegistryError, StaticClientRegistry};
  use crate::common::identity::{PublicKey, Role};

  fn key(seed: &str) -> PublicKey {
    PublicKey::from_spki_der(seed.as_bytes().to_vec()).unwrap()
  }

  #[test]
  fn loads_both_roles_from_json() {
    let json = format!(
      r#"{{ "front": [{{ "name": "laptop", "public_key": "{}" }}],
           "back": [{{ "name": "pi", "public_key": "{}" }}] }}"#,
      key("laptop").to_base64(),
      key("pi").to_base64(),
    );
    let registry = StaticClientRegistry::from_json_str(&json).unwrap();
    assert_eq!(registry.len(), 2);
    let pi = registry.find_by_public_key(&key("pi")).unwrap();
    assert_eq!(pi.name(), "pi");
    assert_eq!(pi.role(), Role::Back);
    assert_eq!(
      registry.find_by_name("laptop").map(|i| i.role()),
      Some(Role::Front)
    );
    assert!(registry.find_by_public_key(&key("stranger")).is_none());
    assert!(registry.find_by_name("stranger").is_none());
  }

  #[test]
  fn only_front_to_back_is_allowed() {
    let registry = StaticClientRegistry::new();
    assert!(registry.is_forward_allowed(Role::Front, Role::Back));
    assert!(!registry.is_forward_allowed(Role::Back, Role::Back));
    assert!(!registry.is_forward_allowed(Role::Back, Role::Front));
    assert!(!registry.is_forward_allowed(Role::Front, Role::Front));
  }

  #[test]
  fn duplicates_are_refused() {
    let registry = StaticClientRegistry::new()
      .with_client("pi", Role::Back, key("pi"))
      .unwrap();
    assert!(matches!(
      registry.clone().with_client("pi", Role::Front, key("other")),
      Err(ClientRegistryError::DuplicateName(name)) if name == "pi"
    ));
    assert!(matches!(
      registry.with_client("laptop", Role::Front, key("pi")),
      Err(ClientRegistryError::DuplicateKey { name, .. }) if name == "laptop"
    ));
  }

  #[test]
  fn bad_keys_name_the_client() {
    let json = r#"{ "back": [{ "name": "pi", "public_key": "%%%" }] }"#;
    assert!(matches!(
      StaticClientRegistry::from_json_str(json),
      Err(ClientRegistryError::InvalidKey { name, .. }) if name == "pi"
    ));
  }
}
