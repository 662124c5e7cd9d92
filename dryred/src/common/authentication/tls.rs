// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mutual TLS with public-key identities
//!
//! Certificates are only carriers for keys: no chain is built and no name is
//! checked. The broker admits a client when the key in its certificate is in
//! the [ClientRegistry]; peers either pin the broker's key or log its fingerprint.
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, FutureExt};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, DistinguishedName, PrivateKey, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::traits::{
  AuthenticationError, BoxedSession, PeerTransport, SecureSession, TransportSecurity,
};
use crate::common::clients::ClientRegistry;
use crate::common::identity::{PublicKey, PublicKeyError};

/// Name sent in the client hello; never verified
pub const BROKER_SERVER_NAME: &str = "broker.dryred";

#[derive(thiserror::Error, Debug)]
pub enum CredentialsError {
  #[error("Failed to read {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("No certificate found in {0:?}")]
  NoCertificate(PathBuf),
  #[error("No private key found in {0:?}")]
  NoPrivateKey(PathBuf),
  #[error("Certificate carries an unusable key: {0}")]
  InvalidKey(#[from] PublicKeyError),
  #[error("TLS configuration rejected the credentials: {0}")]
  Rejected(#[from] rustls::Error),
}

/// A certificate chain and the private key for its leaf
#[derive(Clone)]
pub struct Credentials {
  chain: Vec<Certificate>,
  key: PrivateKey,
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials")
      .field("public_key", &self.public_key().ok())
      .finish_non_exhaustive()
  }
}

impl Credentials {
  pub fn from_der(certificate_der: Vec<u8>, private_key_der: Vec<u8>) -> Self {
    Self {
      chain: vec![Certificate(certificate_der)],
      key: PrivateKey(private_key_der),
    }
  }

  pub fn from_pem_files(certificate: &Path, private_key: &Path) -> Result<Self, CredentialsError> {
    let chain: Vec<Certificate> = read_pem_items(certificate)?
      .into_iter()
      .filter_map(|item| match item {
        rustls_pemfile::Item::X509Certificate(der) => Some(Certificate(der)),
        _ => None,
      })
      .collect();
    if chain.is_empty() {
      return Err(CredentialsError::NoCertificate(certificate.to_owned()));
    }
    let key = read_pem_items(private_key)?
      .into_iter()
      .find_map(|item| match item {
        rustls_pemfile::Item::PKCS8Key(der)
        | rustls_pemfile::Item::RSAKey(der)
        | rustls_pemfile::Item::ECKey(der) => Some(PrivateKey(der)),
        _ => None,
      })
      .ok_or_else(|| CredentialsError::NoPrivateKey(private_key.to_owned()))?;
    Ok(Self { chain, key })
  }

  /// Public key of the leaf certificate
  pub fn public_key(&self) -> Result<PublicKey, PublicKeyError> {
    let leaf = self.chain.first().ok_or(PublicKeyError::Empty)?;
    PublicKey::from_certificate_der(&leaf.0)
  }
}

fn read_pem_items(path: &Path) -> Result<Vec<rustls_pemfile::Item>, CredentialsError> {
  let io_error = |source| CredentialsError::Io {
    path: path.to_owned(),
    source,
  };
  let file = std::fs::File::open(path).map_err(io_error)?;
  let mut reader = BufReader::new(file);
  let mut items = Vec::new();
  while let Some(item) = rustls_pemfile::read_one(&mut reader).map_err(io_error)? {
    items.push(item);
  }
  Ok(items)
}

fn peer_key_of(certificates: Option<&[Certificate]>) -> Result<PublicKey, AuthenticationError> {
  let leaf = certificates
    .and_then(|chain| chain.first())
    .ok_or(AuthenticationError::MissingPeerKey)?;
  Ok(PublicKey::from_certificate_der(&leaf.0)?)
}

/// Admits exactly the client keys present in the registry
struct RegistryClientVerifier {
  registry: Arc<dyn ClientRegistry>,
}

impl ClientCertVerifier for RegistryClientVerifier {
  fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
    &[]
  }

  fn verify_client_cert(
    &self,
    end_entity: &Certificate,
    _intermediates: &[Certificate],
    _now: SystemTime,
  ) -> Result<ClientCertVerified, rustls::Error> {
    let key = PublicKey::from_certificate_der(&end_entity.0)
      .map_err(|e| rustls::Error::General(e.to_string()))?;
    match self.registry.find_by_public_key(&key) {
      Some(identity) => {
        tracing::trace!(client = identity.name(), "Client key recognized");
        Ok(ClientCertVerified::assertion())
      }
      None => {
        tracing::info!(fingerprint = %key.fingerprint(), "Refusing unregistered client key");
        Err(rustls::Error::General(format!(
          "unregistered client key {}",
          key.fingerprint()
        )))
      }
    }
  }
}

/// How a peer decides whether to trust the broker it dialed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerKeyPolicy {
  /// Trust on sight, logging the fingerprint so an operator can pin it later
  AcceptAny,
  Pinned(PublicKey),
}

struct BrokerKeyVerifier {
  policy: BrokerKeyPolicy,
}

impl ServerCertVerifier for BrokerKeyVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    let key = PublicKey::from_certificate_der(&end_entity.0)
      .map_err(|e| rustls::Error::General(e.to_string()))?;
    match &self.policy {
      BrokerKeyPolicy::AcceptAny => {
        tracing::info!(fingerprint = %key.fingerprint(), "Accepting broker key");
        Ok(ServerCertVerified::assertion())
      }
      BrokerKeyPolicy::Pinned(pinned) if pinned == &key => Ok(ServerCertVerified::assertion()),
      BrokerKeyPolicy::Pinned(pinned) => {
        tracing::warn!(
          expected = %pinned.fingerprint(),
          presented = %key.fingerprint(),
          "Broker key does not match the pinned key"
        );
        Err(rustls::Error::General(String::from(
          "broker key does not match the pinned key",
        )))
      }
    }
  }
}

impl<S> SecureSession<S> for tokio_rustls::server::TlsStream<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn peer_key(&self) -> Result<PublicKey, AuthenticationError> {
    let (_, connection) = self.get_ref();
    peer_key_of(connection.peer_certificates())
  }

  fn into_raw(self: Box<Self>) -> S {
    let (raw, _session) = (*self).into_inner();
    raw
  }
}

impl<S> SecureSession<S> for tokio_rustls::client::TlsStream<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn peer_key(&self) -> Result<PublicKey, AuthenticationError> {
    let (_, connection) = self.get_ref();
    peer_key_of(connection.peer_certificates())
  }

  fn into_raw(self: Box<Self>) -> S {
    let (raw, _session) = (*self).into_inner();
    raw
  }
}

/// Broker-side mutual TLS, admitting clients by registry lookup
#[derive(Clone)]
pub struct TlsTransport {
  acceptor: TlsAcceptor,
}

impl TlsTransport {
  pub fn new(
    credentials: Credentials,
    registry: Arc<dyn ClientRegistry>,
  ) -> Result<Self, CredentialsError> {
    let mut config = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_client_cert_verifier(Arc::new(RegistryClientVerifier { registry }))
      .with_single_cert(credentials.chain, credentials.key)?;
    // Sessions are never resumed; the stream is handed off after one exchange
    config.send_tls13_tickets = 0;
    Ok(Self {
      acceptor: TlsAcceptor::from(Arc::new(config)),
    })
  }
}

impl<S> TransportSecurity<S> for TlsTransport
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  fn accept(&self, raw: S) -> BoxFuture<'static, Result<BoxedSession<S>, AuthenticationError>> {
    let acceptor = self.acceptor.clone();
    async move {
      let session = acceptor
        .accept(raw)
        .await
        .map_err(AuthenticationError::Handshake)?;
      Ok(Box::new(session) as BoxedSession<S>)
    }
    .boxed()
  }
}

/// Peer-side mutual TLS
#[derive(Clone)]
pub struct TlsPeerTransport {
  connector: TlsConnector,
  server_name: ServerName,
}

impl TlsPeerTransport {
  pub fn new(credentials: Credentials, policy: BrokerKeyPolicy) -> Result<Self, CredentialsError> {
    let config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_custom_certificate_verifier(Arc::new(BrokerKeyVerifier { policy }))
      .with_client_auth_cert(credentials.chain, credentials.key)?;
    let server_name = ServerName::try_from(BROKER_SERVER_NAME)
      .map_err(|e| rustls::Error::General(e.to_string()))?;
    Ok(Self {
      connector: TlsConnector::from(Arc::new(config)),
      server_name,
    })
  }
}

impl<S> PeerTransport<S> for TlsPeerTransport
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  fn connect(&self, raw: S) -> BoxFuture<'static, Result<BoxedSession<S>, AuthenticationError>> {
    let connector = self.connector.clone();
    let server_name = self.server_name.clone();
    async move {
      let session = connector
        .connect(server_name, raw)
        .await
        .map_err(AuthenticationError::Handshake)?;
      Ok(Box::new(session) as BoxedSession<S>)
    }
    .boxed()
  }
}
