// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::identity::{PublicKey, PublicKeyError};

#[derive(thiserror::Error, Debug)]
pub enum AuthenticationError {
  #[error("Secure session handshake failed: {0}")]
  Handshake(#[source] std::io::Error),
  #[error("Peer presented no public key")]
  MissingPeerKey,
  #[error("Peer public key could not be read: {0}")]
  InvalidPeerKey(#[from] PublicKeyError),
  #[error("Peer key {fingerprint} does not belong to a registered client")]
  UnknownKey { fingerprint: String },
}

/// An established secure session over a raw stream `S`
///
/// Once a control exchange succeeds the session layer is discarded with
/// [SecureSession::into_raw], and the raw stream carries opaque bytes from then on.
pub trait SecureSession<S>: AsyncRead + AsyncWrite + Send + Unpin {
  /// The public key the remote proved possession of during the handshake
  fn peer_key(&self) -> Result<PublicKey, AuthenticationError>;

  /// Drops the session layer without closing the raw stream beneath it
  fn into_raw(self: Box<Self>) -> S;
}

pub type BoxedSession<S> = Box<dyn SecureSession<S>>;

/// Broker side of the handshake
pub trait TransportSecurity<S>: Send + Sync {
  fn accept(&self, raw: S) -> BoxFuture<'static, Result<BoxedSession<S>, AuthenticationError>>;
}

/// Peer side of the handshake
pub trait PeerTransport<S>: Send + Sync {
  fn connect(&self, raw: S) -> BoxFuture<'static, Result<BoxedSession<S>, AuthenticationError>>;
}
