// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection control engine
//!
//! Every accepted connection is driven through the same sequence: secure-session
//! handshake, one request awaited under a deadline, authorization, then either
//! parking (Listen) or matching and splicing (Connect). Anything that fails is
//! answered, where a reply is still meaningful, and the connection is closed.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::matching::{MatchError, MatchingRegistry, RegistrationError};
use super::BrokerConfig;
use crate::common::authentication::{AuthenticationError, BoxedSession, TransportSecurity};
use crate::common::clients::ClientRegistry;
use crate::common::identity::{Identity, Role};
use crate::common::protocol::control::{
  read_envelope, read_handoff_marker, write_reply, ConnectRequest, ControlReply, ControlRequest,
  ListenRequest,
};
use crate::util::cancellation::CancellationListener;
use crate::util::framed::{JsonReadError, JsonWriteError, ReadError, WriteError};
use crate::util::{splice, SpliceSummary};

const NOT_A_BACK_CLIENT: &str = "not a back client";
const NOT_A_FRONT_CLIENT: &str = "not a front client";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Authentication,
  Protocol,
  Authorization,
  Conflict,
  NotFound,
  Io,
  Timeout,
  Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
  #[error("Authentication failed: {0}")]
  Authentication(#[from] AuthenticationError),
  #[error("Malformed control exchange: {0}")]
  Protocol(String),
  #[error("Client {name:?} is not authorized: {reason}")]
  Unauthorized { name: String, reason: String },
  #[error("A listener is already registered as {0:?}")]
  NameInUse(String),
  #[error("No listener registered as {0:?}")]
  NoListener(String),
  #[error("Control connection I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("No control traffic within {0:?}")]
  Timeout(Duration),
  #[error("Broker is shutting down")]
  Cancelled,
}

impl ControlError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ControlError::Authentication(_) => ErrorKind::Authentication,
      ControlError::Protocol(_) => ErrorKind::Protocol,
      ControlError::Unauthorized { .. } => ErrorKind::Authorization,
      ControlError::NameInUse(_) => ErrorKind::Conflict,
      ControlError::NoListener(_) => ErrorKind::NotFound,
      ControlError::Io(_) => ErrorKind::Io,
      ControlError::Timeout(_) => ErrorKind::Timeout,
      ControlError::Cancelled => ErrorKind::Cancelled,
    }
  }
}

impl From<JsonWriteError> for ControlError {
  fn from(error: JsonWriteError) -> Self {
    match error {
      JsonWriteError::Write(WriteError::UnexpectedEnd(io)) => ControlError::Io(io),
      other => ControlError::Protocol(other.to_string()),
    }
  }
}

/// How a connection that passed its control exchange ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
  /// A back client's stream now waits in the matching registry
  Parked { name: String },
  /// A front client was spliced to `target` until either side closed
  Forwarded {
    target: String,
    summary: SpliceSummary,
  },
}

pub struct ControlEngine<S, T> {
  config: BrokerConfig,
  registry: Arc<dyn ClientRegistry>,
  transport: T,
  listeners: Arc<MatchingRegistry<S>>,
}

impl<S, T> ControlEngine<S, T>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  T: TransportSecurity<S>,
{
  pub fn new(
    config: BrokerConfig,
    registry: Arc<dyn ClientRegistry>,
    transport: T,
    listeners: Arc<MatchingRegistry<S>>,
  ) -> Self {
    Self {
      config,
      registry,
      transport,
      listeners,
    }
  }

  pub fn listeners(&self) -> &Arc<MatchingRegistry<S>> {
    &self.listeners
  }

  pub async fn handle_connection(
    &self,
    raw: S,
    shutdown: &CancellationListener,
  ) -> Result<ConnectionOutcome, ControlError> {
    let handshake = tokio::select! {
      accepted = tokio::time::timeout(self.config.request_timeout, self.transport.accept(raw)) => accepted,
      _ = shutdown.cancelled() => return Err(ControlError::Cancelled),
    };
    let mut session =
      handshake.map_err(|_| ControlError::Timeout(self.config.request_timeout))??;
    let identity = self.authenticate(&session)?;
    tracing::info!(
      client = identity.name(),
      role = %identity.role(),
      fingerprint = identity.fingerprint(),
      "Client authenticated"
    );

    let request = self.await_request(&mut session, shutdown).await?;
    match request {
      ControlRequest::Listen(listen) => self.accept_listen(&identity, session, listen).await,
      ControlRequest::Connect(connect) => {
        self
          .accept_connect(&identity, session, connect, shutdown)
          .await
      }
    }
  }

  fn authenticate(&self, session: &BoxedSession<S>) -> Result<Identity, ControlError> {
    let key = session.peer_key()?;
    match self.registry.find_by_public_key(&key) {
      Some(identity) => Ok(identity),
      None => {
        tracing::info!(fingerprint = %key.fingerprint(), "Rejecting unknown client key");
        Err(
          AuthenticationError::UnknownKey {
            fingerprint: key.fingerprint(),
          }
          .into(),
        )
      }
    }
  }

  async fn await_request(
    &self,
    session: &mut BoxedSession<S>,
    shutdown: &CancellationListener,
  ) -> Result<ControlRequest, ControlError> {
    let timeout = self.config.request_timeout;
    let read = tokio::select! {
      read = tokio::time::timeout(timeout, read_envelope(&mut *session, self.config.max_control_frame)) => read,
      _ = shutdown.cancelled() => return Err(ControlError::Cancelled),
    };
    let envelope = match read {
      Err(_elapsed) => {
        tracing::debug!(?timeout, "Client sent no request in time");
        return Err(ControlError::Timeout(timeout));
      }
      Ok(Ok(envelope)) => envelope,
      Ok(Err(JsonReadError::Read(ReadError::UnexpectedEnd { error, .. }))) => {
        return Err(ControlError::Io(error))
      }
      Ok(Err(error)) => {
        self.send_rejection(session, "malformed request").await;
        return Err(ControlError::Protocol(error.to_string()));
      }
    };
    match ControlRequest::from_envelope(envelope) {
      Ok(request) => Ok(request),
      Err(error) => {
        tracing::debug!(?error, "Undecodable control request");
        self.send_rejection(session, &error.to_string()).await;
        Err(ControlError::Protocol(error.to_string()))
      }
    }
  }

  #[tracing::instrument(level = "debug", skip_all, fields(client = identity.name(), name = %request.name))]
  async fn accept_listen(
    &self,
    identity: &Identity,
    mut session: BoxedSession<S>,
    request: ListenRequest,
  ) -> Result<ConnectionOutcome, ControlError> {
    if !self
      .registry
      .is_forward_allowed(Role::Front, identity.role())
    {
      self.send_rejection(&mut session, NOT_A_BACK_CLIENT).await;
      return Err(unauthorized(identity, NOT_A_BACK_CLIENT));
    }
    if request.name != identity.name() {
      const MISMATCH: &str = "listen name does not match client name";
      self.send_rejection(&mut session, MISMATCH).await;
      return Err(unauthorized(identity, MISMATCH));
    }
    let reservation = match self.listeners.reserve(&request.name) {
      Ok(reservation) => reservation,
      Err(RegistrationError::NameInUse(name)) => {
        self
          .send_rejection(&mut session, "a listener is already registered under this name")
          .await;
        return Err(ControlError::NameInUse(name));
      }
    };
    self.send_reply(&mut session, &ControlReply::accepted()).await?;
    let raw = self.release_session(session).await?;
    reservation.park(raw);
    tracing::info!("Listener registered");
    Ok(ConnectionOutcome::Parked { name: request.name })
  }

  #[tracing::instrument(
    level = "debug",
    skip_all,
    fields(client = identity.name(), listener = %request.back_client_name)
  )]
  async fn accept_connect(
    &self,
    identity: &Identity,
    mut session: BoxedSession<S>,
    request: ConnectRequest,
    shutdown: &CancellationListener,
  ) -> Result<ConnectionOutcome, ControlError> {
    if !self.registry.is_forward_allowed(identity.role(), Role::Back) {
      self.send_rejection(&mut session, NOT_A_FRONT_CLIENT).await;
      return Err(unauthorized(identity, NOT_A_FRONT_CLIENT));
    }
    if let Some(target) = self.registry.find_by_name(&request.back_client_name) {
      if !self
        .registry
        .is_forward_allowed(identity.role(), target.role())
      {
        let reason = format!("forwarding to {} is not allowed", target.name());
        self.send_rejection(&mut session, &reason).await;
        return Err(unauthorized(identity, &reason));
      }
    }
    let parked = match self.listeners.claim(&request.back_client_name).await {
      Ok(parked) => parked,
      Err(MatchError::NotFound(name)) => {
        self
          .send_rejection(&mut session, "no listener registered under this name")
          .await;
        return Err(ControlError::NoListener(name));
      }
    };
    self.send_reply(&mut session, &ControlReply::accepted()).await?;
    let mut front = self.release_session(session).await?;
    let (back, prefix) = parked.into_parts();
    if !prefix.is_empty() {
      // A front client that never reads must not pin this handler past shutdown
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(ControlError::Cancelled),
        written = front.write_all(&prefix) => written?,
      }
    }
    tracing::info!(
      address = %request.back_connection_address,
      "Forwarding front client to listener"
    );
    let summary = splice(front, back, shutdown.child_token()).await;
    Ok(ConnectionOutcome::Forwarded {
      target: request.back_client_name,
      summary,
    })
  }

  async fn send_reply(
    &self,
    session: &mut BoxedSession<S>,
    reply: &ControlReply,
  ) -> Result<(), ControlError> {
    tokio::time::timeout(
      self.config.request_timeout,
      write_reply(&mut *session, reply, self.config.max_control_frame),
    )
    .await
    .map_err(|_| ControlError::Timeout(self.config.request_timeout))??;
    Ok(())
  }

  /// Best-effort refusal; the connection is closed whether or not it arrives
  async fn send_rejection(&self, session: &mut BoxedSession<S>, message: &str) {
    if let Err(error) = self
      .send_reply(session, &ControlReply::rejected(message))
      .await
    {
      tracing::debug!(?error, "Failed to deliver rejection");
      return;
    }
    let _ = tokio::time::timeout(self.config.request_timeout, session.shutdown()).await;
  }

  /// Discards the session layer once the peer confirms it has done the same
  async fn release_session(&self, session: BoxedSession<S>) -> Result<S, ControlError> {
    let mut raw = session.into_raw();
    let marked = tokio::time::timeout(self.config.request_timeout, read_handoff_marker(&mut raw))
      .await
      .map_err(|_| ControlError::Timeout(self.config.request_timeout))??;
    if !marked {
      return Err(ControlError::Protocol(String::from(
        "session handoff marker missing",
      )));
    }
    Ok(raw)
  }
}

fn unauthorized(identity: &Identity, reason: &str) -> ControlError {
  ControlError::Unauthorized {
    name: identity.name().to_owned(),
    reason: reason.to_owned(),
  }
}
