// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Peer side of the control exchange, used by back and front clients
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::common::authentication::{AuthenticationError, PeerTransport};
use crate::common::protocol::control::{
  read_reply, write_envelope, write_handoff_marker, ConnectRequest, ControlRequest, ListenRequest,
  MAX_CONTROL_FRAME_LENGTH,
};
use crate::common::protocol::mux::client::{MuxClient, VirtualConnection};
use crate::common::protocol::mux::MuxError;
use crate::util::framed::{JsonReadError, JsonWriteError};

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
  #[error("Failed to reach the broker: {0}")]
  Dial(#[source] std::io::Error),
  #[error("Secure session with the broker failed: {0}")]
  Handshake(#[from] AuthenticationError),
  #[error("Control request could not be sent: {0}")]
  Request(#[from] JsonWriteError),
  #[error("Control reply could not be read: {0}")]
  Reply(#[from] JsonReadError),
  #[error("Broker refused the request: {0}")]
  Refused(String),
  #[error("Session handoff failed: {0}")]
  Handoff(#[source] std::io::Error),
  #[error("Multiplexer failure: {0}")]
  Mux(#[from] MuxError),
}

/// Runs one control exchange over `raw`, returning the raw stream once the broker accepts
///
/// On acceptance the session layer is discarded and everything written to the
/// returned stream is relayed verbatim.
#[tracing::instrument(level = "debug", skip(transport, raw), fields(kind = request.kind()), err)]
pub async fn negotiate<S, T>(transport: &T, raw: S, request: ControlRequest) -> Result<S, PeerError>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  T: PeerTransport<S> + ?Sized,
{
  let mut session = transport.connect(raw).await?;
  let envelope = request
    .into_envelope()
    .map_err(|e| PeerError::Request(e.into()))?;
  write_envelope(&mut session, &envelope, MAX_CONTROL_FRAME_LENGTH).await?;
  let reply = read_reply(&mut session, MAX_CONTROL_FRAME_LENGTH).await?;
  if !reply.status {
    return Err(PeerError::Refused(reply.error_message));
  }
  let mut raw = session.into_raw();
  write_handoff_marker(&mut raw)
    .await
    .map_err(PeerError::Handoff)?;
  Ok(raw)
}

/// Dials a broker over TCP and runs control exchanges on behalf of one client identity
pub struct PeerConnector<T> {
  transport: T,
}

impl<T> PeerConnector<T>
where
  T: PeerTransport<TcpStream>,
{
  pub fn new(transport: T) -> Self {
    Self { transport }
  }

  async fn dial<A: ToSocketAddrs>(&self, broker: A) -> Result<TcpStream, PeerError> {
    let stream = TcpStream::connect(broker).await.map_err(PeerError::Dial)?;
    stream.set_nodelay(true).map_err(PeerError::Dial)?;
    Ok(stream)
  }

  /// Parks this client at the broker under `name`
  ///
  /// Resolves once the broker has accepted; the returned stream then waits,
  /// idle, until a front client is joined to it.
  pub async fn listen_via<A: ToSocketAddrs>(
    &self,
    broker: A,
    name: &str,
  ) -> Result<TcpStream, PeerError> {
    let raw = self.dial(broker).await?;
    let request = ControlRequest::Listen(ListenRequest {
      name: name.to_owned(),
    });
    negotiate(&self.transport, raw, request).await
  }

  /// Joins this client to the back client `back_name`
  pub async fn connect_via<A: ToSocketAddrs>(
    &self,
    broker: A,
    back_name: &str,
    back_address: &str,
  ) -> Result<TcpStream, PeerError> {
    let raw = self.dial(broker).await?;
    let request = ControlRequest::Connect(ConnectRequest {
      back_client_name: back_name.to_owned(),
      back_connection_address: back_address.to_owned(),
    });
    negotiate(&self.transport, raw, request).await
  }

  /// Joins `back_name` and opens a virtual connection from it to `back_address`
  pub async fn connect_virtual<A: ToSocketAddrs>(
    &self,
    broker: A,
    back_name: &str,
    back_address: &str,
  ) -> Result<(MuxClient<TcpStream>, VirtualConnection<TcpStream>), PeerError> {
    let link = self.connect_via(broker, back_name, back_address).await?;
    let client = MuxClient::new(link);
    let connection = client.connect(back_address).await?;
    Ok((client, connection))
  }
}
