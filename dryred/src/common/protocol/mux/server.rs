// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Back-client side of the multiplexer: owns the real outbound sockets
use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::id::ConnectionIdGenerator;
use super::{
  read_request, write_reply, ConnectionId, Incoming, MuxError, MuxReply, MuxRequest, ReplyStatus,
  MAX_READ_CHUNK,
};

/// Serves multiplexer requests over one link, one at a time
///
/// Every virtual connection it opened is closed when the link ends.
#[derive(Debug, Default)]
pub struct MuxServer {
  connections: HashMap<ConnectionId, TcpStream>,
  ids: ConnectionIdGenerator,
}

impl MuxServer {
  pub fn new() -> Self {
    Default::default()
  }

  /// Number of open virtual connections
  pub fn len(&self) -> usize {
    self.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }

  #[tracing::instrument(level = "debug", skip_all, err)]
  pub async fn serve<L: AsyncRead + AsyncWrite + Unpin>(
    mut self,
    mut link: L,
  ) -> Result<(), MuxError> {
    let outcome = self.serve_link(&mut link).await;
    self.close_all().await;
    outcome
  }

  async fn serve_link<L: AsyncRead + AsyncWrite + Unpin>(
    &mut self,
    link: &mut L,
  ) -> Result<(), MuxError> {
    loop {
      let reply = match read_request(&mut *link).await? {
        Incoming::Closed => {
          tracing::debug!(open = self.len(), "Multiplexer link closed");
          return Ok(());
        }
        Incoming::Malformed(reason) => {
          tracing::debug!(%reason, "Skipping malformed multiplexer request");
          MuxReply::failed(ReplyStatus::Protocol, reason)
        }
        Incoming::Request(request) => self.dispatch(request).await,
      };
      write_reply(&mut *link, &reply).await?;
    }
  }

  pub async fn dispatch(&mut self, request: MuxRequest) -> MuxReply {
    match request {
      MuxRequest::Connect { address } => self.connect(&address).await,
      MuxRequest::Read { id, max_bytes } => self.read(id, max_bytes as usize).await,
      MuxRequest::Write { id, data } => self.write(id, &data).await,
      MuxRequest::Close { id } => self.close(id).await,
    }
  }

  async fn connect(&mut self, address: &str) -> MuxReply {
    match TcpStream::connect(address).await {
      Ok(stream) => {
        let id = self.ids.next();
        tracing::debug!(%id, address, "Opened virtual connection");
        self.connections.insert(id, stream);
        MuxReply::ok(id.inner().to_be_bytes().to_vec())
      }
      Err(error) => {
        tracing::debug!(address, ?error, "Virtual connection dial failed");
        MuxReply::failed(ReplyStatus::Io, error)
      }
    }
  }

  async fn read(&mut self, id: ConnectionId, max_bytes: usize) -> MuxReply {
    let stream = match self.connections.get_mut(&id) {
      Some(stream) => stream,
      None => return not_found(id),
    };
    let mut buffer = vec![0u8; max_bytes.min(MAX_READ_CHUNK)];
    if buffer.is_empty() {
      return MuxReply::ok(buffer);
    }
    match stream.read(&mut buffer).await {
      Ok(length) => {
        buffer.truncate(length);
        MuxReply::ok(buffer)
      }
      Err(error) => {
        self.evict(id);
        MuxReply::failed(ReplyStatus::Io, error)
      }
    }
  }

  async fn write(&mut self, id: ConnectionId, data: &[u8]) -> MuxReply {
    let stream = match self.connections.get_mut(&id) {
      Some(stream) => stream,
      None => return not_found(id),
    };
    match write_fully(stream, data).await {
      Ok(()) => MuxReply::ok((data.len() as u64).to_be_bytes().to_vec()),
      Err(error) => {
        self.evict(id);
        MuxReply::failed(ReplyStatus::Io, error)
      }
    }
  }

  async fn close(&mut self, id: ConnectionId) -> MuxReply {
    match self.connections.remove(&id) {
      Some(mut stream) => {
        // Best-effort; the socket is dropped either way
        let _ = stream.shutdown().await;
        tracing::debug!(%id, "Closed virtual connection");
        MuxReply::ok(Vec::new())
      }
      None => not_found(id),
    }
  }

  fn evict(&mut self, id: ConnectionId) {
    if self.connections.remove(&id).is_some() {
      tracing::debug!(%id, "Evicted failed virtual connection");
    }
  }

  async fn close_all(&mut self) {
    for (id, mut stream) in self.connections.drain() {
      let _ = stream.shutdown().await;
      tracing::trace!(%id, "Closed virtual connection with its link");
    }
  }
}

fn not_found(id: ConnectionId) -> MuxReply {
  MuxReply::failed(ReplyStatus::NotFound, format!("no virtual connection {}", id))
}

/// Re-issues writes until every byte is accepted; a short write is never reported as success
async fn write_fully<W: AsyncWrite + Unpin>(
  writer: &mut W,
  mut data: &[u8],
) -> std::io::Result<()> {
  while !data.is_empty() {
    let written = writer.write(data).await?;
    if written == 0 {
      return Err(std::io::ErrorKind::WriteZero.into());
    }
    data = &data[written..];
  }
  writer.flush().await
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  use super::MuxServer;
  use crate::common::protocol::mux::{ConnectionId, MuxRequest, ReplyStatus};

  fn id_of(payload: &[u8]) -> ConnectionId {
    ConnectionId::new(i64::from_be_bytes(payload.try_into().unwrap()))
  }

  #[tokio::test]
  async fn unknown_ids_are_not_found() {
    let mut server = MuxServer::new();
    for request in [
      MuxRequest::Read {
        id: ConnectionId::new(0),
        max_bytes: 16,
      },
      MuxRequest::Write {
        id: ConnectionId::new(0),
        data: b"x".to_vec(),
      },
      MuxRequest::Close {
        id: ConnectionId::new(0),
      },
    ] {
      assert_eq!(server.dispatch(request).await.status, ReplyStatus::NotFound);
    }
    assert!(server.is_empty());
  }

  #[tokio::test]
  async fn failed_dial_consumes_no_id() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let refused_address = unused.local_addr().unwrap().to_string();
    drop(unused);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let mut server = MuxServer::new();
    let refused = server
      .dispatch(MuxRequest::Connect {
        address: refused_address,
      })
      .await;
    assert_eq!(refused.status, ReplyStatus::Io);
    assert!(server.is_empty());

    let opened = server.dispatch(MuxRequest::Connect { address }).await;
    assert_eq!(opened.status, ReplyStatus::Ok);
    assert_eq!(id_of(&opened.payload), ConnectionId::new(0));
    assert_eq!(server.len(), 1);
  }

  #[tokio::test]
  async fn write_read_close_against_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let echo = tokio::task::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut received = vec![0u8; 200_000];
      socket.read_exact(&mut received).await.unwrap();
      socket.write_all(b"done").await.unwrap();
      let mut rest = Vec::new();
      socket.read_to_end(&mut rest).await.unwrap();
      received
    });

    let mut server = MuxServer::new();
    let id = id_of(&server.dispatch(MuxRequest::Connect { address }).await.payload);

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let written = server
      .dispatch(MuxRequest::Write {
        id,
        data: data.clone(),
      })
      .await;
    assert_eq!(written.status, ReplyStatus::Ok);
    assert_eq!(written.payload, (data.len() as u64).to_be_bytes());

    // A zero-length read completes immediately, whatever the socket holds
    let empty = tokio::time::timeout(
      Duration::from_secs(1),
      server.dispatch(MuxRequest::Read { id, max_bytes: 0 }),
    )
    .await
    .unwrap();
    assert_eq!(empty.status, ReplyStatus::Ok);
    assert!(empty.payload.is_empty());

    let mut reply = Vec::new();
    while reply.len() < 4 {
      let read = server
        .dispatch(MuxRequest::Read {
          id,
          max_bytes: 1024,
        })
        .await;
      assert_eq!(read.status, ReplyStatus::Ok);
      reply.extend_from_slice(&read.payload);
    }
    assert_eq!(reply, b"done");

    let closed = server.dispatch(MuxRequest::Close { id }).await;
    assert_eq!(closed.status, ReplyStatus::Ok);
    assert!(server.is_empty());
    assert_eq!(
      server.dispatch(MuxRequest::Close { id }).await.status,
      ReplyStatus::NotFound
    );
    assert_eq!(echo.await.unwrap(), data);
  }
}
