// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Front-client side of the multiplexer
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use super::{
  read_reply, write_request, ConnectionId, MuxError, MuxRequest, ReplyStatus, MAX_MUX_PAYLOAD,
  MAX_READ_CHUNK,
};

/// Issues multiplexer requests over a shared link
///
/// The link carries one request/reply pair at a time; concurrent callers
/// queue on the link lock, so a `read` blocked on a quiet remote socket
/// holds up every other virtual connection on the same link.
///
/// A call abandoned between its request and its reply (a dropped future,
/// such as a timed-out `read`) leaves that reply unread on the link. The
/// link is then unusable, and every later call fails with
/// [MuxError::LinkClosed].
pub struct MuxClient<L> {
  link: SharedLink<L>,
}

type SharedLink<L> = Arc<Mutex<Link<L>>>;

struct Link<L> {
  stream: L,
  // Set while a request awaits its reply; still set afterwards if the call never finished
  desynchronized: bool,
}

impl<L> Clone for MuxClient<L> {
  fn clone(&self) -> Self {
    Self {
      link: Arc::clone(&self.link),
    }
  }
}

impl<L> MuxClient<L>
where
  L: AsyncRead + AsyncWrite + Unpin + Send,
{
  pub fn new(link: L) -> Self {
    Self {
      link: Arc::new(Mutex::new(Link {
        stream: link,
        desynchronized: false,
      })),
    }
  }

  /// Asks the remote side to dial `address`, yielding a handle to the new connection
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn connect(&self, address: &str) -> Result<VirtualConnection<L>, MuxError> {
    let payload = call(
      &self.link,
      &MuxRequest::Connect {
        address: address.to_owned(),
      },
    )
    .await?;
    let id = <[u8; 8]>::try_from(payload.as_slice())
      .map(|bytes| ConnectionId::new(i64::from_be_bytes(bytes)))
      .map_err(|_| MuxError::Protocol(format!("connect reply of {} bytes", payload.len())))?;
    tracing::debug!(%id, "Virtual connection opened");
    Ok(VirtualConnection {
      id,
      link: Arc::clone(&self.link),
    })
  }
}

/// One remote socket reached through a [MuxClient]
pub struct VirtualConnection<L> {
  id: ConnectionId,
  link: SharedLink<L>,
}

impl<L> std::fmt::Debug for VirtualConnection<L> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("VirtualConnection")
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

impl<L> VirtualConnection<L>
where
  L: AsyncRead + AsyncWrite + Unpin + Send,
{
  pub fn id(&self) -> ConnectionId {
    self.id
  }

  /// Reads at most `buffer.len()` bytes; `Ok(0)` from a non-empty buffer means end-of-stream
  pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, MuxError> {
    if buffer.is_empty() {
      return Ok(0);
    }
    let max_bytes = buffer.len().min(MAX_READ_CHUNK);
    let payload = call(
      &self.link,
      &MuxRequest::Read {
        id: self.id,
        max_bytes: max_bytes as u32,
      },
    )
    .await?;
    if payload.len() > max_bytes {
      return Err(MuxError::Protocol(format!(
        "read reply of {} bytes for a {} byte request",
        payload.len(),
        max_bytes
      )));
    }
    buffer[..payload.len()].copy_from_slice(&payload);
    Ok(payload.len())
  }

  /// Writes all of `data`, or fails; never reports a partial write
  pub async fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
    for chunk in data.chunks(MAX_MUX_PAYLOAD) {
      let payload = call(
        &self.link,
        &MuxRequest::Write {
          id: self.id,
          data: chunk.to_vec(),
        },
      )
      .await?;
      let written = <[u8; 8]>::try_from(payload.as_slice())
        .map(u64::from_be_bytes)
        .map_err(|_| MuxError::Protocol(format!("write reply of {} bytes", payload.len())))?;
      if written != chunk.len() as u64 {
        return Err(MuxError::Protocol(format!(
          "remote acknowledged {} of {} bytes",
          written,
          chunk.len()
        )));
      }
    }
    Ok(data.len())
  }

  pub async fn close(self) -> Result<(), MuxError> {
    call(&self.link, &MuxRequest::Close { id: self.id }).await?;
    tracing::debug!(id = %self.id, "Virtual connection closed");
    Ok(())
  }
}

async fn call<L>(link: &SharedLink<L>, request: &MuxRequest) -> Result<Vec<u8>, MuxError>
where
  L: AsyncRead + AsyncWrite + Unpin + Send,
{
  let reply = {
    let mut link = link.lock().await;
    if link.desynchronized {
      return Err(MuxError::LinkClosed);
    }
    link.desynchronized = true;
    write_request(&mut link.stream, request).await?;
    let reply = read_reply(&mut link.stream).await?;
    link.desynchronized = false;
    reply
  };
  if reply.status == ReplyStatus::Ok {
    return Ok(reply.payload);
  }
  let message = String::from_utf8_lossy(&reply.payload).into_owned();
  Err(match reply.status {
    ReplyStatus::NotFound => MuxError::NotFound(message),
    ReplyStatus::Io => MuxError::RemoteIo(message),
    ReplyStatus::Ok | ReplyStatus::Protocol => MuxError::Protocol(message),
  })
}
