// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Virtual connections multiplexed over one relayed stream
//!
//! Once a front and back client are spliced, the front drives the back's
//! outbound sockets with strictly sequential request/reply pairs.
//!
//! Request: `opcode: u8`, `connection: i64 BE`, then one length-prefixed payload.
//! Reply: `status: u8`, then one length-prefixed payload.
//!
//! | opcode      | request payload        | `Ok` reply payload      |
//! |-------------|------------------------|-------------------------|
//! | 1 `Connect` | UTF-8 `host:port`      | new id, `i64 BE`        |
//! | 2 `Read`    | max bytes, `u32 BE`    | data read (empty = EOF) |
//! | 3 `Write`   | data                   | bytes written, `u64 BE` |
//! | 4 `Close`   | empty                  | empty                   |
//!
//! Non-`Ok` replies carry a UTF-8 description of the failure.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::framed::{self, read_frame, write_frame};

pub mod client;
pub mod id;
pub mod server;

pub use id::ConnectionId;

/// Upper bound on any single request or reply payload
pub const MAX_MUX_PAYLOAD: usize = 1024 * 1024;

/// Upper bound on the data returned by one `Read`
pub const MAX_READ_CHUNK: usize = 32 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
  Connect = 1,
  Read = 2,
  Write = 3,
  Close = 4,
}

impl TryFrom<u8> for Opcode {
  type Error = u8;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      1 => Ok(Opcode::Connect),
      2 => Ok(Opcode::Read),
      3 => Ok(Opcode::Write),
      4 => Ok(Opcode::Close),
      other => Err(other),
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
  Ok = 0,
  NotFound = 1,
  Io = 2,
  Protocol = 3,
}

impl TryFrom<u8> for ReplyStatus {
  type Error = u8;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(ReplyStatus::Ok),
      1 => Ok(ReplyStatus::NotFound),
      2 => Ok(ReplyStatus::Io),
      3 => Ok(ReplyStatus::Protocol),
      other => Err(other),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MuxRequest {
  Connect { address: String },
  Read { id: ConnectionId, max_bytes: u32 },
  Write { id: ConnectionId, data: Vec<u8> },
  Close { id: ConnectionId },
}

impl MuxRequest {
  pub fn opcode(&self) -> Opcode {
    match self {
      MuxRequest::Connect { .. } => Opcode::Connect,
      MuxRequest::Read { .. } => Opcode::Read,
      MuxRequest::Write { .. } => Opcode::Write,
      MuxRequest::Close { .. } => Opcode::Close,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxReply {
  pub status: ReplyStatus,
  pub payload: Vec<u8>,
}

impl MuxReply {
  pub fn ok(payload: Vec<u8>) -> Self {
    Self {
      status: ReplyStatus::Ok,
      payload,
    }
  }

  pub fn failed(status: ReplyStatus, message: impl std::fmt::Display) -> Self {
    Self {
      status,
      payload: message.to_string().into_bytes(),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum MuxError {
  #[error("Virtual connection not found: {0}")]
  NotFound(String),
  #[error("Remote I/O failure: {0}")]
  RemoteIo(String),
  #[error("Multiplexer protocol violation: {0}")]
  Protocol(String),
  #[error("Multiplexer link closed")]
  LinkClosed,
  #[error("Multiplexer link failure: {0}")]
  Link(#[from] std::io::Error),
  #[error("Multiplexer link framing failure: {0}")]
  Framing(#[from] framed::ReadError),
  #[error("Multiplexer link write failure: {0}")]
  Write(#[from] framed::WriteError),
}

/// One request as read off the link
#[derive(Debug)]
pub enum Incoming {
  Request(MuxRequest),
  /// A well-framed request this side cannot interpret; the link stays usable
  Malformed(String),
  /// The link ended cleanly between requests
  Closed,
}

pub async fn write_request<L: AsyncWrite + Unpin>(
  mut link: L,
  request: &MuxRequest,
) -> Result<(), MuxError> {
  let max_bytes;
  let (id, payload): (ConnectionId, &[u8]) = match request {
    MuxRequest::Connect { address } => (ConnectionId::new(0), address.as_bytes()),
    MuxRequest::Read { id, max_bytes: max } => {
      max_bytes = max.to_be_bytes();
      (*id, &max_bytes[..])
    }
    MuxRequest::Write { id, data } => (*id, data.as_slice()),
    MuxRequest::Close { id } => (*id, &[][..]),
  };
  if payload.len() > MAX_MUX_PAYLOAD {
    return Err(MuxError::Protocol(format!(
      "request payload of {} bytes exceeds the {} byte limit",
      payload.len(),
      MAX_MUX_PAYLOAD
    )));
  }
  link.write_u8(request.opcode() as u8).await?;
  link.write_i64(id.inner()).await?;
  write_frame(&mut link, payload).await?;
  link.flush().await?;
  Ok(())
}

pub async fn read_request<L: AsyncRead + Unpin>(mut link: L) -> Result<Incoming, MuxError> {
  let mut opcode = [0u8; 1];
  if link.read(&mut opcode).await? == 0 {
    return Ok(Incoming::Closed);
  }
  let id = ConnectionId::new(link.read_i64().await?);
  let payload = read_frame(&mut link, Some(MAX_MUX_PAYLOAD)).await?;
  let opcode = match Opcode::try_from(opcode[0]) {
    Ok(opcode) => opcode,
    Err(unknown) => return Ok(Incoming::Malformed(format!("unknown opcode {}", unknown))),
  };
  let request = match opcode {
    Opcode::Connect => match String::from_utf8(payload) {
      Ok(address) => MuxRequest::Connect { address },
      Err(_) => return Ok(Incoming::Malformed("connect address is not UTF-8".into())),
    },
    Opcode::Read => match <[u8; 4]>::try_from(payload.as_slice()) {
      Ok(max_bytes) => MuxRequest::Read {
        id,
        max_bytes: u32::from_be_bytes(max_bytes),
      },
      Err(_) => return Ok(Incoming::Malformed("read size must be a u32".into())),
    },
    Opcode::Write => MuxRequest::Write { id, data: payload },
    Opcode::Close => MuxRequest::Close { id },
  };
  Ok(Incoming::Request(request))
}

pub async fn write_reply<L: AsyncWrite + Unpin>(
  mut link: L,
  reply: &MuxReply,
) -> Result<(), MuxError> {
  link.write_u8(reply.status as u8).await?;
  write_frame(&mut link, &reply.payload).await?;
  link.flush().await?;
  Ok(())
}

pub async fn read_reply<L: AsyncRead + Unpin>(mut link: L) -> Result<MuxReply, MuxError> {
  let mut status = [0u8; 1];
  if link.read(&mut status).await? == 0 {
    return Err(MuxError::LinkClosed);
  }
  let status = ReplyStatus::try_from(status[0])
    .map_err(|unknown| MuxError::Protocol(format!("unknown reply status {}", unknown)))?;
  let payload = read_frame(&mut link, Some(MAX_MUX_PAYLOAD)).await?;
  Ok(MuxReply { status, payload })
}
