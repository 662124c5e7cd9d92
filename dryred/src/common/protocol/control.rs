// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Control messages exchanged inside the secure session
//!
//! Each connection carries exactly one request and one reply, as length-prefixed
//! JSON frames. A request is an envelope `{"kind": ..., "payload": ...}`; the
//! payload is only interpreted once the kind is known.
//!
//! After an accepted reply the peer discards its session layer and sends
//! [SESSION_HANDOFF_MARKER] in the clear, so the broker knows exactly where
//! session bytes end and relayed bytes begin.
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::framed::{read_framed_json, write_framed_json, JsonReadError, JsonWriteError};

pub const LISTEN_REQUEST_KIND: &str = "listen";
pub const CONNECT_REQUEST_KIND: &str = "connect";

pub const MAX_CONTROL_FRAME_LENGTH: usize = 64 * 1024;

pub const SESSION_HANDOFF_MARKER: &[u8; 4] = b"DRRW";

/// Sent by a back client to park itself under `name`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenRequest {
  pub name: String,
}

/// Sent by a front client to be joined to the back client `back_client_name`
///
/// `back_connection_address` is what the front will ask the back to dial once joined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
  pub back_client_name: String,
  pub back_connection_address: String,
}

/// Answer to either request kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
  pub status: bool,
  #[serde(default)]
  pub error_message: String,
}

impl ControlReply {
  pub fn accepted() -> Self {
    Self {
      status: true,
      error_message: String::new(),
    }
  }

  pub fn rejected(error_message: impl Into<String>) -> Self {
    Self {
      status: false,
      error_message: error_message.into(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
  pub kind: String,
  #[serde(default)]
  pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
  Listen(ListenRequest),
  Connect(ConnectRequest),
}

#[derive(thiserror::Error, Debug)]
pub enum ControlDecodeError {
  #[error("unknown request")]
  UnknownKind(String),
  #[error("malformed {kind} request: {source}")]
  MalformedPayload {
    kind: &'static str,
    #[source]
    source: serde_json::Error,
  },
}

impl ControlRequest {
  pub fn kind(&self) -> &'static str {
    match self {
      ControlRequest::Listen(_) => LISTEN_REQUEST_KIND,
      ControlRequest::Connect(_) => CONNECT_REQUEST_KIND,
    }
  }

  pub fn into_envelope(self) -> Result<ControlEnvelope, serde_json::Error> {
    let kind = self.kind().to_owned();
    let payload = match self {
      ControlRequest::Listen(listen) => serde_json::to_value(listen)?,
      ControlRequest::Connect(connect) => serde_json::to_value(connect)?,
    };
    Ok(ControlEnvelope { kind, payload })
  }

  pub fn from_envelope(envelope: ControlEnvelope) -> Result<Self, ControlDecodeError> {
    fn payload<T: serde::de::DeserializeOwned>(
      kind: &'static str,
      payload: serde_json::Value,
    ) -> Result<T, ControlDecodeError> {
      serde_json::from_value(payload)
        .map_err(|source| ControlDecodeError::MalformedPayload { kind, source })
    }
    match envelope.kind.as_str() {
      LISTEN_REQUEST_KIND => Ok(ControlRequest::Listen(payload(
        LISTEN_REQUEST_KIND,
        envelope.payload,
      )?)),
      CONNECT_REQUEST_KIND => Ok(ControlRequest::Connect(payload(
        CONNECT_REQUEST_KIND,
        envelope.payload,
      )?)),
      _ => Err(ControlDecodeError::UnknownKind(envelope.kind)),
    }
  }
}

pub async fn read_envelope<S: AsyncRead + Unpin>(
  stream: S,
  max_length: usize,
) -> Result<ControlEnvelope, JsonReadError> {
  read_framed_json(stream, Some(max_length)).await
}

pub async fn write_envelope<S: AsyncWrite + Unpin>(
  stream: S,
  envelope: &ControlEnvelope,
  max_length: usize,
) -> Result<(), JsonWriteError> {
  write_framed_json(stream, envelope, Some(max_length)).await
}

pub async fn read_reply<S: AsyncRead + Unpin>(
  stream: S,
  max_length: usize,
) -> Result<ControlReply, JsonReadError> {
  read_framed_json(stream, Some(max_length)).await
}

pub async fn write_reply<S: AsyncWrite + Unpin>(
  stream: S,
  reply: &ControlReply,
  max_length: usize,
) -> Result<(), JsonWriteError> {
  write_framed_json(stream, reply, Some(max_length)).await
}

pub async fn write_handoff_marker<S: AsyncWrite + Unpin>(mut raw: S) -> std::io::Result<()> {
  raw.write_all(SESSION_HANDOFF_MARKER).await?;
  raw.flush().await
}

/// Reads the handoff marker; `Ok(false)` means the peer sent something else
pub async fn read_handoff_marker<S: AsyncRead + Unpin>(mut raw: S) -> std::io::Result<bool> {
  let mut marker = [0u8; SESSION_HANDOFF_MARKER.len()];
  raw.read_exact(&mut marker).await?;
  Ok(&marker == SESSION_HANDOFF_MARKER)
}
