// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames, used by both the control exchange and the multiplexer wire
//!
//! A frame is a big-endian `u32` length followed by exactly that many bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] ::serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  #[error("Frame of {produced} bytes cannot be described by a u32 length")]
  TooLong { produced: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] ::serde_json::Error),
  /// Returned before anything is written to the stream.
  ///
  /// Will never occur when a maximum length of `None` is provided.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

/// Writes a single frame; does not flush, so callers batching several frames pay for one flush
pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::TooLong {
    produced: buffer.len(),
  })?;
  s.write_u32(length).await?;
  Ok(s.write_all(buffer).await?)
}

pub async fn read_framed_json<
  TStream: AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError> {
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

/// Serializes `value` as a single frame and flushes the stream
pub async fn write_framed_json<TStream: AsyncWrite + Unpin, TInput: serde::Serialize>(
  mut s: TStream,
  value: TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError> {
  let buffer = serde_json::to_vec(&value)?;
  if let Some(max_length) = max_length {
    if buffer.len() + LENGTH_PREFIX_SIZE > max_length {
      return Err(JsonWriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len() + LENGTH_PREFIX_SIZE,
      });
    }
  }
  write_frame(&mut s, &buffer).await?;
  s.flush().await.map_err(WriteError::from)?;
  Ok(())
}
