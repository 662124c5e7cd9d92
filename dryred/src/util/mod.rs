// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

pub mod cancellation;
pub mod framed;
pub mod validators;

pub const SPLICE_BUFFER_CAPACITY: usize = 1024 * 32;

/// Bytes carried in each direction by a finished [splice]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceSummary {
  pub front_to_back: u64,
  pub back_to_front: u64,
}

/// Joins two duplex streams until either of them stops carrying traffic
///
/// Each direction runs as its own task. When one direction reaches end-of-stream,
/// fails, or `teardown` fires, both directions stop, their writers are shut
/// down, and both streams are dropped; a half-closed splice is never left behind.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn splice<Front, Back>(
  front: Front,
  back: Back,
  teardown: CancellationToken,
) -> SpliceSummary
where
  Front: AsyncRead + AsyncWrite + Send + 'static,
  Back: AsyncRead + AsyncWrite + Send + 'static,
{
  let (front_r, front_w) = tokio::io::split(front);
  let (back_r, back_w) = tokio::io::split(back);
  let front_to_back = tokio::task::spawn(
    copy_until_teardown(front_r, back_w, teardown.clone())
      .instrument(tracing::trace_span!("front_to_back")),
  );
  let back_to_front = tokio::task::spawn(
    copy_until_teardown(back_r, front_w, teardown.clone())
      .instrument(tracing::trace_span!("back_to_front")),
  );
  let (front_to_back, back_to_front) = futures::future::join(front_to_back, back_to_front).await;
  let summary = SpliceSummary {
    front_to_back: front_to_back.unwrap_or_default(),
    back_to_front: back_to_front.unwrap_or_default(),
  };
  tracing::debug!(
    front_to_back = summary.front_to_back,
    back_to_front = summary.back_to_front,
    "Splice closed"
  );
  summary
}

async fn copy_until_teardown<R, W>(mut reader: R, mut writer: W, teardown: CancellationToken) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; SPLICE_BUFFER_CAPACITY];
  let mut copied = 0u64;
  loop {
    let read = tokio::select! {
      biased;
      _ = teardown.cancelled() => break,
      read = reader.read(&mut buffer) => read,
    };
    let length = match read {
      Ok(0) => {
        tracing::trace!("End of stream");
        break;
      }
      Ok(length) => length,
      Err(error) => {
        tracing::debug!(?error, "Splice read failed");
        break;
      }
    };
    let written = tokio::select! {
      biased;
      _ = teardown.cancelled() => break,
      written = writer.write_all(&buffer[..length]) => written,
    };
    if let Err(error) = written {
      tracing::debug!(?error, "Splice write failed");
      break;
    }
    copied += length as u64;
  }
  // Whichever direction finishes first takes the other one down with it
  teardown.cancel();
  if let Err(error) = writer.shutdown().await {
    tracing::trace!(?error, "Splice writer shutdown failed");
  }
  copied
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  use super::splice;

  #[tokio::test]
  async fn carries_both_directions() {
    let (mut front_peer, front) = duplex(1024);
    let (back, mut back_peer) = duplex(1024);
    let splice_task = tokio::task::spawn(splice(front, back, CancellationToken::new()));

    front_peer.write_all(b"hello\n").await.unwrap();
    let mut buf = [0u8; 6];
    back_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\n");

    back_peer.write_all(b"hello\n").await.unwrap();
    front_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\n");

    drop(front_peer);
    let summary = tokio::time::timeout(Duration::from_secs(5), splice_task)
      .await
      .expect("Splice must end once a side closes")
      .unwrap();
    assert_eq!(summary.front_to_back, 6);
    assert_eq!(summary.back_to_front, 6);
  }

  #[tokio::test]
  async fn one_side_closing_closes_the_other() {
    let (front_peer, front) = duplex(1024);
    let (back, mut back_peer) = duplex(1024);
    let splice_task = tokio::task::spawn(splice(front, back, CancellationToken::new()));

    // Only the front-to-back direction sees end-of-stream; the back must still be closed
    drop(front_peer);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), back_peer.read_to_end(&mut rest))
      .await
      .expect("Back must observe the close")
      .unwrap();
    assert!(rest.is_empty());
    tokio::time::timeout(Duration::from_secs(5), splice_task)
      .await
      .expect("Splice must finish")
      .unwrap();
  }

  #[tokio::test]
  async fn back_closing_closes_the_front() {
    let (mut front_peer, front) = duplex(1024);
    let (back, mut back_peer) = duplex(1024);
    let splice_task = tokio::task::spawn(splice(front, back, CancellationToken::new()));

    back_peer.write_all(b"bye").await.unwrap();
    drop(back_peer);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), front_peer.read_to_end(&mut rest))
      .await
      .expect("Front must observe the close")
      .unwrap();
    assert_eq!(rest, b"bye");
    let summary = tokio::time::timeout(Duration::from_secs(5), splice_task)
      .await
      .expect("Splice must finish")
      .unwrap();
    assert_eq!(summary.back_to_front, 3);
    assert_eq!(summary.front_to_back, 0);
  }

  #[tokio::test]
  async fn teardown_token_stops_an_idle_splice() {
    let (mut front_peer, front) = duplex(1024);
    let (back, mut back_peer) = duplex(1024);
    let teardown = CancellationToken::new();
    let splice_task = tokio::task::spawn(splice(front, back, teardown.clone()));

    teardown.cancel();
    tokio::time::timeout(Duration::from_secs(5), splice_task)
      .await
      .expect("Splice must stop on teardown")
      .unwrap();
    let mut rest = Vec::new();
    front_peer.read_to_end(&mut rest).await.unwrap();
    back_peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }
}
