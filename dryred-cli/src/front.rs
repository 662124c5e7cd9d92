// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::PeerArgs;
use anyhow::{Context as AnyhowContext, Result};
use dryred::{
  client::PeerConnector,
  common::{
    authentication::tls::{Credentials, TlsPeerTransport},
    protocol::mux::MAX_READ_CHUNK,
  },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Parameters used to run a front client
#[derive(Clone, Debug)]
pub struct FrontArgs {
  pub peer: PeerArgs,
  pub back_name: String,
  /// Address dialed by the back client on the front's behalf
  pub target: String,
}

/// Sends stdin to `target` through the back client, then prints the reply until the remote closes
#[tracing::instrument(skip(config), fields(back = %config.back_name, target = %config.target), err)]
pub async fn front_main(config: FrontArgs) -> Result<()> {
  let credentials = Credentials::from_pem_files(&config.peer.cert, &config.peer.key)
    .context("Client credentials must load")?;
  let transport = TlsPeerTransport::new(credentials, config.peer.broker_key.clone())?;
  let connector = PeerConnector::new(transport);

  let (_client, connection) = connector
    .connect_virtual(
      config.peer.broker.as_str(),
      &config.back_name,
      &config.target,
    )
    .await?;
  tracing::info!(id = %connection.id(), "Virtual connection open");

  let mut request = Vec::new();
  tokio::io::stdin()
    .read_to_end(&mut request)
    .await
    .context("Reading stdin")?;
  connection.write(&request).await?;

  let mut stdout = tokio::io::stdout();
  let mut buffer = vec![0u8; MAX_READ_CHUNK];
  let mut received = 0usize;
  loop {
    let read = connection.read(&mut buffer).await?;
    if read == 0 {
      break;
    }
    received += read;
    stdout.write_all(&buffer[..read]).await?;
  }
  stdout.flush().await?;
  tracing::debug!(sent = request.len(), received, "Remote closed");
  connection.close().await?;
  Ok(())
}
