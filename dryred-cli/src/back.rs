// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::PeerArgs;
use anyhow::{Context as AnyhowContext, Result};
use dryred::{
  client::PeerConnector,
  common::{
    authentication::tls::{Credentials, TlsPeerTransport},
    protocol::mux::server::MuxServer,
  },
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Parameters used to run a back client
#[derive(Clone, Debug)]
pub struct BackArgs {
  pub peer: PeerArgs,
  pub name: String,
}

/// Parks at the broker, serves one front client, then parks again until interrupted
#[tracing::instrument(skip(config), fields(name = %config.name, broker = %config.peer.broker), err)]
pub async fn back_main(config: BackArgs) -> Result<()> {
  let credentials = Credentials::from_pem_files(&config.peer.cert, &config.peer.key)
    .context("Client credentials must load")?;
  let transport = TlsPeerTransport::new(credentials, config.peer.broker_key.clone())?;
  let connector = PeerConnector::new(transport);

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  while !shutdown.is_cancelled() {
    let session = async {
      let link = connector
        .listen_via(config.peer.broker.as_str(), &config.name)
        .await?;
      tracing::info!("Parked at broker; waiting for a front client");
      MuxServer::new().serve(link).await?;
      tracing::info!("Front client session ended");
      Result::<(), anyhow::Error>::Ok(())
    };
    tokio::select! {
      _ = shutdown.cancelled() => break,
      res = session => if let Err(err) = res {
        tracing::warn!(err = ?err, "Broker session failed; reconnecting");
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = tokio::time::sleep(RECONNECT_DELAY) => {},
        }
      },
    }
  }

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}
