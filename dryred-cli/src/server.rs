// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use dryred::{
  common::{
    authentication::tls::{Credentials, TlsTransport},
    clients::{ClientRegistry, StaticClientRegistry},
  },
  server::{Broker, BrokerConfig},
};
use std::{path::PathBuf, sync::Arc, time::Duration};

/// Parameters used to run a broker
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub cert: PathBuf,
  pub key: PathBuf,
  pub clients: PathBuf,
  pub bind_addr: String,
  pub request_timeout: Duration,
}

#[tracing::instrument(
  skip(config),
  fields(bind = %config.bind_addr),
  err
)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let credentials = Credentials::from_pem_files(&config.cert, &config.key)
    .context("Broker credentials must load")?;
  let broker_key = credentials
    .public_key()
    .context("Broker certificate must carry a public key")?;
  tracing::info!(
    fingerprint = %broker_key.fingerprint(),
    public_key = %broker_key.to_base64(),
    "Loaded broker credentials"
  );

  let clients = StaticClientRegistry::from_json_file(&config.clients)
    .context("Client list must load")?;
  tracing::info!(count = clients.len(), "Loaded client registry");
  let registry: Arc<dyn ClientRegistry> = Arc::new(clients);

  let transport = TlsTransport::new(credentials, Arc::clone(&registry))?;
  let broker_config = BrokerConfig {
    request_timeout: config.request_timeout,
    ..BrokerConfig::default()
  };
  let handle = Broker::new(broker_config, registry, transport)
    .start(config.bind_addr.as_str())
    .await
    .context("Broker must bind its listen address")?;

  let _ = tokio::signal::ctrl_c().await;
  tracing::trace!("SIGINT detected, initiating graceful shutdown");
  handle.stop().await;
  Ok(())
}
