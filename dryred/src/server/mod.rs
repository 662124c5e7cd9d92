// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The broker: accepts client connections and runs each through the control engine
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::authentication::TransportSecurity;
use crate::common::clients::ClientRegistry;
use crate::common::protocol::control::MAX_CONTROL_FRAME_LENGTH;
use crate::util::cancellation::CancellationListener;

pub mod control;
pub mod matching;

use control::{ConnectionOutcome, ControlEngine};
use matching::MatchingRegistry;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
  /// Bounds the handshake, the wait for the single control request, and the session handoff
  pub request_timeout: Duration,
  pub max_control_frame: usize,
  /// Bytes a parked back client may send before it is claimed; beyond this it is not read
  pub parked_prefix_limit: usize,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(5),
      max_control_frame: MAX_CONTROL_FRAME_LENGTH,
      parked_prefix_limit: 64 * 1024,
    }
  }
}

pub struct Broker<T> {
  engine: Arc<ControlEngine<TcpStream, T>>,
  shutdown: CancellationToken,
}

impl<T> Broker<T>
where
  T: TransportSecurity<TcpStream> + 'static,
{
  pub fn new(config: BrokerConfig, registry: Arc<dyn ClientRegistry>, transport: T) -> Self {
    let shutdown = CancellationToken::new();
    let listeners = Arc::new(MatchingRegistry::new(
      config.parked_prefix_limit,
      shutdown.child_token(),
    ));
    Self {
      engine: Arc::new(ControlEngine::new(config, registry, transport, listeners)),
      shutdown,
    }
  }

  /// Binds `listen_address` and serves until the returned handle is stopped
  pub async fn start<A: ToSocketAddrs>(self, listen_address: A) -> std::io::Result<BrokerHandle> {
    let listener = TcpListener::bind(listen_address).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Broker listening");
    let listeners = Arc::clone(self.engine.listeners());
    let task = tokio::task::spawn(
      accept_loop(listener, self.engine, self.shutdown.clone())
        .instrument(tracing::info_span!("broker", %local_addr)),
    );
    Ok(BrokerHandle {
      local_addr,
      shutdown: self.shutdown,
      listeners,
      task,
    })
  }
}

/// A running broker
pub struct BrokerHandle {
  local_addr: SocketAddr,
  shutdown: CancellationToken,
  listeners: Arc<MatchingRegistry<TcpStream>>,
  task: JoinHandle<()>,
}

impl BrokerHandle {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn listeners(&self) -> &Arc<MatchingRegistry<TcpStream>> {
    &self.listeners
  }

  /// Stops accepting, then closes every parked, pending, and spliced connection
  pub async fn stop(self) {
    tracing::info!(local_addr = %self.local_addr, "Stopping broker");
    self.shutdown.cancel();
    if let Err(error) = self.task.await {
      tracing::error!(?error, "Broker accept loop panicked");
    }
  }
}

async fn accept_loop<T>(
  listener: TcpListener,
  engine: Arc<ControlEngine<TcpStream, T>>,
  shutdown: CancellationToken,
) where
  T: TransportSecurity<TcpStream> + 'static,
{
  let mut incoming = TcpListenerStream::new(listener)
    .take_until({
      let shutdown = shutdown.clone();
      async move { shutdown.cancelled().await }
    })
    .boxed();
  while let Some(accepted) = incoming.next().await {
    let stream = match accepted {
      Ok(stream) => stream,
      Err(error) => {
        // Typically descriptor exhaustion; back off instead of spinning on it
        tracing::warn!(?error, "Failed to accept connection");
        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
        continue;
      }
    };
    let peer_addr = stream
      .peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_default();
    let engine = Arc::clone(&engine);
    let listener = CancellationListener::from(shutdown.child_token());
    tokio::task::spawn(
      async move {
        match engine.handle_connection(stream, &listener).await {
          Ok(ConnectionOutcome::Parked { .. }) => {}
          Ok(ConnectionOutcome::Forwarded { target, summary }) => tracing::info!(
            listener = %target,
            front_to_back = summary.front_to_back,
            back_to_front = summary.back_to_front,
            "Forwarded connection closed"
          ),
          Err(error) => tracing::info!(kind = ?error.kind(), %error, "Connection refused"),
        }
      }
      .instrument(tracing::debug_span!("connection", peer = %peer_addr)),
    );
  }
  tracing::info!("Broker stopped accepting connections");
}
