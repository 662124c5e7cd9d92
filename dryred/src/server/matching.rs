// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Parked back-client streams, keyed by client name
//!
//! A name moves through `Reserved` (Listen accepted, reply in flight) and
//! `Parked` (raw stream waiting for a front client). A parked stream is owned
//! by a watcher task which hands it to the first claimant, or evicts the name
//! as soon as the back client disconnects.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

type ClaimReply<S> = oneshot::Sender<ParkedListener<S>>;

enum Slot<S> {
  Reserved {
    registration: u64,
  },
  Parked {
    registration: u64,
    claim: oneshot::Sender<ClaimReply<S>>,
  },
}

impl<S> Slot<S> {
  fn registration(&self) -> u64 {
    match self {
      Slot::Reserved { registration } | Slot::Parked { registration, .. } => *registration,
    }
  }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("A listener is already registered as {0:?}")]
  NameInUse(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MatchError {
  #[error("No listener registered as {0:?}")]
  NotFound(String),
}

/// A back client's stream as handed to a front client
///
/// `prefix` holds bytes the back client sent while parked; they must reach
/// the front before anything else read from `stream`. A listener that sends
/// more than the registry's prefix limit while parked is evicted.
#[derive(Debug)]
pub struct ParkedListener<S> {
  pub stream: S,
  pub prefix: Vec<u8>,
}

impl<S> ParkedListener<S> {
  pub fn into_parts(self) -> (S, Vec<u8>) {
    (self.stream, self.prefix)
  }
}

pub struct MatchingRegistry<S> {
  slots: Mutex<HashMap<String, Slot<S>>>,
  next_registration: AtomicU64,
  prefix_limit: usize,
  shutdown: CancellationToken,
}

impl<S> std::fmt::Debug for MatchingRegistry<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MatchingRegistry")
      .field("slots", &self.len())
      .field("prefix_limit", &self.prefix_limit)
      .finish_non_exhaustive()
  }
}

impl<S> MatchingRegistry<S> {
  /// Parked streams are released when `shutdown` fires
  pub fn new(prefix_limit: usize, shutdown: CancellationToken) -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      next_registration: AtomicU64::new(0),
      prefix_limit,
      shutdown,
    }
  }

  fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<S>>> {
    // Critical sections never panic midway, so a poisoned map is still consistent
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Reserved or parked names
  pub fn len(&self) -> usize {
    self.slots().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, name: &str) -> bool {
    self.slots().contains_key(name)
  }

  /// Whether a stream is parked under `name` and ready to be claimed
  pub fn is_parked(&self, name: &str) -> bool {
    matches!(self.slots().get(name), Some(Slot::Parked { .. }))
  }

  /// Removes `name` only if it still belongs to `registration`
  fn evict(&self, name: &str, registration: u64) -> bool {
    let mut slots = self.slots();
    match slots.get(name) {
      Some(slot) if slot.registration() == registration => {
        slots.remove(name);
        true
      }
      _ => false,
    }
  }
}

impl<S> MatchingRegistry<S>
where
  S: AsyncRead + Send + Unpin + 'static,
{
  /// Claims `name` ahead of parking a stream under it
  ///
  /// Dropping the reservation without parking releases the name.
  pub fn reserve(self: &Arc<Self>, name: &str) -> Result<Reservation<S>, RegistrationError> {
    let mut slots = self.slots();
    if slots.contains_key(name) {
      return Err(RegistrationError::NameInUse(name.to_owned()));
    }
    let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
    slots.insert(name.to_owned(), Slot::Reserved { registration });
    Ok(Reservation {
      registry: Arc::clone(self),
      name: name.to_owned(),
      registration,
      parked: false,
    })
  }

  /// Parks `stream` under `name` in one step
  pub fn register(self: &Arc<Self>, name: &str, stream: S) -> Result<(), RegistrationError> {
    self.reserve(name)?.park(stream);
    Ok(())
  }

  /// Takes the stream parked under `name`, failing immediately if there is none
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn claim(&self, name: &str) -> Result<ParkedListener<S>, MatchError> {
    let not_found = || MatchError::NotFound(name.to_owned());
    let claim = {
      let mut slots = self.slots();
      match slots.remove(name) {
        Some(Slot::Parked { claim, .. }) => claim,
        Some(reserved) => {
          slots.insert(name.to_owned(), reserved);
          return Err(not_found());
        }
        None => return Err(not_found()),
      }
    };
    let (reply, handed_over) = oneshot::channel();
    // Either send fails or the reply is dropped if the watcher saw a disconnect first
    claim.send(reply).map_err(|_| not_found())?;
    handed_over.await.map_err(|_| not_found())
  }
}

/// A reserved name, waiting for its stream
pub struct Reservation<S> {
  registry: Arc<MatchingRegistry<S>>,
  name: String,
  registration: u64,
  parked: bool,
}

impl<S> Reservation<S>
where
  S: AsyncRead + Send + Unpin + 'static,
{
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Hands `stream` to a watcher task and makes it claimable
  pub fn park(mut self, stream: S) {
    let (claim, claims) = oneshot::channel();
    {
      let mut slots = self.registry.slots();
      match slots.get_mut(&self.name) {
        Some(slot) if slot.registration() == self.registration => {
          *slot = Slot::Parked {
            registration: self.registration,
            claim,
          };
        }
        // No longer ours; dropping the stream closes it
        _ => return,
      }
    }
    self.parked = true;
    let watcher = watch_parked(
      Arc::downgrade(&self.registry),
      self.name.clone(),
      self.registration,
      stream,
      claims,
      self.registry.prefix_limit,
      self.registry.shutdown.clone(),
    );
    tokio::task::spawn(watcher.instrument(tracing::debug_span!("parked", name = %self.name)));
  }
}

impl<S> Drop for Reservation<S> {
  fn drop(&mut self) {
    if !self.parked && self.registry.evict(&self.name, self.registration) {
      tracing::debug!(name = %self.name, "Released unused reservation");
    }
  }
}

enum ParkEvent<S> {
  Claimed(Option<ClaimReply<S>>),
  Data(usize),
  Closed(&'static str),
}

async fn watch_parked<S>(
  registry: Weak<MatchingRegistry<S>>,
  name: String,
  registration: u64,
  mut stream: S,
  mut claims: oneshot::Receiver<ClaimReply<S>>,
  prefix_limit: usize,
  shutdown: CancellationToken,
) where
  S: AsyncRead + Send + Unpin + 'static,
{
  tracing::debug!("Listener parked");
  let mut prefix = Vec::new();
  let mut chunk = vec![0u8; 4096];
  loop {
    // Always keep reading, so a disconnect is seen however much was buffered
    let event = tokio::select! {
      biased;
      claimed = &mut claims => ParkEvent::Claimed(claimed.ok()),
      _ = shutdown.cancelled() => ParkEvent::Closed("broker shutting down"),
      read = stream.read(&mut chunk) => match read {
        Ok(0) => ParkEvent::Closed("listener disconnected"),
        Ok(length) if prefix.len() + length > prefix_limit => {
          ParkEvent::Closed("parked prefix limit exceeded")
        }
        Ok(length) => ParkEvent::Data(length),
        Err(_) => ParkEvent::Closed("listener stream failed"),
      },
    };
    match event {
      ParkEvent::Claimed(Some(reply)) => {
        tracing::debug!(prefix = prefix.len(), "Listener claimed");
        if reply.send(ParkedListener { stream, prefix }).is_err() {
          tracing::debug!("Claimant went away before receiving the listener");
        }
        return;
      }
      // The slot was dropped along with the registry
      ParkEvent::Claimed(None) => return,
      ParkEvent::Data(length) => prefix.extend_from_slice(&chunk[..length]),
      ParkEvent::Closed(reason) => {
        if let Some(registry) = registry.upgrade() {
          registry.evict(&name, registration);
        }
        tracing::debug!(reason, "Listener evicted");
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
  use tokio_util::sync::CancellationToken;

  use super::{MatchError, MatchingRegistry, RegistrationError};

  fn registry() -> Arc<MatchingRegistry<DuplexStream>> {
    Arc::new(MatchingRegistry::new(64 * 1024, CancellationToken::new()))
  }

  async fn wait_until_gone(registry: &MatchingRegistry<DuplexStream>, name: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while registry.contains(name) {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("Name must be evicted");
  }

  #[tokio::test]
  async fn claim_hands_over_the_parked_stream() {
    let registry = registry();
    let (mut back_peer, parked) = duplex(1024);
    registry.register("pi", parked).unwrap();
    assert!(registry.is_parked("pi"));

    let (mut stream, prefix) = registry.claim("pi").await.unwrap().into_parts();
    assert!(prefix.is_empty());
    assert!(registry.is_empty());
    back_peer.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    // Each registration matches exactly once
    assert_eq!(
      registry.claim("pi").await.unwrap_err(),
      MatchError::NotFound("pi".into())
    );
  }

  #[tokio::test]
  async fn unknown_name_fails_fast() {
    let registry = registry();
    let res = tokio::time::timeout(Duration::from_millis(500), registry.claim("nobody"))
      .await
      .expect("Claim must not wait for a listener");
    assert_eq!(res.unwrap_err(), MatchError::NotFound("nobody".into()));
  }

  #[tokio::test]
  async fn duplicate_names_are_refused() {
    let registry = registry();
    let (_first_peer, first) = duplex(64);
    let (_second_peer, second) = duplex(64);
    registry.register("pi", first).unwrap();
    assert_eq!(
      registry.register("pi", second).unwrap_err(),
      RegistrationError::NameInUse("pi".into())
    );
  }

  #[tokio::test]
  async fn disconnect_evicts_the_name() {
    let registry = registry();
    let (back_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
    drop(back_peer);
    wait_until_gone(&registry, "pi").await;
    assert!(registry.claim("pi").await.is_err());

    // The name is free for a fresh registration
    let (_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
  }

  #[tokio::test]
  async fn early_bytes_are_kept_as_prefix() {
    let registry = registry();
    let (mut back_peer, parked) = duplex(1024);
    registry.register("pi", parked).unwrap();
    back_peer.write_all(b"banner").await.unwrap();
    // Give the watcher a chance to buffer before claiming
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (mut stream, mut received) = registry.claim("pi").await.unwrap().into_parts();
    back_peer.write_all(b"!").await.unwrap();
    // However the bytes split between prefix and stream, their order is preserved
    let mut buf = [0u8; 16];
    while received.len() < b"banner!".len() {
      let read = stream.read(&mut buf).await.unwrap();
      assert_ne!(read, 0);
      received.extend_from_slice(&buf[..read]);
    }
    assert_eq!(received, b"banner!");
  }

  #[tokio::test]
  async fn overfull_prefix_evicts_the_listener() {
    let registry = Arc::new(MatchingRegistry::new(8, CancellationToken::new()));
    let (mut back_peer, parked) = duplex(1024);
    registry.register("pi", parked).unwrap();
    back_peer.write_all(&[0u8; 16]).await.unwrap();
    wait_until_gone(&registry, "pi").await;
    assert_eq!(
      registry.claim("pi").await.unwrap_err(),
      MatchError::NotFound("pi".into())
    );
    let mut rest = Vec::new();
    back_peer.read_to_end(&mut rest).await.unwrap();

    let (_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
  }

  #[tokio::test]
  async fn full_prefix_still_notices_a_disconnect() {
    let registry = Arc::new(MatchingRegistry::new(8, CancellationToken::new()));
    let (mut back_peer, parked) = duplex(1024);
    registry.register("pi", parked).unwrap();
    back_peer.write_all(&[0u8; 8]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.is_parked("pi"));
    drop(back_peer);
    wait_until_gone(&registry, "pi").await;
    let (_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
  }

  #[tokio::test]
  async fn dropped_reservation_frees_the_name() {
    let registry = registry();
    let reservation = registry.reserve("pi").unwrap();
    assert!(registry.contains("pi"));
    assert!(!registry.is_parked("pi"));
    assert!(registry.claim("pi").await.is_err());
    assert!(registry.contains("pi"), "A failed claim must not drop a reservation");
    drop(reservation);
    assert!(!registry.contains("pi"));
  }

  #[tokio::test]
  async fn shutdown_releases_parked_streams() {
    let shutdown = CancellationToken::new();
    let registry = Arc::new(MatchingRegistry::new(1024, shutdown.clone()));
    let (mut back_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
    shutdown.cancel();
    wait_until_gone(&registry, "pi").await;
    let mut rest = Vec::new();
    back_peer.read_to_end(&mut rest).await.unwrap();
  }

  #[tokio::test]
  async fn concurrent_claims_match_at_most_once() {
    let registry = registry();
    let (_peer, parked) = duplex(64);
    registry.register("pi", parked).unwrap();
    let claims = (0..8).map(|_| {
      let registry = Arc::clone(&registry);
      tokio::task::spawn(async move { registry.claim("pi").await.is_ok() })
    });
    let successes = futures::future::join_all(claims)
      .await
      .into_iter()
      .filter(|claimed| *claimed.as_ref().unwrap())
      .count();
    assert_eq!(successes, 1);
  }
}
