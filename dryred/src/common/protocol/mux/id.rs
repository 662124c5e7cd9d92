// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Names one virtual connection on a multiplexer link
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(i64);

impl ConnectionId {
  pub fn new(inner: i64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> i64 {
    self.0
  }
}

impl From<i64> for ConnectionId {
  fn from(inner: i64) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for i64 {
  fn from(id: ConnectionId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

/// Hands out ids from 0 upward, never reusing one for the lifetime of a link
///
/// Owned by a single multiplexer server loop, so no atomics are needed.
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
  next: i64,
}

impl ConnectionIdGenerator {
  pub fn next(&mut self) -> ConnectionId {
    let id = ConnectionId::new(self.next);
    self.next = self.next.wrapping_add(1);
    id
  }
}

#[cfg(test)]
mod tests {
  use super::{ConnectionId, ConnectionIdGenerator};

  #[test]
  fn ids_start_at_zero_and_increase() {
    let mut ids = ConnectionIdGenerator::default();
    assert_eq!(ids.next(), ConnectionId::new(0));
    assert_eq!(ids.next(), ConnectionId::new(1));
    assert_eq!(i64::from(ids.next()), 2);
  }
}
