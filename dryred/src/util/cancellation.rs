// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Observes broker shutdown without being able to trigger it
///
/// Connection handlers receive one of these; they may derive child tokens
/// to tear down their own splices, but only the broker handle stops the broker.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

impl From<&CancellationToken> for CancellationListener {
  fn from(token: &CancellationToken) -> Self {
    Self {
      token: token.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use tokio_util::sync::CancellationToken;

  use super::CancellationListener;

  #[tokio::test]
  async fn children_follow_the_source_token() {
    let source = CancellationToken::new();
    let listener = CancellationListener::from(&source);
    let child = listener.child_token();
    // Cancelling a child must not leak upward
    child.cancel();
    assert!(!listener.is_cancelled());

    let second_child = listener.child_token();
    source.cancel();
    listener.cancelled().await;
    assert!(second_child.is_cancelled());
  }
}
