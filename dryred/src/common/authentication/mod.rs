// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Secure-session establishment, kept behind a trait so the control engine
//! never depends on a concrete handshake implementation

pub mod tls;
pub mod traits;

pub use traits::{
  AuthenticationError, BoxedSession, PeerTransport, SecureSession, TransportSecurity,
};
