// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reverse-connection broker
//!
//! Back clients behind NAT dial the broker and park a listener under their
//! name; front clients dial the broker and ask to be joined to a named back
//! client. Once joined, the front drives sockets on the back's network through
//! the virtual connection multiplexer in [common::protocol::mux].

pub mod client;
pub mod common;
pub mod server;
pub mod util;
