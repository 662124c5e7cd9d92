// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument validators shared by the command-line front-ends
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Accepts `host:port` without resolving it; resolution happens at dial time
pub fn parse_host_port(v: &str) -> Result<(&str, u16)> {
  let (host, port) = v
    .rsplit_once(':')
    .ok_or_else(|| AnyErr::msg("Expected an address of the form host:port"))?;
  if host.is_empty() {
    return Err(AnyErr::msg("Host component must not be empty"));
  }
  let port = port
    .parse::<u16>()
    .map_err(|_| AnyErr::msg("Port component was not a valid u16"))?;
  Ok((host, port))
}

pub fn parse_timeout_secs(v: &str) -> Result<Duration> {
  let secs = v
    .parse::<u64>()
    .map_err(|_| AnyErr::msg("Timeout must be a whole number of seconds"))?;
  if secs == 0 {
    return Err(AnyErr::msg("Timeout must be at least one second"));
  }
  Ok(Duration::from_secs(secs))
}

/// Client names are used as registry keys and in log fields
pub fn validate_client_name(v: &str) -> Result<(), String> {
  if v.is_empty() {
    Err(String::from("Client names must not be empty"))
  } else if v.chars().any(|c| c.is_whitespace() || c.is_control()) {
    Err(String::from(
      "Client names must not contain whitespace or control characters",
    ))
  } else {
    Ok(())
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_timeout_secs(v: &str) -> Result<(), String> {
  parse_timeout_secs(v).map(|_| ()).map_err(|e| e.to_string())
}
