// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use dryred::common::authentication::tls::BrokerKeyPolicy;
use dryred::common::identity::PublicKey;
use dryred::util;
use std::path::PathBuf;

use util::validators::{
  parse_timeout_secs, validate_client_name, validate_existing_file, validate_host_port,
  validate_socketaddr, validate_timeout_secs,
};

mod back;
mod certgen;
mod front;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rustls=warn,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  if let Err(err) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger init failed: {}", err);
    std::process::exit(2);
  }
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("server")
        .about("Run the broker, matching front clients to parked back clients")
        .arg(credential_arg("cert", 'c'))
        .arg(credential_arg("key", 'k'))
        .arg(
          Arg::new("clients")
            .help("JSON file listing the front and back clients and their public keys")
            .long("clients")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("0.0.0.0:7001")
            .takes_value(true),
        )
        .arg(
          Arg::new("request-timeout")
            .help("Seconds a client may take to handshake and send its request")
            .long("request-timeout")
            .validator(validate_timeout_secs)
            .default_value("5")
            .takes_value(true),
        ),
    )
    .subcommand(
      peer_command("back")
        .about("Park at the broker and serve virtual connections for front clients")
        .arg(
          Arg::new("name")
            .help("Name to listen under; must be this client's registered name")
            .long("name")
            .short('n')
            .validator(validate_client_name)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      peer_command("front")
        .about("Send stdin to an address reachable from a back client, printing the reply")
        .arg(
          Arg::new("back")
            .help("Name of the back client to join")
            .long("back")
            .validator(validate_client_name)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("target")
            .help("host:port the back client should dial")
            .long("target")
            .short('t')
            .validator(validate_host_port)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate and print its public key")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches
    .subcommand_name()
    .unwrap_or("<No subcommand?>")
    .to_owned();
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(err) => {
      tracing::error!(err = ?err, "Tokio runtime setup failure");
      std::process::exit(2);
    }
  };
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = %mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn credential_arg(name: &'static str, short: char) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .short(short)
    .validator(validate_existing_file)
    .takes_value(true)
    .required(true)
}

fn peer_command(name: &'static str) -> Command<'static> {
  Command::new(name)
    .arg(credential_arg("cert", 'c'))
    .arg(credential_arg("key", 'k'))
    .arg(
      Arg::new("broker")
        .help("host:port of the broker")
        .long("broker")
        .short('b')
        .validator(validate_host_port)
        .takes_value(true)
        .required(true),
    )
    .arg(
      Arg::new("broker-key")
        .help("Base64 public key the broker must present; any key is accepted and logged if omitted")
        .long("broker-key")
        .takes_value(true)
        .required(false),
    )
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .with_context(|| format!("Missing required argument {}", name))
}

fn peer_arg_handling(args: &ArgMatches) -> Result<PeerArgs> {
  let broker_key = match args.value_of("broker-key") {
    Some(encoded) => BrokerKeyPolicy::Pinned(
      PublicKey::from_base64(encoded).context("Broker key must be a base64 public key")?,
    ),
    None => BrokerKeyPolicy::AcceptAny,
  };
  Ok(PeerArgs {
    cert: PathBuf::from(required(args, "cert")?),
    key: PathBuf::from(required(args, "key")?),
    broker: required(args, "broker")?.to_owned(),
    broker_key,
  })
}

/// Identity and broker settings shared by back and front clients
#[derive(Clone, Debug)]
pub struct PeerArgs {
  pub cert: PathBuf,
  pub key: PathBuf,
  pub broker: String,
  pub broker_key: BrokerKeyPolicy,
}

fn server_arg_handling(args: &ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    cert: PathBuf::from(required(args, "cert")?),
    key: PathBuf::from(required(args, "key")?),
    clients: PathBuf::from(required(args, "clients")?),
    bind_addr: required(args, "bind")?.to_owned(),
    request_timeout: parse_timeout_secs(required(args, "request-timeout")?)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as broker with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("back", opts)) => {
      let config = back::BackArgs {
        peer: peer_arg_handling(opts)?,
        name: required(opts, "name")?.to_owned(),
      };
      tracing::info!("Running as back client with config {:#?}", config);
      back::back_main(config).await
    }
    Some(("front", opts)) => {
      let config = front::FrontArgs {
        peer: peer_arg_handling(opts)?,
        back_name: required(opts, "back")?.to_owned(),
        target: required(opts, "target")?.to_owned(),
      };
      tracing::info!("Running as front client with config {:#?}", config);
      front::front_main(config).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      certgen::certgen_main(
        required(opts, "path")?.to_owned(),
        required(opts, "san")?.to_owned(),
      )
      .await
    }
    _ => anyhow::bail!("Unknown subcommand"),
  }
}
