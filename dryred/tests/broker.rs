// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Broker scenarios over real TCP and mutual TLS

use std::sync::Arc;
use std::time::Duration;

use dryred::client::{PeerConnector, PeerError};
use dryred::common::authentication::tls::{
  BrokerKeyPolicy, Credentials, TlsPeerTransport, TlsTransport,
};
use dryred::common::clients::StaticClientRegistry;
use dryred::common::identity::{PublicKey, Role};
use dryred::common::protocol::mux::server::MuxServer;
use dryred::server::{Broker, BrokerConfig, BrokerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DEADLINE: Duration = Duration::from_secs(10);

fn generate(name: &str) -> (Credentials, PublicKey) {
  let cert = rcgen::generate_simple_self_signed(vec![name.into()]).unwrap();
  let der = cert.serialize_der().unwrap();
  let key = PublicKey::from_certificate_der(&der).unwrap();
  (
    Credentials::from_der(der, cert.serialize_private_key_der()),
    key,
  )
}

struct Fixture {
  broker: BrokerHandle,
  broker_key: PublicKey,
  back: Credentials,
  front: Credentials,
}

impl Fixture {
  async fn start() -> Self {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
    let (broker_credentials, broker_key) = generate("broker");
    let (back, back_key) = generate("pi");
    let (front, front_key) = generate("laptop");
    let registry = Arc::new(
      StaticClientRegistry::new()
        .with_client("pi", Role::Back, back_key)
        .unwrap()
        .with_client("laptop", Role::Front, front_key)
        .unwrap(),
    );
    let transport = TlsTransport::new(broker_credentials, registry.clone()).unwrap();
    let config = BrokerConfig {
      request_timeout: Duration::from_secs(2),
      ..BrokerConfig::default()
    };
    let broker = Broker::new(config, registry, transport)
      .start("127.0.0.1:0")
      .await
      .unwrap();
    Self {
      broker,
      broker_key,
      back,
      front,
    }
  }

  fn connector(&self, credentials: &Credentials) -> PeerConnector<TlsPeerTransport> {
    let transport = TlsPeerTransport::new(
      credentials.clone(),
      BrokerKeyPolicy::Pinned(self.broker_key.clone()),
    )
    .unwrap();
    PeerConnector::new(transport)
  }

  async fn wait_until(&self, parked: bool) {
    tokio::time::timeout(DEADLINE, async {
      while self.broker.listeners().is_parked("pi") != parked {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
  }
}

async fn echo_server() -> std::net::SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::task::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::task::spawn(async move {
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
    }
  });
  addr
}

#[tokio::test]
async fn front_reaches_echo_server_through_parked_back() {
  let fixture = Fixture::start().await;
  let broker_addr = fixture.broker.local_addr();
  let echo_addr = echo_server().await;

  let back = fixture.connector(&fixture.back);
  let back_task = tokio::task::spawn(async move {
    let link = back.listen_via(broker_addr, "pi").await.unwrap();
    MuxServer::new().serve(link).await
  });
  fixture.wait_until(true).await;

  let front = fixture.connector(&fixture.front);
  let (client, connection) = tokio::time::timeout(
    DEADLINE,
    front.connect_virtual(broker_addr, "pi", &echo_addr.to_string()),
  )
  .await
  .unwrap()
  .unwrap();
  assert!(!fixture.broker.listeners().contains("pi"));

  assert_eq!(connection.write(b"hello, pi").await.unwrap(), 9);
  let mut echoed = Vec::new();
  let mut buffer = [0u8; 64];
  while echoed.len() < 9 {
    let read = tokio::time::timeout(DEADLINE, connection.read(&mut buffer))
      .await
      .unwrap()
      .unwrap();
    assert_ne!(read, 0, "echo closed early");
    echoed.extend_from_slice(&buffer[..read]);
  }
  assert_eq!(echoed, b"hello, pi");
  connection.close().await.unwrap();

  drop(client);
  tokio::time::timeout(DEADLINE, back_task)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  fixture.broker.stop().await;
}

#[tokio::test]
async fn connect_without_listener_fails_fast() {
  let fixture = Fixture::start().await;
  let front = fixture.connector(&fixture.front);
  let outcome = tokio::time::timeout(
    Duration::from_secs(1),
    front.connect_via(fixture.broker.local_addr(), "pi", "127.0.0.1:22"),
  )
  .await
  .unwrap();
  match outcome {
    Err(PeerError::Refused(message)) => assert!(!message.is_empty()),
    other => panic!("expected a refusal, got {:?}", other.map(|_| ())),
  }
  fixture.broker.stop().await;
}

#[tokio::test]
async fn unregistered_key_is_rejected_without_a_reply() {
  let fixture = Fixture::start().await;
  let (stranger, _) = generate("stranger");
  let connector = fixture.connector(&stranger);
  let outcome = tokio::time::timeout(
    DEADLINE,
    connector.listen_via(fixture.broker.local_addr(), "stranger"),
  )
  .await
  .unwrap();
  match outcome {
    Err(PeerError::Refused(message)) => panic!("unexpected control reply: {}", message),
    Err(_) => {}
    Ok(_) => panic!("unregistered client was admitted"),
  }
  assert!(fixture.broker.listeners().is_empty());
  fixture.broker.stop().await;
}

#[tokio::test]
async fn disconnected_back_is_evicted() {
  let fixture = Fixture::start().await;
  let back = fixture.connector(&fixture.back);
  let link = back
    .listen_via(fixture.broker.local_addr(), "pi")
    .await
    .unwrap();
  fixture.wait_until(true).await;
  drop(link);
  tokio::time::timeout(DEADLINE, async {
    while fixture.broker.listeners().contains("pi") {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();

  let front = fixture.connector(&fixture.front);
  let outcome = front
    .connect_via(fixture.broker.local_addr(), "pi", "127.0.0.1:22")
    .await;
  assert!(matches!(outcome, Err(PeerError::Refused(_))));
  fixture.broker.stop().await;
}

#[tokio::test]
async fn roles_are_enforced() {
  let fixture = Fixture::start().await;
  let broker_addr = fixture.broker.local_addr();

  let front = fixture.connector(&fixture.front);
  match front.listen_via(broker_addr, "laptop").await {
    Err(PeerError::Refused(message)) => assert_eq!(message, "not a back client"),
    other => panic!("front client listened: {:?}", other.map(|_| ())),
  }

  let back = fixture.connector(&fixture.back);
  match back.connect_via(broker_addr, "pi", "127.0.0.1:22").await {
    Err(PeerError::Refused(message)) => assert_eq!(message, "not a front client"),
    other => panic!("back client connected: {:?}", other.map(|_| ())),
  }
  assert!(fixture.broker.listeners().is_empty());
  fixture.broker.stop().await;
}

#[tokio::test]
async fn stopping_the_broker_closes_parked_listeners() {
  let fixture = Fixture::start().await;
  let back = fixture.connector(&fixture.back);
  let mut link = back
    .listen_via(fixture.broker.local_addr(), "pi")
    .await
    .unwrap();
  fixture.wait_until(true).await;
  fixture.broker.stop().await;

  let mut buffer = [0u8; 1];
  let read = tokio::time::timeout(DEADLINE, link.read(&mut buffer))
    .await
    .unwrap();
  assert!(matches!(read, Ok(0) | Err(_)));
  let _ = link.shutdown().await;
}
