//! Integration tests for the MeshNode public API.
//!
//! Every node runs on loopback with ephemeral ports, so tests can run in
//! parallel. Timeouts are shortened so unreachable contacts fail fast.

use std::time::Duration;

use meshgate::{
    BootstrapPeer, HandshakeOutcome, Keypair, MeshConfig, MeshError, MeshNode, NatType, RejectReason, SourceKey,
    ViolationRecord, ViolationType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> MeshConfig {
    let mut config = MeshConfig::local();
    config.dht.rpc_timeout_ms = 300;
    config.dht.lookup_timeout_ms = 2_000;
    config.nat.probe_timeout_ms = 300;
    config.connection.connect_timeout_ms = 2_000;
    config.connection.tls_timeout_ms = 3_000;
    config.connection.hello_timeout_ms = 3_000;
    config
}

async fn start(config: MeshConfig) -> MeshNode {
    let _ = meshgate::init_tracing("meshgate=debug");
    MeshNode::start(config).await.expect("node start failed")
}

fn seed(node: &MeshNode) -> BootstrapPeer {
    BootstrapPeer {
        addr: node.dht_addr().expect("dht addr"),
        peer_id: Some(node.peer_id()),
    }
}

/// Start a hub and a spoke that joins through it.
async fn joined_pair() -> (MeshNode, MeshNode) {
    let hub = start(test_config()).await;
    let spoke = start(test_config()).await;
    let admitted = spoke.bootstrap_from(&[seed(&hub)]).await.expect("bootstrap failed");
    assert_eq!(admitted, 1);
    (hub, spoke)
}

async fn expect_violation(rx: &mut broadcast::Receiver<ViolationRecord>, wanted: ViolationType) -> ViolationRecord {
    timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(record) if record.violation == wanted => return record,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("violation channel closed"),
            }
        }
    })
    .await
    .expect("violation not observed")
}

#[tokio::test]
async fn two_nodes_connect_by_peer_id() {
    let (hub, spoke) = joined_pair().await;
    let mut incoming = spoke.incoming().await.expect("incoming taken once");
    assert!(spoke.incoming().await.is_none(), "second take must be empty");

    let outcome = timeout(TEST_TIMEOUT, hub.connect(spoke.peer_id()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let mut outbound = match outcome {
        HandshakeOutcome::Accepted(stream) => stream,
        HandshakeOutcome::Rejected(reason) => panic!("rejected: {reason}"),
    };
    assert_eq!(outbound.peer_id, spoke.peer_id());
    assert_eq!(outbound.thumbprint, spoke.certificate_thumbprint());

    let mut inbound = timeout(TEST_TIMEOUT, incoming.recv())
        .await
        .expect("no inbound stream")
        .expect("incoming channel closed");
    assert_eq!(inbound.peer_id, hub.peer_id());

    outbound.write_all(b"ping").await.unwrap();
    outbound.flush().await.unwrap();
    let mut buf = [0u8; 4];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    inbound.write_all(b"pong").await.unwrap();
    inbound.flush().await.unwrap();
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn loopback_nodes_classify_as_open() {
    let (hub, spoke) = joined_pair().await;
    assert_eq!(spoke.nat_type(), NatType::Open);

    let descriptor = hub
        .find_peer_by_id(&spoke.peer_id())
        .await
        .expect("spoke descriptor published");
    assert_eq!(descriptor.nat_type, NatType::Open);
    assert!(descriptor.certificate_pins.contains(&spoke.certificate_thumbprint().to_string()));

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn restarted_peer_with_new_certificate_violates_pin() {
    let dir = tempfile::tempdir().unwrap();
    let hub = start(test_config()).await;
    let mut violations = hub.violations();

    let mut spoke_config = test_config();
    spoke_config.data_dir = Some(dir.path().to_path_buf());

    let spoke = start(spoke_config.clone()).await;
    let spoke_id = spoke.peer_id();
    let first_thumbprint = spoke.certificate_thumbprint().to_string();
    spoke.bootstrap_from(&[seed(&hub)]).await.unwrap();
    let outcome = timeout(TEST_TIMEOUT, hub.connect(spoke_id)).await.unwrap().unwrap();
    assert!(outcome.is_accepted(), "first contact pins the certificate");
    spoke.shutdown().await;

    // Same identity key, freshly generated certificate.
    std::fs::remove_file(spoke_config.certificate_path().unwrap()).unwrap();
    let restarted = start(spoke_config).await;
    assert_eq!(restarted.peer_id(), spoke_id);
    assert_ne!(restarted.certificate_thumbprint(), first_thumbprint);
    restarted.bootstrap_from(&[seed(&hub)]).await.unwrap();

    let outcome = timeout(TEST_TIMEOUT, hub.connect(spoke_id)).await.unwrap().unwrap();
    match outcome {
        HandshakeOutcome::Rejected(RejectReason::PinViolation { pinned, presented }) => {
            assert_eq!(pinned, first_thumbprint);
            assert_eq!(presented, restarted.certificate_thumbprint());
        }
        other => panic!("expected pin violation, got {other:?}"),
    }

    let record = expect_violation(&mut violations, ViolationType::PinViolation).await;
    assert_eq!(record.source, SourceKey::Peer(spoke_id));

    hub.shutdown().await;
    restarted.shutdown().await;
}

#[tokio::test]
async fn bootstrap_refuses_seed_with_wrong_identity() {
    let hub = start(test_config()).await;
    let spoke = start(test_config()).await;
    let mut violations = spoke.violations();

    let impostor = BootstrapPeer {
        addr: hub.dht_addr().unwrap(),
        peer_id: Some(Keypair::generate().peer_id()),
    };
    assert_eq!(spoke.bootstrap_from(&[impostor]).await.unwrap(), 0);
    assert!(spoke.closest_peers(8).await.is_empty());

    let record = expect_violation(&mut violations, ViolationType::IdentityMismatch).await;
    assert_eq!(record.addr, Some(hub.dht_addr().unwrap().ip()));

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn unknown_peer_has_no_descriptor() {
    let (hub, spoke) = joined_pair().await;
    let stranger = Keypair::generate().peer_id();

    assert!(hub.find_peer_by_id(&stranger).await.is_none());
    match timeout(TEST_TIMEOUT, hub.connect(stranger)).await.unwrap() {
        Err(MeshError::DescriptorNotFound(peer)) => assert_eq!(peer, stranger),
        other => panic!("expected DescriptorNotFound, got {other:?}"),
    }

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn peer_with_recorded_failures_is_fast_rejected() {
    let mut config = test_config();
    config.rate_limit.max_handshake_failures = 3;
    let hub = start(config).await;
    let spoke = start(test_config()).await;
    spoke.bootstrap_from(&[seed(&hub)]).await.unwrap();

    for _ in 0..3 {
        hub.rate_limiter()
            .record_violation(ViolationType::HandshakeFailure, SourceKey::Peer(spoke.peer_id()), None);
    }

    let outcome = timeout(TEST_TIMEOUT, hub.connect(spoke.peer_id())).await.unwrap().unwrap();
    assert!(
        matches!(outcome, HandshakeOutcome::Rejected(RejectReason::RateLimited(_))),
        "got {outcome:?}"
    );

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn content_providers_are_discoverable() {
    let (hub, spoke) = joined_pair().await;

    assert!(hub.find_peers_by_content(b"dataset-42").await.is_empty());
    let stored = spoke.announce_content(b"dataset-42").await.unwrap();
    assert!(stored >= 1, "hub should store the provider record");

    let providers = hub.find_peers_by_content(b"dataset-42").await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].peer_id, spoke.peer_id());
    assert!(hub.find_peers_by_content(b"dataset-43").await.is_empty());

    hub.shutdown().await;
    spoke.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_stalled_inbound_handshake() {
    let mut config = test_config();
    config.connection.tls_timeout_ms = 60_000;
    config.connection.hello_timeout_ms = 60_000;
    let node = start(config).await;

    // Connect and never send a ClientHello.
    let mut silent = tokio::net::TcpStream::connect(node.listen_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(TEST_TIMEOUT, node.shutdown()).await.expect("shutdown hung");
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), silent.read(&mut buf))
        .await
        .expect("stalled handshake outlived shutdown");
    assert!(matches!(read, Ok(0) | Err(_)), "got {read:?}");
}

#[tokio::test]
async fn shutdown_abandons_stalled_outbound_connect() {
    let mut config = test_config();
    config.connection.tls_timeout_ms = 60_000;
    config.connection.hello_timeout_ms = 60_000;
    let hub = start(config).await;
    let spoke = start(test_config()).await;
    spoke.bootstrap_from(&[seed(&hub)]).await.unwrap();
    let spoke_id = spoke.peer_id();
    assert!(hub.find_peer_by_id(&spoke_id).await.is_some(), "descriptor cached at hub");

    // Something silent takes over the spoke's advertised port.
    let taken = spoke.listen_addr();
    spoke.shutdown().await;
    let silent = tokio::net::TcpListener::bind(taken).await.unwrap();
    let _held = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            streams.push(stream);
        }
    });

    let (result, ()) = timeout(TEST_TIMEOUT, async {
        tokio::join!(hub.connect(spoke_id), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            hub.shutdown().await;
        })
    })
    .await
    .expect("connect outlived shutdown");
    assert!(matches!(result, Err(MeshError::ShuttingDown)), "got {result:?}");
}

#[tokio::test]
async fn shutdown_stops_new_work() {
    let (hub, spoke) = joined_pair().await;
    hub.shutdown().await;
    hub.shutdown().await;

    assert!(matches!(hub.connect(spoke.peer_id()).await, Err(MeshError::ShuttingDown)));
    assert!(matches!(
        hub.bootstrap_from(&[seed(&spoke)]).await,
        Err(MeshError::ShuttingDown)
    ));
    spoke.shutdown().await;
}
