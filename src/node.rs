//! # High-Level Node API
//!
//! [`MeshNode`] wires every component into one running overlay node.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = MeshNode::start(MeshConfig::from_toml_file(path)?).await?;
//! node.bootstrap().await?;
//!
//! // Reach a peer by identity alone.
//! match node.connect(peer_id).await? {
//!     HandshakeOutcome::Accepted(stream) => { /* authenticated bytes */ }
//!     HandshakeOutcome::Rejected(reason) => { /* never an error */ }
//! }
//!
//! // Serve peers that dial us.
//! let mut incoming = node.incoming().await.expect("taken once");
//! while let Some(stream) = incoming.recv().await { /* ... */ }
//! ```
//!
//! ## Component Integration
//!
//! | Component | Role |
//! |-----------|------|
//! | [`RpcEndpoint`] | UDP socket for DHT RPC, binding probes and punching |
//! | [`DhtNode`] | routing table, lookups, validated value store |
//! | [`DescriptorStore`] | signed descriptor and provider records |
//! | [`NatTraversal`] | classification and the direct → punch → relay chain |
//! | [`OverlayHandshaker`] | TLS + signed hello + pins on every stream |
//! | [`RelayServer`] / [`RelayClient`] | relay service and registration |
//! | [`CertificateExpirationMonitor`] | expiry warnings for the identity certificate |
//!
//! ## Background Tasks
//!
//! All tasks watch one shutdown channel; [`MeshNode::shutdown`] flips it and
//! joins them.
//!
//! | Task | Period |
//! |------|--------|
//! | RPC receive loop | continuous |
//! | overlay accept loop | continuous |
//! | relay registration + events | continuous, reconnecting |
//! | bucket refresh | `dht.refresh_interval_secs` |
//! | value expiry sweep | `dht.expiry_sweep_interval_secs` |
//! | descriptor republish | `descriptor.republish_interval_secs` and on change |
//! | NAT reclassification | `nat.reclassify_interval_secs` |
//! | certificate scan | `cert_monitor.scan_interval_secs` |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::certmon::{CertificateExpirationMonitor, CertificateSource};
use crate::clock::{Clock, SystemClock};
use crate::config::{BootstrapPeer, ConfigError, MeshConfig};
use crate::connection::{AuthenticatedStream, HandshakeOutcome, OverlayHandshaker};
use crate::crypto::{
    certificate_not_after_ms, extract_public_key_from_cert, generate_identity_certificate, TlsMaterial,
};
use crate::descriptor::{EndpointKind, PeerDescriptor, TransportEndpoint};
use crate::descriptor_store::{DescriptorCache, DescriptorStore, LocalProfile, RecordValidator};
use crate::dht::DhtNode;
use crate::error::MeshError;
use crate::events::{self, SecurityEvent};
use crate::identity::{Keypair, PeerId};
use crate::nat::{NatTraversal, NatType};
use crate::pins::CertificatePinStore;
use crate::ratelimit::{RateLimiter, SourceKey, ViolationRecord, ViolationType};
use crate::relay::{RelayClient, RelayEvent, RelayServer};
use crate::routing::Contact;
use crate::rpc::RpcEndpoint;
use crate::sealed::SealKey;
use crate::signing::{DescriptorSigningService, SequenceStore};
use crate::transport::{DirectTransport, HolePunchTransport, RelayTransport};

/// Authenticated inbound streams waiting for the application.
const INCOMING_QUEUE: usize = 64;

/// Relay events waiting for the node.
const RELAY_EVENT_QUEUE: usize = 64;

/// Routing contacts used as extra reflectors during NAT classification.
const REFLECTORS_FROM_ROUTING: usize = 4;

/// How long [`MeshNode::shutdown`] waits for each background task.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Startup helpers
// ============================================================================

fn load_keypair(config: &MeshConfig) -> Result<Keypair, MeshError> {
    match config.identity_key_path() {
        Some(path) => Keypair::load_or_generate(&path),
        None => Ok(Keypair::generate()),
    }
}

/// The persisted identity certificate, regenerated when missing, issued for
/// another key, or inside the renewal window.
fn load_certificate(
    config: &MeshConfig,
    keypair: &Keypair,
    now_ms: u64,
) -> Result<CertificateDer<'static>, MeshError> {
    let Some(path) = config.certificate_path() else {
        return Ok(generate_identity_certificate(keypair, config.tls.certificate_validity_days)?);
    };

    if let Some(existing) = read_certificate(&path, keypair, now_ms, config.tls.renew_before_days) {
        return Ok(existing);
    }

    let cert = generate_identity_certificate(keypair, config.tls.certificate_validity_days)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, cert.as_ref())?;
    info!(path = %path.display(), "generated identity certificate");
    Ok(cert)
}

fn read_certificate(
    path: &Path,
    keypair: &Keypair,
    now_ms: u64,
    renew_before_days: u32,
) -> Option<CertificateDer<'static>> {
    let der = match std::fs::read(path) {
        Ok(der) => der,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable certificate, regenerating");
            return None;
        }
    };
    if extract_public_key_from_cert(&der) != Some(keypair.public_key_bytes()) {
        warn!(path = %path.display(), "certificate does not belong to the identity key, regenerating");
        return None;
    }
    let renew_at = certificate_not_after_ms(&der)?
        .saturating_sub(u64::from(renew_before_days) * 24 * 60 * 60 * 1000);
    if now_ms >= renew_at {
        // Peers that pinned the old certificate will reject the new one
        // until they drop their pin.
        warn!(path = %path.display(), "certificate inside renewal window, regenerating");
        return None;
    }
    Some(CertificateDer::from(der))
}

fn advertised_ip(config: &MeshConfig, bound: IpAddr) -> Result<IpAddr, MeshError> {
    if let Some(host) = &config.advertise_host {
        return host.parse().map_err(|_| {
            MeshError::Config(ConfigError::Invalid(format!(
                "advertise_host {host:?} must be an IP address"
            )))
        });
    }
    if bound.is_unspecified() {
        warn!("listener bound to an unspecified address and no advertise_host set; advertising loopback");
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    Ok(bound)
}

/// The addresses this node can put in its descriptor.
#[derive(Clone, Debug)]
struct Advertised {
    overlay: SocketAddr,
    relays: Vec<SocketAddr>,
}

impl Advertised {
    fn profile(&self, nat_type: NatType, reflexive: Option<SocketAddr>) -> LocalProfile {
        let mut endpoints = vec![TransportEndpoint::direct(self.overlay)];
        let punchable = !matches!(nat_type, NatType::Open | NatType::Unknown);
        if punchable
            && !self.relays.is_empty()
            && let Some(reflexive) = reflexive
        {
            endpoints.push(TransportEndpoint::hole_punch(SocketAddr::new(
                reflexive.ip(),
                self.overlay.port(),
            )));
        }
        endpoints.extend(self.relays.iter().copied().map(TransportEndpoint::relay));
        LocalProfile { endpoints, nat_type }
    }
}

// ============================================================================
// MeshNode
// ============================================================================

pub struct MeshNode {
    keypair: Arc<Keypair>,
    config: MeshConfig,
    rpc: RpcEndpoint,
    dht: DhtNode<RpcEndpoint>,
    descriptors: DescriptorStore<RpcEndpoint>,
    pins: Arc<CertificatePinStore>,
    limiter: Arc<RateLimiter>,
    nat: Arc<NatTraversal>,
    handshaker: Arc<OverlayHandshaker>,
    relay_server: Option<RelayServer>,
    certmon: Arc<CertificateExpirationMonitor>,
    thumbprint: String,
    listen_addr: SocketAddr,
    advertised: Advertised,
    profile: watch::Sender<LocalProfile>,
    incoming: TakeOnce<AuthenticatedStream>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("peer_id", &self.keypair.peer_id())
            .field("listen_addr", &self.listen_addr)
            .field("nat_type", &self.nat.nat_type())
            .finish()
    }
}

impl MeshNode {
    /// Start a node with the system clock.
    ///
    /// # Errors
    /// [`MeshError::CorruptIdentity`] if the persisted identity key is
    /// unusable, [`MeshError::Config`] for invalid configuration, and I/O
    /// errors when a socket cannot be bound.
    pub async fn start(config: MeshConfig) -> Result<Self, MeshError> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(config: MeshConfig, clock: Arc<dyn Clock>) -> Result<Self, MeshError> {
        config.validate()?;

        let keypair = Arc::new(load_keypair(&config)?);
        let peer_id = keypair.peer_id();
        let certificate = load_certificate(&config, &keypair, clock.now_ms())?;
        let tls = TlsMaterial::new(&keypair, certificate.clone(), config.tls.policy)?;
        let thumbprint = tls.thumbprint.clone();

        let seal_key = SealKey::derive(&keypair);
        let pins = Arc::new(match config.pin_store_path() {
            Some(path) => CertificatePinStore::open(path, seal_key.clone(), clock.clone()),
            None => CertificatePinStore::in_memory(clock.clone()),
        });
        let sequences = match config.sequence_store_path() {
            Some(path) => SequenceStore::open(path, seal_key),
            None => SequenceStore::in_memory(),
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let signing = Arc::new(DescriptorSigningService::new(sequences, clock.clone(), &config.descriptor));
        let cache = Arc::new(DescriptorCache::new(config.descriptor.cache_capacity));
        let validator = Arc::new(RecordValidator::new(signing.clone(), cache.clone(), &config.descriptor));

        let rpc = RpcEndpoint::bind(config.dht_addr, keypair.clone(), limiter.clone(), config.dht.rpc_timeout()).await?;
        let dht = DhtNode::new(peer_id, rpc.clone(), config.dht.clone(), limiter.clone(), validator);
        let descriptors = DescriptorStore::new(
            dht.clone(),
            keypair.clone(),
            signing,
            cache,
            config.descriptor.clone(),
            vec![thumbprint.clone()],
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![rpc.serve(dht.clone(), shutdown_rx.clone())];

        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;

        let relay_server = if config.nat.relay_eligible {
            let (server, handle) =
                RelayServer::start(config.nat.relay_listen_addr, limiter.clone(), shutdown_rx.clone()).await?;
            tasks.push(handle);
            Some(server)
        } else {
            None
        };

        let relay_client = RelayClient::new(keypair.clone(), config.connection.connect_timeout());
        let nat = NatTraversal::new(config.connection.connect_timeout() + config.nat.punch_window());
        let reflexive = nat.reflexive();
        let nat = Arc::new(
            nat.with_transport(Arc::new(DirectTransport))
                .with_transport(Arc::new(HolePunchTransport::new(
                    rpc.clone(),
                    relay_client.clone(),
                    reflexive.clone(),
                    config.nat.punch_window(),
                )))
                .with_transport(Arc::new(RelayTransport::new(relay_client.clone()))),
        );

        let handshaker = Arc::new(OverlayHandshaker::new(
            keypair.clone(),
            tls,
            pins.clone(),
            limiter.clone(),
            config.connection.clone(),
        ));

        let certmon = Arc::new(CertificateExpirationMonitor::new(config.cert_monitor.clone(), clock));
        certmon.register(match config.certificate_path() {
            Some(path) => CertificateSource::File(path),
            None => CertificateSource::Der {
                label: "identity certificate".to_string(),
                der: certificate.as_ref().to_vec(),
            },
        });

        let advertised = Advertised {
            overlay: SocketAddr::new(advertised_ip(&config, listen_addr.ip())?, listen_addr.port()),
            relays: config.nat.relays.clone(),
        };
        let (profile, profile_rx) = watch::channel(advertised.profile(NatType::Unknown, None));

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        tasks.push(spawn_accept_loop(
            listener,
            handshaker.clone(),
            incoming_tx.clone(),
            shutdown_rx.clone(),
        ));

        if !config.nat.relays.is_empty() {
            let (events_tx, events_rx) = mpsc::channel(RELAY_EVENT_QUEUE);
            for relay in &config.nat.relays {
                tasks.push(relay_client.listen(*relay, reflexive.clone(), events_tx.clone(), shutdown_rx.clone()));
            }
            tasks.push(spawn_relay_events(
                events_rx,
                handshaker.clone(),
                incoming_tx,
                rpc.clone(),
                config.nat.punch_window(),
                shutdown_rx.clone(),
            ));
        }

        tasks.push(dht.spawn_refresh(shutdown_rx.clone()));
        tasks.push(dht.spawn_sweep(shutdown_rx.clone()));
        tasks.push(certmon.clone().spawn(shutdown_rx.clone()));
        tasks.push(descriptors.spawn_republish(profile_rx, shutdown_rx.clone()));

        info!(
            peer = %peer_id.short(),
            overlay = %listen_addr,
            dht = %rpc.local_addr()?,
            relay = ?relay_server.as_ref().map(RelayServer::local_addr),
            "mesh node started"
        );

        let node = Self {
            keypair,
            config,
            rpc,
            dht,
            descriptors,
            pins,
            limiter,
            nat,
            handshaker,
            relay_server,
            certmon,
            thumbprint,
            listen_addr,
            advertised,
            profile,
            incoming: tokio::sync::Mutex::new(Some(incoming_rx)),
            shutdown,
            tasks: Mutex::new(tasks),
        };
        node.spawn_nat_loop();
        Ok(node)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// TCP address of the overlay listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// UDP address of the DHT socket.
    pub fn dht_addr(&self) -> Result<SocketAddr, MeshError> {
        Ok(self.rpc.local_addr()?)
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_server.as_ref().map(RelayServer::local_addr)
    }

    /// Thumbprint of the certificate this node presents.
    pub fn certificate_thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn nat_type(&self) -> NatType {
        self.nat.nat_type()
    }

    pub fn local_profile(&self) -> LocalProfile {
        self.profile.borrow().clone()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pins(&self) -> &Arc<CertificatePinStore> {
        &self.pins
    }

    pub fn certificate_monitor(&self) -> &Arc<CertificateExpirationMonitor> {
        &self.certmon
    }

    /// Every violation recorded from now on, for reputation consumers.
    pub fn violations(&self) -> broadcast::Receiver<ViolationRecord> {
        self.limiter.subscribe()
    }

    /// Routing contacts closest to this node.
    pub async fn closest_peers(&self, k: usize) -> Vec<Contact> {
        self.dht.find_closest(&self.peer_id(), k).await
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ------------------------------------------------------------------------
    // Joining the network
    // ------------------------------------------------------------------------

    /// Join through the configured bootstrap peers.
    pub async fn bootstrap(&self) -> Result<usize, MeshError> {
        let seeds = self.config.dht.bootstrap.clone();
        self.bootstrap_from(&seeds).await
    }

    /// Join through `seeds`, then classify the NAT and publish the local
    /// descriptor. Seeds that do not answer, or answer with a PeerId other
    /// than the one configured, are skipped. Returns the number of seeds
    /// admitted.
    pub async fn bootstrap_from(&self, seeds: &[BootstrapPeer]) -> Result<usize, MeshError> {
        if self.is_shutting_down() {
            return Err(MeshError::ShuttingDown);
        }
        let mut contacts = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let answered = match self.rpc.ping_addr(seed.addr).await {
                Ok(peer_id) => peer_id,
                Err(e) => {
                    debug!(seed = %seed, error = %e, "bootstrap seed did not answer");
                    continue;
                }
            };
            if let Some(expected) = seed.peer_id
                && expected != answered
            {
                events::emit(
                    SecurityEvent::IdentityMismatch,
                    &seed.addr.to_string(),
                    &format!("bootstrap seed answered as {}", answered.short()),
                );
                self.limiter.record_violation(
                    ViolationType::IdentityMismatch,
                    SourceKey::Addr(seed.addr.ip()),
                    Some(seed.addr.ip()),
                );
                continue;
            }
            contacts.push(Contact::new(answered, seed.addr));
        }

        if contacts.is_empty() {
            if !seeds.is_empty() {
                warn!(seeds = seeds.len(), "no bootstrap seed admitted");
            }
            return Ok(0);
        }
        let entries = self.dht.bootstrap(&contacts).await?;
        info!(seeds = contacts.len(), entries, "joined the mesh");

        self.classify_nat().await;
        if let Err(e) = self.publish_descriptor().await {
            warn!(error = %e, "initial descriptor publish failed");
        }
        Ok(contacts.len())
    }

    // ------------------------------------------------------------------------
    // NAT
    // ------------------------------------------------------------------------

    /// Probe reflectors (configured ones plus close routing contacts) and
    /// update the advertised profile.
    pub async fn classify_nat(&self) -> NatType {
        classify_and_update(
            &self.rpc,
            &self.dht,
            &self.nat,
            &self.config,
            &self.advertised,
            &self.profile,
        )
        .await
    }

    fn spawn_nat_loop(&self) {
        let rpc = self.rpc.clone();
        let dht = self.dht.clone();
        let nat = self.nat.clone();
        let config = self.config.clone();
        let advertised = self.advertised.clone();
        let profile = self.profile.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let period = config.nat.reclassify_interval();
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        classify_and_update(&rpc, &dht, &nat, &config, &advertised, &profile).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            trace!("NAT reclassification stopped");
        });
        self.push_task(handle);
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    // ------------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------------

    /// Sign and store the local descriptor now.
    pub async fn publish_descriptor(&self) -> Result<PeerDescriptor, MeshError> {
        let profile = self.local_profile();
        Ok(self.descriptors.publish_local(&profile).await?)
    }

    /// Never fails; an unknown or invalid peer yields `None`.
    pub async fn find_peer_by_id(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        self.descriptors.find_peer_by_id(peer_id).await
    }

    /// Never fails; lookup problems yield an empty list.
    pub async fn find_peers_by_content(&self, content_id: &[u8]) -> Vec<PeerDescriptor> {
        self.descriptors.find_peers_by_content(content_id).await
    }

    /// Advertise that this node provides `content_id`. Returns how many
    /// remote nodes stored the record.
    pub async fn announce_content(&self, content_id: &[u8]) -> Result<usize, MeshError> {
        Ok(self.descriptors.announce_content(content_id).await?)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Reach `peer_id` and authenticate it.
    ///
    /// Authentication, freshness and rate-limit failures come back as
    /// [`HandshakeOutcome::Rejected`]. Errors are reserved for a peer with
    /// no descriptor, a peer no path reaches, and shutdown. A connect still
    /// in flight when [`MeshNode::shutdown`] is called is abandoned.
    pub async fn connect(&self, peer_id: PeerId) -> Result<HandshakeOutcome, MeshError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(MeshError::ShuttingDown);
        }
        tokio::select! {
            result = self.reach_and_authenticate(peer_id) => result,
            _ = shutdown.wait_for(|stopping| *stopping) => Err(MeshError::ShuttingDown),
        }
    }

    async fn reach_and_authenticate(&self, peer_id: PeerId) -> Result<HandshakeOutcome, MeshError> {
        let permit = match self.handshaker.admit_outbound(peer_id) {
            Ok(permit) => permit,
            Err(reason) => return Ok(HandshakeOutcome::Rejected(reason)),
        };

        let was_cached = self.descriptors.cached(&peer_id).is_some();
        let descriptor = self
            .find_peer_by_id(&peer_id)
            .await
            .ok_or(MeshError::DescriptorNotFound(peer_id))?;
        let traversed = match self.nat.connect(&descriptor).await {
            Ok(traversed) => traversed,
            Err(MeshError::PeerUnreachable(_)) if was_cached => {
                debug!(peer = %peer_id.short(), "cached descriptor unreachable, looking up again");
                self.descriptors.invalidate(&peer_id);
                let fresh = self
                    .find_peer_by_id(&peer_id)
                    .await
                    .ok_or(MeshError::DescriptorNotFound(peer_id))?;
                let traversed = self.nat.connect(&fresh).await?;
                return Ok(self.finish_outbound(permit, traversed, &fresh).await);
            }
            Err(e) => return Err(e),
        };
        Ok(self.finish_outbound(permit, traversed, &descriptor).await)
    }

    async fn finish_outbound(
        &self,
        permit: crate::connection::HandshakePermit,
        traversed: crate::nat::TraversedStream,
        descriptor: &PeerDescriptor,
    ) -> HandshakeOutcome {
        // A relayed stream's TCP peer is the relay, not the target.
        let remote = match traversed.via {
            EndpointKind::Relay => None,
            EndpointKind::Direct | EndpointKind::HolePunch => traversed.endpoint.socket_addr(),
        };
        let outcome = self
            .handshaker
            .connect(
                permit,
                traversed.stream,
                remote,
                descriptor.peer_id,
                &descriptor.certificate_pins,
            )
            .await;
        match &outcome {
            HandshakeOutcome::Accepted(stream) => {
                info!(peer = %stream.peer_id.short(), via = ?traversed.via, "outbound connection authenticated");
            }
            HandshakeOutcome::Rejected(reason) => {
                debug!(peer = %descriptor.peer_id.short(), %reason, "outbound handshake rejected");
            }
        }
        outcome
    }

    /// Authenticated inbound streams. Can be taken once.
    pub async fn incoming(&self) -> Option<mpsc::Receiver<AuthenticatedStream>> {
        self.incoming.lock().await.take()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.dht.quit().await;
        if let Some(relay) = &self.relay_server {
            relay.quit().await;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        info!(peer = %self.peer_id().short(), "mesh node stopped");
    }
}

async fn classify_and_update(
    rpc: &RpcEndpoint,
    dht: &DhtNode<RpcEndpoint>,
    nat: &NatTraversal,
    config: &MeshConfig,
    advertised: &Advertised,
    profile: &watch::Sender<LocalProfile>,
) -> NatType {
    let mut reflectors = config.nat.reflectors.clone();
    for contact in dht.find_closest(&dht.peer_id(), REFLECTORS_FROM_ROUTING).await {
        if !reflectors.contains(&contact.addr) {
            reflectors.push(contact.addr);
        }
    }
    if reflectors.is_empty() {
        trace!("no reflectors known, NAT classification skipped");
        return nat.nat_type();
    }
    let local = match rpc.local_addr() {
        Ok(bound) => SocketAddr::new(advertised.overlay.ip(), bound.port()),
        Err(e) => {
            debug!(error = %e, "RPC socket address unavailable");
            return nat.nat_type();
        }
    };
    let nat_type = nat
        .classify_with(rpc, local, &reflectors, config.nat.probe_timeout())
        .await;
    let reflexive = *nat.reflexive().borrow();
    let updated = advertised.profile(nat_type, reflexive);
    profile.send_if_modified(|current| {
        if *current == updated {
            false
        } else {
            *current = updated;
            true
        }
    });
    nat_type
}

fn deliver(incoming: &mpsc::Sender<AuthenticatedStream>, outcome: HandshakeOutcome) {
    match outcome {
        HandshakeOutcome::Accepted(stream) => {
            let peer = stream.peer_id;
            if incoming.try_send(stream).is_err() {
                debug!(peer = %peer.short(), "incoming queue full or closed, dropping connection");
            }
        }
        HandshakeOutcome::Rejected(reason) => trace!(%reason, "inbound handshake rejected"),
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    handshaker: Arc<OverlayHandshaker>,
    incoming: mpsc::Sender<AuthenticatedStream>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Handshakes in flight; aborted when the loop stops.
        let mut handshakes = JoinSet::new();
        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        debug!(error = %e, "overlay accept failed");
                        continue;
                    }
                },
                Some(_) = handshakes.join_next() => continue,
                _ = shutdown.changed() => break,
            };
            let _ = stream.set_nodelay(true);
            let handshaker = handshaker.clone();
            let incoming = incoming.clone();
            handshakes.spawn(async move {
                let outcome = handshaker.accept(Box::new(stream), Some(remote), None).await;
                deliver(&incoming, outcome);
            });
        }
        handshakes.shutdown().await;
        trace!("overlay accept loop stopped");
    })
}

fn spawn_relay_events(
    mut events: mpsc::Receiver<RelayEvent>,
    handshaker: Arc<OverlayHandshaker>,
    incoming: mpsc::Sender<AuthenticatedStream>,
    rpc: RpcEndpoint,
    punch_window: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut children = JoinSet::new();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(_) = children.join_next() => continue,
                _ = shutdown.changed() => break,
            };
            match event {
                RelayEvent::Incoming { from, relay, stream } => {
                    trace!(peer = %from.short(), %relay, "relayed inbound stream");
                    let handshaker = handshaker.clone();
                    let incoming = incoming.clone();
                    children.spawn(async move {
                        let outcome = handshaker.accept(Box::new(stream), None, Some(from)).await;
                        deliver(&incoming, outcome);
                    });
                }
                RelayEvent::PunchRequested {
                    from,
                    peer_reflexive,
                    nonce,
                } => {
                    let rpc = rpc.clone();
                    children.spawn(async move {
                        match rpc.punch(peer_reflexive, nonce, punch_window).await {
                            Ok(Some(_)) => debug!(peer = %from.short(), "answered punch"),
                            Ok(None) => debug!(peer = %from.short(), "punch window elapsed"),
                            Err(e) => debug!(peer = %from.short(), error = %e, "punch failed"),
                        }
                    });
                }
            }
        }
        children.shutdown().await;
        trace!("relay event loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints_of_kind(profile: &LocalProfile, kind: EndpointKind) -> Vec<&TransportEndpoint> {
        profile.endpoints.iter().filter(|e| e.kind == kind).collect()
    }

    #[test]
    fn profile_advertises_punch_endpoint_only_behind_nat_with_relay() {
        let advertised = Advertised {
            overlay: "192.0.2.10:7000".parse().unwrap(),
            relays: vec!["198.51.100.1:7100".parse().unwrap()],
        };
        let reflexive = Some("203.0.113.5:41000".parse().unwrap());

        let open = advertised.profile(NatType::Open, reflexive);
        let kinds: Vec<EndpointKind> = open.endpoints.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EndpointKind::Direct, EndpointKind::Relay]);

        let natted = advertised.profile(NatType::PortRestrictedCone, reflexive);
        let punch = endpoints_of_kind(&natted, EndpointKind::HolePunch);
        assert_eq!(punch.len(), 1);
        assert_eq!(punch[0].socket_addr(), Some("203.0.113.5:7000".parse().unwrap()));

        let no_relay = Advertised {
            relays: Vec::new(),
            ..advertised
        };
        let no_punch = no_relay.profile(NatType::FullCone, reflexive);
        assert!(endpoints_of_kind(&no_punch, EndpointKind::HolePunch).is_empty());
    }

    #[test]
    fn advertise_host_must_be_an_ip() {
        let mut config = MeshConfig::local();
        config.advertise_host = Some("mesh.example".into());
        assert!(matches!(
            advertised_ip(&config, IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Err(MeshError::Config(_))
        ));
        config.advertise_host = None;
        assert_eq!(
            advertised_ip(&config, IpAddr::V4(Ipv4Addr::UNSPECIFIED)).unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[tokio::test]
    async fn certificate_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeshConfig::local();
        config.data_dir = Some(dir.path().to_path_buf());

        let first = MeshNode::start(config.clone()).await.unwrap();
        let (peer_id, thumbprint) = (first.peer_id(), first.certificate_thumbprint().to_string());
        first.shutdown().await;

        let second = MeshNode::start(config).await.unwrap();
        assert_eq!(second.peer_id(), peer_id);
        assert_eq!(second.certificate_thumbprint(), thumbprint);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_identity_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.key"), b"short").unwrap();
        let mut config = MeshConfig::local();
        config.data_dir = Some(dir.path().to_path_buf());
        assert!(matches!(
            MeshNode::start(config).await,
            Err(MeshError::CorruptIdentity { .. })
        ));
    }
}
