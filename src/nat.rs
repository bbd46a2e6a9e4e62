//! # NAT Traversal
//!
//! Classifies the local NAT from binding probes and picks a path to a peer
//! through the bounded chain **direct → hole punch → relay**.
//!
//! ## Classification
//!
//! Binding probes go to at least two reflectors over the node's UDP socket:
//!
//! | Observation | Class |
//! |-------------|-------|
//! | no reflector answered | `Unknown` |
//! | reflectors saw different mapped addresses | `Symmetric` |
//! | mapped address equals the local address | `Open` |
//! | a different host could reach the mapping | `FullCone` |
//! | only a different port on the same host could | `RestrictedCone` |
//! | neither could | `PortRestrictedCone` |
//!
//! ## Path Selection
//!
//! Direct endpoints are always tried first. Hole punching needs a relay to
//! introduce the peers and is skipped when both sides are symmetric, since
//! neither mapping is predictable. Relay is the last resort; when it fails
//! too the peer is reported unreachable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::descriptor::{EndpointKind, PeerDescriptor, TransportEndpoint};
use crate::error::MeshError;
use crate::messages::BindingMode;
use crate::protocols::{BoxedStream, Transport};
use crate::rpc::RpcEndpoint;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    Unknown,
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

impl NatType {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            NatType::Unknown => 0,
            NatType::Open => 1,
            NatType::FullCone => 2,
            NatType::RestrictedCone => 3,
            NatType::PortRestrictedCone => 4,
            NatType::Symmetric => 5,
        }
    }
}

/// Where a traversal attempt currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatState {
    Classifying,
    DirectCandidate,
    HolePunching,
    Relayed,
    Established,
    /// Every path failed.
    Failed,
}

impl NatState {
    fn attempting(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Direct => NatState::DirectCandidate,
            EndpointKind::HolePunch => NatState::HolePunching,
            EndpointKind::Relay => NatState::Relayed,
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeResults {
    /// Address the probing socket is bound to, as this node would advertise it.
    pub local: Option<SocketAddr>,
    /// Mapped address reported by each reflector that answered.
    pub observed: Vec<SocketAddr>,
    pub change_port_answered: bool,
    pub change_address_answered: bool,
}

pub fn classify(results: &ProbeResults) -> NatType {
    let Some(first) = results.observed.first() else {
        return NatType::Unknown;
    };
    if results.observed.iter().any(|o| o != first) {
        return NatType::Symmetric;
    }
    if results.local == Some(*first) {
        return NatType::Open;
    }
    if results.change_address_answered {
        NatType::FullCone
    } else if results.change_port_answered {
        NatType::RestrictedCone
    } else {
        NatType::PortRestrictedCone
    }
}

/// Send binding probes from `rpc` to each reflector.
pub async fn probe(rpc: &RpcEndpoint, local: SocketAddr, reflectors: &[SocketAddr], timeout: Duration) -> ProbeResults {
    let mut results = ProbeResults {
        local: Some(local),
        ..ProbeResults::default()
    };
    for reflector in reflectors {
        match rpc.binding(*reflector, BindingMode::Basic, timeout).await {
            Ok(Some(observed)) => results.observed.push(observed),
            Ok(None) => {}
            Err(e) => debug!(%reflector, error = %e, "binding probe failed"),
        }
    }
    // Filtering probes only mean something once a mapping exists.
    if let Some(reflector) = reflectors.first()
        && !results.observed.is_empty()
    {
        results.change_port_answered = matches!(
            rpc.binding(*reflector, BindingMode::ChangePort, timeout).await,
            Ok(Some(_))
        );
        results.change_address_answered = matches!(
            rpc.binding(*reflector, BindingMode::ChangeAddress, timeout).await,
            Ok(Some(_))
        );
    }
    trace!(?results, "binding probes complete");
    results
}

// ============================================================================
// Path Selection
// ============================================================================

/// The ordered kinds of path worth trying to reach `target`.
pub fn plan_path(local: NatType, target: &PeerDescriptor) -> Vec<EndpointKind> {
    let has = |kind| !target.endpoints_of(kind).is_empty();
    let mut plan = Vec::with_capacity(3);
    if has(EndpointKind::Direct) {
        plan.push(EndpointKind::Direct);
    }
    let both_symmetric = local == NatType::Symmetric && target.nat_type == NatType::Symmetric;
    if !both_symmetric && has(EndpointKind::HolePunch) && has(EndpointKind::Relay) {
        plan.push(EndpointKind::HolePunch);
    }
    if has(EndpointKind::Relay) {
        plan.push(EndpointKind::Relay);
    }
    plan
}

fn ordered_endpoints(target: &PeerDescriptor, kind: EndpointKind) -> Vec<TransportEndpoint> {
    let mut endpoints: Vec<TransportEndpoint> = target.endpoints_of(kind).into_iter().cloned().collect();
    endpoints.sort_by(|a, b| b.preference.cmp(&a.preference).then(a.cost.cmp(&b.cost)));
    endpoints
}

/// A raw stream to a peer and how it was obtained.
pub struct TraversedStream {
    pub stream: BoxedStream,
    pub via: EndpointKind,
    pub endpoint: TransportEndpoint,
}

impl std::fmt::Debug for TraversedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversedStream")
            .field("via", &self.via)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// ============================================================================
// NatTraversal
// ============================================================================

pub struct NatTraversal {
    transports: HashMap<EndpointKind, Arc<dyn Transport>>,
    attempt_timeout: Duration,
    nat_type: watch::Sender<NatType>,
    reflexive: watch::Sender<Option<SocketAddr>>,
}

impl NatTraversal {
    pub fn new(attempt_timeout: Duration) -> Self {
        let (nat_type, _) = watch::channel(NatType::Unknown);
        let (reflexive, _) = watch::channel(None);
        Self {
            transports: HashMap::new(),
            attempt_timeout,
            nat_type,
            reflexive,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn nat_type(&self) -> NatType {
        *self.nat_type.borrow()
    }

    /// Our mapped UDP address as last reported by a reflector.
    pub fn reflexive(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.reflexive.subscribe()
    }

    /// Record a classification outcome.
    pub fn apply_probe_results(&self, results: &ProbeResults) -> NatType {
        let nat_type = classify(results);
        let previous = self.nat_type.send_replace(nat_type);
        if previous != nat_type {
            info!(?previous, current = ?nat_type, "NAT classification changed");
        }
        if let Some(observed) = results.observed.first() {
            self.reflexive.send_replace(Some(*observed));
        }
        nat_type
    }

    /// Probe `reflectors` and update the classification.
    pub async fn classify_with(
        &self,
        rpc: &RpcEndpoint,
        local: SocketAddr,
        reflectors: &[SocketAddr],
        timeout: Duration,
    ) -> NatType {
        trace!(state = ?NatState::Classifying, reflectors = reflectors.len(), "classifying NAT");
        let results = probe(rpc, local, reflectors, timeout).await;
        self.apply_probe_results(&results)
    }

    /// Walk the fallback chain until one path yields a stream.
    pub async fn connect(&self, target: &PeerDescriptor) -> Result<TraversedStream, MeshError> {
        let plan = plan_path(self.nat_type(), target);
        debug!(peer = %target.peer_id.short(), ?plan, "planned traversal");

        for kind in plan {
            let Some(transport) = self.transports.get(&kind) else {
                trace!(?kind, "no transport for path kind");
                continue;
            };
            let state = NatState::attempting(kind);
            for endpoint in ordered_endpoints(target, kind) {
                trace!(peer = %target.peer_id.short(), ?state, host = %endpoint.host, port = endpoint.port, "attempting path");
                match tokio::time::timeout(self.attempt_timeout, transport.connect(&endpoint, target)).await {
                    Ok(Ok(stream)) => {
                        debug!(
                            peer = %target.peer_id.short(),
                            state = ?NatState::Established,
                            via = ?kind,
                            "path established"
                        );
                        return Ok(TraversedStream {
                            stream,
                            via: kind,
                            endpoint,
                        });
                    }
                    Ok(Err(e)) => debug!(peer = %target.peer_id.short(), ?kind, error = %e, "path failed"),
                    Err(_) => debug!(peer = %target.peer_id.short(), ?kind, "path timed out"),
                }
            }
        }

        debug!(peer = %target.peer_id.short(), state = ?NatState::Failed, "all paths exhausted");
        Err(MeshError::PeerUnreachable(target.peer_id))
    }
}

impl std::fmt::Debug for NatTraversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTraversal")
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("nat_type", &self.nat_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn classification_rules() {
        let local = addr("192.168.1.5:4000");
        let mapped = addr("203.0.113.1:50000");

        assert_eq!(classify(&ProbeResults::default()), NatType::Unknown);

        let open = ProbeResults {
            local: Some(local),
            observed: vec![local, local],
            ..Default::default()
        };
        assert_eq!(classify(&open), NatType::Open);

        let symmetric = ProbeResults {
            local: Some(local),
            observed: vec![mapped, addr("203.0.113.1:50001")],
            change_address_answered: true,
            ..Default::default()
        };
        assert_eq!(classify(&symmetric), NatType::Symmetric);

        let cone = |port, address| ProbeResults {
            local: Some(local),
            observed: vec![mapped, mapped],
            change_port_answered: port,
            change_address_answered: address,
        };
        assert_eq!(classify(&cone(true, true)), NatType::FullCone);
        assert_eq!(classify(&cone(true, false)), NatType::RestrictedCone);
        assert_eq!(classify(&cone(false, false)), NatType::PortRestrictedCone);
    }

    fn descriptor(nat_type: NatType, kinds: &[EndpointKind]) -> PeerDescriptor {
        let mut d = PeerDescriptor::unsigned(Keypair::generate().public_key(), 1, u64::MAX);
        d.nat_type = nat_type;
        for (i, kind) in kinds.iter().enumerate() {
            let mut endpoint = TransportEndpoint::direct(addr(&format!("198.51.100.{}:7000", i + 1)));
            endpoint.kind = *kind;
            d.endpoints.push(endpoint);
        }
        d
    }

    #[test]
    fn plan_orders_direct_punch_relay() {
        let all = [EndpointKind::Relay, EndpointKind::HolePunch, EndpointKind::Direct];
        let d = descriptor(NatType::PortRestrictedCone, &all);
        assert_eq!(
            plan_path(NatType::FullCone, &d),
            vec![EndpointKind::Direct, EndpointKind::HolePunch, EndpointKind::Relay]
        );
    }

    #[test]
    fn symmetric_pairs_skip_punching() {
        let d = descriptor(NatType::Symmetric, &[EndpointKind::HolePunch, EndpointKind::Relay]);
        assert_eq!(plan_path(NatType::Symmetric, &d), vec![EndpointKind::Relay]);
        assert_eq!(
            plan_path(NatType::RestrictedCone, &d),
            vec![EndpointKind::HolePunch, EndpointKind::Relay]
        );
    }

    #[test]
    fn punching_requires_a_rendezvous_relay() {
        let d = descriptor(NatType::FullCone, &[EndpointKind::HolePunch]);
        assert!(plan_path(NatType::FullCone, &d).is_empty());
    }

    struct FakeTransport {
        kind: EndpointKind,
        succeed: bool,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(kind: EndpointKind, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                succeed,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> EndpointKind {
            self.kind
        }

        async fn connect(&self, _endpoint: &TransportEndpoint, _target: &PeerDescriptor) -> Result<BoxedStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.succeed {
                bail!("unreachable");
            }
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }
    }

    #[tokio::test]
    async fn falls_back_to_relay() {
        let direct = FakeTransport::new(EndpointKind::Direct, false);
        let punch = FakeTransport::new(EndpointKind::HolePunch, false);
        let relay = FakeTransport::new(EndpointKind::Relay, true);
        let nat = NatTraversal::new(Duration::from_secs(1))
            .with_transport(direct.clone())
            .with_transport(punch.clone())
            .with_transport(relay.clone());

        let d = descriptor(
            NatType::PortRestrictedCone,
            &[EndpointKind::Direct, EndpointKind::HolePunch, EndpointKind::Relay],
        );
        let traversed = nat.connect(&d).await.unwrap();
        assert_eq!(traversed.via, EndpointKind::Relay);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
        assert_eq!(punch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_is_unreachable() {
        let nat = NatTraversal::new(Duration::from_secs(1))
            .with_transport(FakeTransport::new(EndpointKind::Direct, false))
            .with_transport(FakeTransport::new(EndpointKind::Relay, false));
        let d = descriptor(NatType::Unknown, &[EndpointKind::Direct, EndpointKind::Relay]);
        match nat.connect(&d).await {
            Err(MeshError::PeerUnreachable(peer)) => assert_eq!(peer, d.peer_id),
            other => panic!("expected unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn symmetric_pair_never_attempts_punch() {
        let punch = FakeTransport::new(EndpointKind::HolePunch, true);
        let relay = FakeTransport::new(EndpointKind::Relay, true);
        let nat = NatTraversal::new(Duration::from_secs(1))
            .with_transport(punch.clone())
            .with_transport(relay);
        nat.apply_probe_results(&ProbeResults {
            local: Some(addr("10.0.0.2:4000")),
            observed: vec![addr("203.0.113.1:1"), addr("203.0.113.1:2")],
            ..Default::default()
        });
        assert_eq!(nat.nat_type(), NatType::Symmetric);

        let d = descriptor(NatType::Symmetric, &[EndpointKind::HolePunch, EndpointKind::Relay]);
        let traversed = nat.connect(&d).await.unwrap();
        assert_eq!(traversed.via, EndpointKind::Relay);
        assert_eq!(punch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_results_update_reflexive_address() {
        let nat = NatTraversal::new(Duration::from_secs(1));
        let reflexive = nat.reflexive();
        let mapped = addr("203.0.113.1:50000");
        nat.apply_probe_results(&ProbeResults {
            local: Some(addr("10.0.0.2:4000")),
            observed: vec![mapped],
            ..Default::default()
        });
        assert_eq!(*reflexive.borrow(), Some(mapped));
        assert_eq!(nat.nat_type(), NatType::PortRestrictedCone);
    }
}
