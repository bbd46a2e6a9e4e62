//! # Overlay Connections
//!
//! Mutual TLS plus a signed application hello that binds the TLS session
//! to a PeerId.
//!
//! ## Handshake States
//!
//! | State | Bound | Failure recorded as |
//! |-------|-------|---------------------|
//! | admission | rate limiter + handshake cap, no I/O | none (fast reject) |
//! | `Connecting` | `connect_timeout` (outbound, in the caller) | - |
//! | `TlsHandshake` | `tls_timeout` | `HandshakeFailure` / `HandshakeTimeout` |
//! | `AppHandshake` | `hello_timeout` | see below |
//! | `Authenticated` → `Active` | - | - |
//!
//! ## Hello Checks
//!
//! Each side sends `Hello{peer_id, public_key, nonce, signature}` where the
//! signature covers `nonce ‖ peer_id ‖ own certificate thumbprint`. The
//! receiver then checks, in order:
//!
//! 1. the signature against the advertised key (`SignatureInvalid`)
//! 2. `peer_id == derive(public_key)` (`IdentityMismatch`)
//! 3. the TLS certificate carries the same key (`IdentityMismatch`)
//! 4. outbound only: the peer is the one we dialed (`IdentityMismatch`) and
//!    its certificate is one its signed descriptor advertises (`PinViolation`)
//! 5. the certificate thumbprint against the pin store (`PinViolation`)
//!
//! Every failure is reported to the [`RateLimiter`] before the stream is
//! dropped, so repeated failures from one source get it fast-rejected at
//! admission.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, trace};

use crate::config::ConnectionSettings;
use crate::crypto::{
    certificate_thumbprint, extract_public_key_from_cert, sign_with_domain, verify_with_domain, TlsMaterial,
    HELLO_SIGNATURE_DOMAIN,
};
use crate::events;
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{read_frame, write_frame, Hello};
use crate::pins::{CertificatePinStore, PinOutcome};
use crate::protocols::BoxedStream;
use crate::ratelimit::{Admission, Counter, RateLimiter, SourceKey, ViolationType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    TlsHandshake,
    AppHandshake,
    Authenticated,
    Active,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a handshake did not produce an authenticated stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The source is throttled or quarantined; no handshake work was done.
    RateLimited(Admission),
    /// Too many handshakes in flight.
    AtCapacity,
    Timeout(ConnectionState),
    TlsFailed,
    /// The peer presented no usable certificate.
    MissingCertificate,
    Malformed,
    SignatureInvalid,
    IdentityMismatch,
    /// The certificate key differs from the hello key.
    CertificateMismatch,
    UnexpectedPeer { expected: PeerId, actual: PeerId },
    PinViolation { pinned: String, presented: String },
}

impl RejectReason {
    /// The violation this rejection is recorded as, if any.
    pub fn violation(&self) -> Option<ViolationType> {
        match self {
            RejectReason::RateLimited(_) | RejectReason::AtCapacity => None,
            RejectReason::Timeout(_) => Some(ViolationType::HandshakeTimeout),
            RejectReason::TlsFailed | RejectReason::MissingCertificate => Some(ViolationType::HandshakeFailure),
            RejectReason::Malformed => Some(ViolationType::MalformedMessage),
            RejectReason::SignatureInvalid => Some(ViolationType::SignatureInvalid),
            RejectReason::IdentityMismatch
            | RejectReason::CertificateMismatch
            | RejectReason::UnexpectedPeer { .. } => Some(ViolationType::IdentityMismatch),
            RejectReason::PinViolation { .. } => Some(ViolationType::PinViolation),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::RateLimited(admission) => write!(f, "rate limited ({admission:?})"),
            RejectReason::AtCapacity => write!(f, "handshake capacity exhausted"),
            RejectReason::Timeout(state) => write!(f, "timed out in {state:?}"),
            RejectReason::TlsFailed => write!(f, "TLS handshake failed"),
            RejectReason::MissingCertificate => write!(f, "no peer certificate"),
            RejectReason::Malformed => write!(f, "malformed hello"),
            RejectReason::SignatureInvalid => write!(f, "hello signature invalid"),
            RejectReason::IdentityMismatch => write!(f, "PeerId does not match public key"),
            RejectReason::CertificateMismatch => write!(f, "certificate key does not match hello key"),
            RejectReason::UnexpectedPeer { expected, actual } => {
                write!(f, "expected {} but reached {}", expected.short(), actual.short())
            }
            RejectReason::PinViolation { .. } => write!(f, "certificate differs from pinned certificate"),
        }
    }
}

// ============================================================================
// Authenticated Stream
// ============================================================================

/// A TLS stream whose remote end proved ownership of `peer_id`.
pub struct AuthenticatedStream {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub thumbprint: String,
    pub pin: PinOutcome,
    pub direction: Direction,
    pub remote_addr: Option<SocketAddr>,
    stream: TlsStream<BoxedStream>,
}

impl AuthenticatedStream {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::Active
    }

    pub fn into_inner(self) -> TlsStream<BoxedStream> {
        self.stream
    }
}

impl std::fmt::Debug for AuthenticatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedStream")
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("pin", &self.pin)
            .finish()
    }
}

impl AsyncRead for AuthenticatedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for AuthenticatedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    Accepted(AuthenticatedStream),
    Rejected(RejectReason),
}

impl HandshakeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandshakeOutcome::Accepted(_))
    }
}

// ============================================================================
// Hello
// ============================================================================

fn hello_payload(nonce: &[u8; 32], peer_id: &PeerId, thumbprint: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 32 + thumbprint.len());
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(peer_id.as_bytes());
    payload.extend_from_slice(thumbprint.as_bytes());
    payload
}

pub fn build_hello(keypair: &Keypair, own_thumbprint: &str) -> Hello {
    let nonce: [u8; 32] = rand::random();
    let peer_id = keypair.peer_id();
    let signature = sign_with_domain(keypair, HELLO_SIGNATURE_DOMAIN, &hello_payload(&nonce, &peer_id, own_thumbprint));
    Hello {
        peer_id,
        public_key: keypair.public_key(),
        nonce,
        signature,
    }
}

/// Checks 1–3: signature, identity binding, certificate key.
pub fn verify_hello(hello: &Hello, peer_thumbprint: &str, peer_cert_key: &[u8; 32]) -> Result<PeerId, RejectReason> {
    let payload = hello_payload(&hello.nonce, &hello.peer_id, peer_thumbprint);
    verify_with_domain(&hello.public_key, HELLO_SIGNATURE_DOMAIN, &payload, &hello.signature)
        .map_err(|_| RejectReason::SignatureInvalid)?;
    if PeerId::derive(&hello.public_key) != hello.peer_id {
        return Err(RejectReason::IdentityMismatch);
    }
    if hello.public_key.as_bytes() != peer_cert_key {
        return Err(RejectReason::CertificateMismatch);
    }
    Ok(hello.peer_id)
}

// ============================================================================
// Handshaker
// ============================================================================

/// Admission ticket for one handshake. Holds a handshake slot until dropped.
#[derive(Debug)]
pub struct HandshakePermit {
    _slot: OwnedSemaphorePermit,
}

pub struct OverlayHandshaker {
    keypair: Arc<Keypair>,
    tls: TlsMaterial,
    pins: Arc<CertificatePinStore>,
    limiter: Arc<RateLimiter>,
    settings: ConnectionSettings,
    slots: Arc<Semaphore>,
}

impl std::fmt::Debug for OverlayHandshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHandshaker")
            .field("peer_id", &self.keypair.peer_id())
            .field("policy", &self.tls.policy)
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

/// What an outbound handshake must find at the other end.
#[derive(Clone, Copy)]
struct Expected<'a> {
    peer_id: PeerId,
    pins: &'a [String],
}

/// Who to blame for a failure, as far as it is known.
#[derive(Clone, Copy)]
struct Blame {
    ip: Option<IpAddr>,
    peer: Option<PeerId>,
}

impl Blame {
    fn source(&self) -> Option<SourceKey> {
        self.peer
            .map(SourceKey::Peer)
            .or(self.ip.map(SourceKey::Addr))
    }

    fn describe(&self) -> String {
        match (self.peer, self.ip) {
            (Some(peer), _) => peer.short(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "unknown".to_string(),
        }
    }
}

impl OverlayHandshaker {
    pub fn new(
        keypair: Arc<Keypair>,
        tls: TlsMaterial,
        pins: Arc<CertificatePinStore>,
        limiter: Arc<RateLimiter>,
        settings: ConnectionSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_handshakes.max(1)));
        Self {
            keypair,
            tls,
            pins,
            limiter,
            settings,
            slots,
        }
    }

    fn admit(&self, keys: &[SourceKey]) -> Result<HandshakePermit, RejectReason> {
        for key in keys {
            let admission = self.limiter.admit(*key, Counter::ConnectionAttempt);
            if !admission.is_allowed() {
                debug!(source = %key, ?admission, "handshake fast-rejected");
                return Err(RejectReason::RateLimited(admission));
            }
        }
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RejectReason::AtCapacity)?;
        Ok(HandshakePermit { _slot: slot })
    }

    /// Admission for an outbound connection, before any network work.
    pub fn admit_outbound(&self, expected: PeerId) -> Result<HandshakePermit, RejectReason> {
        self.admit(&[SourceKey::Peer(expected)])
    }

    /// Inbound handshake on an accepted stream. `claimed` is the PeerId a
    /// relay vouched for, when the stream arrived through one.
    pub async fn accept(
        &self,
        stream: BoxedStream,
        remote: Option<SocketAddr>,
        claimed: Option<PeerId>,
    ) -> HandshakeOutcome {
        let mut keys = Vec::with_capacity(2);
        if let Some(addr) = remote {
            keys.push(SourceKey::Addr(addr.ip()));
        }
        if let Some(peer) = claimed {
            keys.push(SourceKey::Peer(peer));
        }
        let permit = match self.admit(&keys) {
            Ok(p) => p,
            Err(reason) => return HandshakeOutcome::Rejected(reason),
        };
        let blame = Blame {
            ip: remote.map(|a| a.ip()),
            peer: claimed,
        };
        self.handshake(permit, stream, remote, Direction::Inbound, None, blame).await
    }

    /// Outbound handshake over a stream the transport layer opened.
    ///
    /// `advertised_pins` are the thumbprints from the peer's signed
    /// descriptor; when non-empty the presented certificate must be one of
    /// them.
    pub async fn connect(
        &self,
        permit: HandshakePermit,
        stream: BoxedStream,
        remote: Option<SocketAddr>,
        expected: PeerId,
        advertised_pins: &[String],
    ) -> HandshakeOutcome {
        let blame = Blame {
            ip: remote.map(|a| a.ip()),
            peer: Some(expected),
        };
        let expected = Expected {
            peer_id: expected,
            pins: advertised_pins,
        };
        self.handshake(permit, stream, remote, Direction::Outbound, Some(expected), blame)
            .await
    }

    fn reject(&self, reason: RejectReason, blame: Blame) -> HandshakeOutcome {
        if let Some(violation) = reason.violation() {
            events::emit(violation.event(), &blame.describe(), &reason.to_string());
            match blame.source() {
                Some(source) => {
                    self.limiter.record_violation(violation, source, blame.ip);
                }
                None => debug!(?violation, "violation without attributable source"),
            }
        }
        HandshakeOutcome::Rejected(reason)
    }

    async fn handshake(
        &self,
        _permit: HandshakePermit,
        stream: BoxedStream,
        remote: Option<SocketAddr>,
        direction: Direction,
        expected: Option<Expected<'_>>,
        mut blame: Blame,
    ) -> HandshakeOutcome {
        trace!(?direction, ?remote, state = ?ConnectionState::TlsHandshake, "starting handshake");
        let mut tls = match self.tls_handshake(stream, direction).await {
            Ok(tls) => tls,
            Err(reason) => return self.reject(reason, blame),
        };

        let (thumbprint, cert_key) = match peer_certificate(&tls) {
            Some(cert) => cert,
            None => return self.reject(RejectReason::MissingCertificate, blame),
        };

        trace!(?direction, state = ?ConnectionState::AppHandshake, "exchanging hello");
        let hello = match tokio::time::timeout(self.settings.hello_timeout(), self.exchange_hello(&mut tls)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(reason)) => return self.reject(reason, blame),
            Err(_) => return self.reject(RejectReason::Timeout(ConnectionState::AppHandshake), blame),
        };

        let peer_id = match verify_hello(&hello, &thumbprint, &cert_key) {
            Ok(peer_id) => peer_id,
            Err(reason) => return self.reject(reason, blame),
        };
        // From here on the key that signed the hello is accountable.
        blame.peer = Some(peer_id);

        if let Some(expected) = expected {
            if expected.peer_id != peer_id {
                return self.reject(
                    RejectReason::UnexpectedPeer {
                        expected: expected.peer_id,
                        actual: peer_id,
                    },
                    blame,
                );
            }
            if let Some(advertised) = expected.pins.first()
                && !expected.pins.contains(&thumbprint)
            {
                return self.reject(
                    RejectReason::PinViolation {
                        pinned: advertised.clone(),
                        presented: thumbprint,
                    },
                    blame,
                );
            }
        }

        let pin = self.pins.check_and_pin(&peer_id, &thumbprint);
        if let PinOutcome::Violation { pinned } = pin {
            return self.reject(
                RejectReason::PinViolation {
                    pinned,
                    presented: thumbprint,
                },
                blame,
            );
        }

        debug!(
            peer = %peer_id.short(),
            ?direction,
            ?remote,
            ?pin,
            state = ?ConnectionState::Authenticated,
            "overlay connection authenticated"
        );
        HandshakeOutcome::Accepted(AuthenticatedStream {
            peer_id,
            public_key: hello.public_key,
            thumbprint,
            pin,
            direction,
            remote_addr: remote,
            stream: tls,
        })
    }

    async fn tls_handshake(&self, stream: BoxedStream, direction: Direction) -> Result<TlsStream<BoxedStream>, RejectReason> {
        let timeout = self.settings.tls_timeout();
        let result = match direction {
            Direction::Inbound => {
                let acceptor = TlsAcceptor::from(self.tls.server.clone());
                tokio::time::timeout(timeout, acceptor.accept(stream))
                    .await
                    .map(|r| r.map(TlsStream::from))
            }
            Direction::Outbound => {
                let server_name = TlsMaterial::server_name().map_err(|_| RejectReason::TlsFailed)?;
                let connector = TlsConnector::from(self.tls.client.clone());
                tokio::time::timeout(timeout, connector.connect(server_name, stream))
                    .await
                    .map(|r| r.map(TlsStream::from))
            }
        };
        match result {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => {
                debug!(?direction, error = %e, "TLS handshake failed");
                Err(RejectReason::TlsFailed)
            }
            Err(_) => Err(RejectReason::Timeout(ConnectionState::TlsHandshake)),
        }
    }

    async fn exchange_hello(&self, tls: &mut TlsStream<BoxedStream>) -> Result<Hello, RejectReason> {
        let ours = build_hello(&self.keypair, &self.tls.thumbprint);
        write_frame(tls, &ours).await.map_err(|_| RejectReason::TlsFailed)?;
        read_frame(tls).await.map_err(|_| RejectReason::Malformed)
    }
}

fn peer_certificate(tls: &TlsStream<BoxedStream>) -> Option<(String, [u8; 32])> {
    let certs = match tls {
        TlsStream::Client(client) => client.get_ref().1.peer_certificates(),
        TlsStream::Server(server) => server.get_ref().1.peer_certificates(),
    }?;
    let cert = certs.first()?;
    let key = extract_public_key_from_cert(cert.as_ref())?;
    Some((certificate_thumbprint(cert.as_ref()), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{RateLimitSettings, TlsVersionPolicy};
    use crate::crypto::generate_identity_certificate;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Side {
        keypair: Arc<Keypair>,
        handshaker: OverlayHandshaker,
        limiter: Arc<RateLimiter>,
    }

    fn side_with(keypair: Arc<Keypair>, pins: Arc<CertificatePinStore>, validity_days: u32, rate: RateLimitSettings) -> Side {
        let cert = generate_identity_certificate(&keypair, validity_days).unwrap();
        let tls = TlsMaterial::new(&keypair, cert, TlsVersionPolicy::StrictLatest).unwrap();
        let limiter = Arc::new(RateLimiter::new(rate, Arc::new(SystemClock)));
        let settings = ConnectionSettings {
            tls_timeout_ms: 2_000,
            hello_timeout_ms: 2_000,
            ..ConnectionSettings::default()
        };
        let handshaker = OverlayHandshaker::new(keypair.clone(), tls, pins, limiter.clone(), settings);
        Side {
            keypair,
            handshaker,
            limiter,
        }
    }

    fn side() -> Side {
        side_with(
            Arc::new(Keypair::generate()),
            Arc::new(CertificatePinStore::in_memory(Arc::new(SystemClock))),
            30,
            RateLimitSettings::default(),
        )
    }

    fn remote() -> Option<SocketAddr> {
        Some("127.0.0.1:40000".parse().unwrap())
    }

    async fn run(client: &Side, server: &Side, expected: PeerId) -> (HandshakeOutcome, HandshakeOutcome) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let permit = client.handshaker.admit_outbound(expected).unwrap();
        tokio::join!(
            client.handshaker.connect(permit, Box::new(a), remote(), expected, &[]),
            server.handshaker.accept(Box::new(b), remote(), None),
        )
    }

    #[tokio::test]
    async fn mutual_authentication_succeeds() {
        let client = side();
        let server = side();
        let (out, inc) = run(&client, &server, server.keypair.peer_id()).await;

        let (HandshakeOutcome::Accepted(mut out), HandshakeOutcome::Accepted(mut inc)) = (out, inc) else {
            panic!("both sides should authenticate");
        };
        assert_eq!(out.peer_id, server.keypair.peer_id());
        assert_eq!(inc.peer_id, client.keypair.peer_id());
        assert_eq!(out.pin, PinOutcome::FirstContact);
        assert_eq!(out.state(), ConnectionState::Active);

        out.write_all(b"over tls").await.unwrap();
        out.flush().await.unwrap();
        let mut buf = [0u8; 8];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tls");
    }

    #[tokio::test]
    async fn second_certificate_for_pinned_peer_is_a_pin_violation() {
        let client_key = Arc::new(Keypair::generate());
        let client_pins = Arc::new(CertificatePinStore::in_memory(Arc::new(SystemClock)));
        let server = side();
        let mut violations = server.limiter.subscribe();

        let first = side_with(client_key.clone(), client_pins.clone(), 30, RateLimitSettings::default());
        let (_, inc) = run(&first, &server, server.keypair.peer_id()).await;
        assert!(inc.is_accepted(), "first contact pins T1");

        // Same identity, freshly generated certificate: thumbprint T2.
        let second = side_with(client_key, client_pins, 31, RateLimitSettings::default());
        let (_, inc) = run(&second, &server, server.keypair.peer_id()).await;
        match inc {
            HandshakeOutcome::Rejected(RejectReason::PinViolation { pinned, presented }) => {
                assert_eq!(pinned, first.handshaker.tls.thumbprint);
                assert_eq!(presented, second.handshaker.tls.thumbprint);
            }
            other => panic!("expected pin violation, got {other:?}"),
        }

        let record = violations.recv().await.unwrap();
        assert_eq!(record.violation, ViolationType::PinViolation);
        assert_eq!(record.source, SourceKey::Peer(second.keypair.peer_id()));
    }

    #[tokio::test]
    async fn dialing_the_wrong_peer_is_rejected() {
        let client = side();
        let server = side();
        let mut violations = client.limiter.subscribe();
        let wanted = Keypair::generate().peer_id();

        let (out, _) = run(&client, &server, wanted).await;
        match out {
            HandshakeOutcome::Rejected(RejectReason::UnexpectedPeer { expected, actual }) => {
                assert_eq!(expected, wanted);
                assert_eq!(actual, server.keypair.peer_id());
            }
            other => panic!("expected unexpected-peer rejection, got {other:?}"),
        }
        let record = violations.recv().await.unwrap();
        assert_eq!(record.violation, ViolationType::IdentityMismatch);
        assert_eq!(record.source, SourceKey::Peer(server.keypair.peer_id()));
        assert_eq!(record.addr, remote().map(|a| a.ip()));
        assert!(client
            .limiter
            .check(SourceKey::Peer(wanted), Counter::ConnectionAttempt)
            .is_allowed());
    }

    #[tokio::test]
    async fn certificate_outside_advertised_pins_is_rejected() {
        let client = side();
        let server = side();
        let expected = server.keypair.peer_id();
        let advertised = vec!["00".repeat(32)];
        let (a, b) = tokio::io::duplex(64 * 1024);
        let permit = client.handshaker.admit_outbound(expected).unwrap();
        let (out, _) = tokio::join!(
            client.handshaker.connect(permit, Box::new(a), remote(), expected, &advertised),
            server.handshaker.accept(Box::new(b), remote(), None),
        );
        assert!(matches!(out, HandshakeOutcome::Rejected(RejectReason::PinViolation { .. })));
        assert!(client.handshaker.pins.get(&expected).is_none(), "nothing pinned on rejection");
    }

    #[test]
    fn hello_checks_catch_each_forgery() {
        let honest = Keypair::generate();
        let other = Keypair::generate();
        let thumbprint = "ab".repeat(32);
        let key = honest.public_key_bytes();

        let hello = build_hello(&honest, &thumbprint);
        assert_eq!(verify_hello(&hello, &thumbprint, &key), Ok(honest.peer_id()));

        // Replayed onto a different certificate.
        assert_eq!(
            verify_hello(&hello, &"cd".repeat(32), &key),
            Err(RejectReason::SignatureInvalid)
        );

        // Valid signature from a genuine identity, claiming someone else's PeerId.
        let mut spoofed = build_hello(&other, &thumbprint);
        spoofed.peer_id = honest.peer_id();
        let payload = hello_payload(&spoofed.nonce, &spoofed.peer_id, &thumbprint);
        spoofed.signature = sign_with_domain(&other, HELLO_SIGNATURE_DOMAIN, &payload);
        assert_eq!(
            verify_hello(&spoofed, &thumbprint, &other.public_key_bytes()),
            Err(RejectReason::IdentityMismatch)
        );

        // Hello key differs from the TLS certificate key.
        let hello = build_hello(&other, &thumbprint);
        assert_eq!(
            verify_hello(&hello, &thumbprint, &key),
            Err(RejectReason::CertificateMismatch)
        );
    }

    #[tokio::test]
    async fn repeated_failures_are_fast_rejected_without_tls() {
        let rate = RateLimitSettings {
            max_handshake_failures: 3,
            ..RateLimitSettings::default()
        };
        let server = side_with(
            Arc::new(Keypair::generate()),
            Arc::new(CertificatePinStore::in_memory(Arc::new(SystemClock))),
            30,
            rate,
        );
        let ip = remote().unwrap().ip();
        for _ in 0..3 {
            server
                .limiter
                .record_violation(ViolationType::HandshakeFailure, SourceKey::Addr(ip), Some(ip));
        }

        let (client_end, server_end) = tokio::io::duplex(1024);
        let outcome = server.handshaker.accept(Box::new(server_end), remote(), None).await;
        assert!(matches!(outcome, HandshakeOutcome::Rejected(RejectReason::RateLimited(_))));

        // Nothing was written: no ServerHello, just EOF once dropped.
        drop(outcome);
        let mut client_end = client_end;
        let mut buf = Vec::new();
        client_end.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_is_recorded() {
        let mut server = side();
        server.handshaker.settings.tls_timeout_ms = 100;
        let mut violations = server.limiter.subscribe();

        let (_client_end, server_end) = tokio::io::duplex(1024);
        let outcome = server.handshaker.accept(Box::new(server_end), remote(), None).await;
        assert!(matches!(
            outcome,
            HandshakeOutcome::Rejected(RejectReason::Timeout(ConnectionState::TlsHandshake))
        ));
        let record = violations.recv().await.unwrap();
        assert_eq!(record.violation, ViolationType::HandshakeTimeout);
        assert_eq!(record.source, SourceKey::Addr(remote().unwrap().ip()));
    }

    #[tokio::test]
    async fn handshake_cap_rejects_fast() {
        let client = side();
        let mut server = side();
        server.handshaker.slots = Arc::new(Semaphore::new(1));
        let _held = server.handshaker.admit_outbound(client.keypair.peer_id()).unwrap();

        let (_a, b) = tokio::io::duplex(1024);
        let outcome = server.handshaker.accept(Box::new(b), remote(), None).await;
        assert!(matches!(outcome, HandshakeOutcome::Rejected(RejectReason::AtCapacity)));
    }
}
