//! # RPC Layer
//!
//! UDP request/response transport for the DHT, plus the datagram side of
//! NAT traversal (binding probes and hole punching), all sharing one socket.
//!
//! ## Architecture
//!
//! - [`RpcEndpoint`]: cloneable handle that sends requests and implements
//!   [`DhtRpc`]. Outstanding requests wait on a oneshot keyed by a random
//!   request id.
//! - [`RpcEndpoint::serve`]: the receive loop. Responses complete pending
//!   calls; requests are dispatched to the [`DhtNode`] on their own task.
//!
//! ## Datagram Handling
//!
//! | Datagram | Action |
//! |----------|--------|
//! | `Request` | dispatch, reply from the same socket |
//! | `Response` | complete the matching call if the responder is the expected peer |
//! | `Punch` | acknowledge, only while a local punch with that nonce is active |
//! | `PunchAck` | wake the waiting punch |
//!
//! ## Security
//!
//! - Datagrams from quarantined addresses are dropped before decoding
//! - Undecodable datagrams are counted as `MalformedMessage` violations
//! - Every request is signed by the sender's identity key. A request whose
//!   key does not hash to its `from` PeerId, or whose signature fails, is
//!   blamed on the source address only, never on the claimed PeerId
//! - Requests older or newer than `MAX_REQUEST_SKEW`, and repeats of a
//!   `(PeerId, id)` pair already answered, are dropped
//! - Binding probes are throttled per source (`Counter::Probe`)
//! - `ReflectTo` is honoured only from contacts already in the routing
//!   table, so the node cannot be aimed at arbitrary third parties
//! - Contacts and values in responses are truncated to protocol limits

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, RPC_REQUEST_DOMAIN};
use crate::dht::{DhtNode, Key, StoreOutcome};
use crate::events::{self, SecurityEvent};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{
    decode_datagram, encode_datagram, request_signing_bytes, BindingMode, Datagram, DhtRequest, DhtResponse,
    MAX_DATAGRAM_SIZE, MAX_VALUES_PER_RESPONSE, MAX_VALUE_SIZE,
};
use crate::protocols::DhtRpc;
use crate::ratelimit::{Counter, RateLimiter, SourceKey, ViolationType};
use crate::routing::Contact;

// ============================================================================
// Security Limits
// ============================================================================

/// Maximum contacts accepted from a single FIND_NODE / FIND_VALUE response.
const MAX_CONTACTS_PER_RESPONSE: usize = 32;

/// Requests handled concurrently; datagrams beyond this are dropped.
const MAX_INFLIGHT_REQUESTS: usize = 256;

/// Receive buffer, one byte larger than the largest accepted datagram so
/// oversize payloads are detectable.
const RECV_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE + 1;

/// Interval between punch datagrams while a punch is in progress.
const PUNCH_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Reflectors consulted when forwarding a ChangeAddress probe.
const REFLECT_CANDIDATES: usize = 8;

/// Largest accepted difference between a request's timestamp and local time.
const MAX_REQUEST_SKEW_MS: u64 = 30_000;

/// Recently answered `(PeerId, request id)` pairs remembered for replay
/// detection.
const REPLAY_CACHE_SIZE: usize = 8_192;

// ============================================================================
// Endpoint
// ============================================================================

/// A response together with where it actually came from.
#[derive(Clone, Debug)]
pub struct Reply {
    pub from: PeerId,
    pub addr: SocketAddr,
    pub body: DhtResponse,
}

struct PendingCall {
    /// Responses from any other PeerId are ignored. `None` accepts any
    /// responder (seed pings and binding probes).
    expected: Option<PeerId>,
    reply: oneshot::Sender<Reply>,
}

struct EndpointInner {
    socket: Arc<UdpSocket>,
    keypair: Arc<Keypair>,
    local_id: PeerId,
    limiter: Arc<RateLimiter>,
    rpc_timeout: Duration,
    pending: DashMap<u64, PendingCall>,
    punch_waiters: DashMap<[u8; 16], oneshot::Sender<SocketAddr>>,
    answered: Mutex<LruCache<(PeerId, u64), ()>>,
}

/// Why an inbound request was not processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestRejection {
    /// The public key does not hash to the claimed PeerId.
    IdentityMismatch,
    BadSignature,
    Stale,
    Replayed,
}

/// The fields of a `Datagram::Request` that need checking before dispatch.
struct SignedRequest<'a> {
    id: u64,
    from: PeerId,
    public_key: &'a PublicKey,
    sent_at_ms: u64,
    body: &'a DhtRequest,
    signature: &'a [u8],
}

/// Removes a pending entry however the call ends.
struct PendingGuard<'a, K: std::hash::Hash + Eq, V> {
    map: &'a DashMap<K, V>,
    key: K,
}

impl<K: std::hash::Hash + Eq, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<EndpointInner>,
}

impl RpcEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        keypair: Arc<Keypair>,
        limiter: Arc<RateLimiter>,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC socket on {addr}"))?;
        debug!(addr = %socket.local_addr()?, "RPC endpoint bound");
        let replay_capacity = NonZeroUsize::new(REPLAY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Arc::new(EndpointInner {
                socket: Arc::new(socket),
                local_id: keypair.peer_id(),
                keypair,
                limiter,
                rpc_timeout,
                pending: DashMap::new(),
                punch_waiters: DashMap::new(),
                answered: Mutex::new(LruCache::new(replay_capacity)),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Build a request datagram signed with the local identity key.
    fn sign_request(&self, id: u64, body: DhtRequest) -> Result<Datagram> {
        let from = self.inner.local_id;
        let sent_at_ms = self.inner.limiter.now_ms();
        let signed = request_signing_bytes(id, &from, sent_at_ms, &body).context("request encoding failed")?;
        let signature = sign_with_domain(&self.inner.keypair, RPC_REQUEST_DOMAIN, &signed);
        Ok(Datagram::Request {
            id,
            from,
            public_key: self.inner.keypair.public_key(),
            sent_at_ms,
            body,
            signature,
        })
    }

    /// Check identity, signature, freshness and uniqueness, in that order.
    /// Only a request that passes all four is remembered as answered.
    fn authenticate(&self, request: &SignedRequest<'_>) -> Result<(), RequestRejection> {
        if request.public_key.peer_id() != request.from {
            return Err(RequestRejection::IdentityMismatch);
        }
        let signed = request_signing_bytes(request.id, &request.from, request.sent_at_ms, request.body)
            .map_err(|_| RequestRejection::BadSignature)?;
        verify_with_domain(request.public_key, RPC_REQUEST_DOMAIN, &signed, request.signature)
            .map_err(|_| RequestRejection::BadSignature)?;

        let now = self.inner.limiter.now_ms();
        if now.abs_diff(request.sent_at_ms) > MAX_REQUEST_SKEW_MS {
            return Err(RequestRejection::Stale);
        }

        let mut answered = self
            .inner
            .answered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if answered.put((request.from, request.id), ()).is_some() {
            return Err(RequestRejection::Replayed);
        }
        Ok(())
    }

    async fn send(&self, to: SocketAddr, datagram: &Datagram) -> Result<()> {
        let bytes = encode_datagram(datagram)?;
        self.inner
            .socket
            .send_to(&bytes, to)
            .await
            .with_context(|| format!("send to {to} failed"))?;
        Ok(())
    }

    async fn call(
        &self,
        to: SocketAddr,
        expected: Option<PeerId>,
        body: DhtRequest,
        timeout: Duration,
    ) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let id = loop {
            let candidate: u64 = rand::random();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.inner.pending.entry(candidate) {
                slot.insert(PendingCall { expected, reply: tx });
                break candidate;
            }
        };
        let _guard = PendingGuard {
            map: &self.inner.pending,
            key: id,
        };

        let kind = body.kind();
        let request = self.sign_request(id, body)?;
        self.send(to, &request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => bail!("{kind} to {to} abandoned"),
            Err(_) => bail!("{kind} to {to} timed out"),
        }
    }

    async fn call_contact(&self, to: &Contact, body: DhtRequest) -> Result<DhtResponse> {
        let reply = self
            .call(to.addr, Some(to.peer_id), body, self.inner.rpc_timeout)
            .await?;
        if let DhtResponse::Error { message } = reply.body {
            bail!("peer {} answered with error: {message}", to.peer_id.short());
        }
        Ok(reply.body)
    }

    /// Ping a bare address and learn which PeerId answers there.
    pub async fn ping_addr(&self, addr: SocketAddr) -> Result<PeerId> {
        let reply = self
            .call(addr, None, DhtRequest::Ping, self.inner.rpc_timeout)
            .await?;
        match reply.body {
            DhtResponse::Pong => Ok(reply.from),
            other => bail!("unexpected response to Ping: {other:?}"),
        }
    }

    /// Ask `reflector` which address our datagrams arrive from. `None` when
    /// no answer arrives within `timeout`.
    pub async fn binding(
        &self,
        reflector: SocketAddr,
        mode: BindingMode,
        timeout: Duration,
    ) -> Result<Option<SocketAddr>> {
        match self.call(reflector, None, DhtRequest::Binding { mode }, timeout).await {
            Ok(Reply {
                body: DhtResponse::Binding { observed },
                ..
            }) => Ok(Some(observed)),
            Ok(other) => Err(anyhow!("unexpected response to Binding: {:?}", other.body)),
            Err(e) => {
                trace!(%reflector, ?mode, error = %e, "binding probe unanswered");
                Ok(None)
            }
        }
    }

    /// Send punch datagrams to `peer` until it acknowledges `nonce` or
    /// `window` elapses. Returns the address the acknowledgement came from.
    pub async fn punch(&self, peer: SocketAddr, nonce: [u8; 16], window: Duration) -> Result<Option<SocketAddr>> {
        let (tx, mut rx) = oneshot::channel();
        self.inner.punch_waiters.insert(nonce, tx);
        let _guard = PendingGuard {
            map: &self.inner.punch_waiters,
            key: nonce,
        };

        let probe = Datagram::Punch {
            nonce,
            from: self.inner.local_id,
        };
        let deadline = tokio::time::Instant::now() + window;
        let mut ticker = tokio::time::interval(PUNCH_RETRY_INTERVAL);
        loop {
            tokio::select! {
                acked = &mut rx => return Ok(acked.ok()),
                _ = ticker.tick() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    if let Err(e) = self.send(peer, &probe).await {
                        trace!(%peer, error = %e, "punch send failed");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Receive loop
    // ------------------------------------------------------------------------

    /// Run the receive loop until `shutdown` flips.
    pub fn serve(&self, dht: DhtNode<RpcEndpoint>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(MAX_INFLIGHT_REQUESTS));
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let (len, src) = tokio::select! {
                    received = endpoint.inner.socket.recv_from(&mut buf) => match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors surface here on some platforms.
                            trace!(error = %e, "recv_from failed");
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                };
                endpoint.handle_datagram(&buf[..len], src, &dht, &permits).await;
            }
            trace!("RPC receive loop stopped");
        })
    }

    async fn handle_datagram(
        &self,
        bytes: &[u8],
        src: SocketAddr,
        dht: &DhtNode<RpcEndpoint>,
        permits: &Arc<Semaphore>,
    ) {
        let ip = src.ip();
        let limiter = &self.inner.limiter;
        if limiter.is_quarantined(SourceKey::Addr(ip)) {
            trace!(%src, "dropping datagram from quarantined address");
            return;
        }

        let datagram = match bytes.len() {
            len if len > MAX_DATAGRAM_SIZE => Err(format!("{len} byte datagram exceeds limit")),
            _ => decode_datagram(bytes).map_err(|e| e.to_string()),
        };
        let datagram = match datagram {
            Ok(d) => d,
            Err(reason) => {
                events::emit(SecurityEvent::MalformedMessage, &src.to_string(), &reason);
                limiter.record_violation(ViolationType::MalformedMessage, SourceKey::Addr(ip), Some(ip));
                return;
            }
        };

        match datagram {
            Datagram::Response { id, from, body } => {
                let matched = self
                    .inner
                    .pending
                    .remove_if(&id, |_, call| call.expected.is_none_or(|e| e == from));
                match matched {
                    Some((_, call)) => {
                        let _ = call.reply.send(Reply { from, addr: src, body });
                    }
                    None => trace!(%src, id, "unsolicited response"),
                }
            }
            Datagram::Request {
                id,
                from,
                public_key,
                sent_at_ms,
                body,
                signature,
            } => {
                if from == self.inner.local_id || limiter.is_quarantined(SourceKey::Peer(from)) {
                    return;
                }
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    debug!(%src, "request backlog full, dropping");
                    return;
                };
                let endpoint = self.clone();
                let dht = dht.clone();
                tokio::spawn(async move {
                    let request = SignedRequest {
                        id,
                        from,
                        public_key: &public_key,
                        sent_at_ms,
                        body: &body,
                        signature: &signature,
                    };
                    if let Err(rejection) = endpoint.authenticate(&request) {
                        endpoint.reject_request(src, &from, rejection);
                        return;
                    }
                    let contact = Contact::new(from, src);
                    if let Some(response) = endpoint.handle_request(&dht, contact, id, body).await {
                        let reply = Datagram::Response {
                            id,
                            from: endpoint.inner.local_id,
                            body: response,
                        };
                        if let Err(e) = endpoint.send(src, &reply).await {
                            trace!(%src, error = %e, "failed to send response");
                        }
                    }
                    drop(permit);
                });
            }
            Datagram::Punch { nonce, from } => {
                if !self.inner.punch_waiters.contains_key(&nonce) {
                    trace!(%src, "punch for unknown nonce ignored");
                    return;
                }
                trace!(%src, peer = %from.short(), "punch received");
                let ack = Datagram::PunchAck {
                    nonce,
                    from: self.inner.local_id,
                };
                if let Err(e) = self.send(src, &ack).await {
                    trace!(%src, error = %e, "failed to acknowledge punch");
                }
            }
            Datagram::PunchAck { nonce, from } => {
                if let Some((_, waiter)) = self.inner.punch_waiters.remove(&nonce) {
                    debug!(%src, peer = %from.short(), "punch acknowledged");
                    let _ = waiter.send(src);
                }
            }
        }
    }

    /// Until a request is authenticated its PeerId is only a claim, so
    /// violations go to the address it came from.
    fn reject_request(&self, src: SocketAddr, claimed: &PeerId, rejection: RequestRejection) {
        let ip = src.ip();
        let violation = match rejection {
            RequestRejection::IdentityMismatch => ViolationType::IdentityMismatch,
            RequestRejection::BadSignature => ViolationType::SignatureInvalid,
            RequestRejection::Stale | RequestRejection::Replayed => {
                trace!(%src, claimed = %claimed.short(), ?rejection, "request dropped");
                return;
            }
        };
        events::emit(
            violation.event(),
            &src.to_string(),
            &format!("request claiming {} failed authentication: {rejection:?}", claimed.short()),
        );
        self.inner
            .limiter
            .record_violation(violation, SourceKey::Addr(ip), Some(ip));
    }

    async fn handle_request(
        &self,
        dht: &DhtNode<RpcEndpoint>,
        from: Contact,
        id: u64,
        body: DhtRequest,
    ) -> Option<DhtResponse> {
        trace!(
            from = %from.peer_id.short(),
            addr = %from.addr,
            kind = body.kind(),
            "handling request"
        );
        match body {
            DhtRequest::Ping => {
                dht.handle_ping(&from).await;
                Some(DhtResponse::Pong)
            }
            DhtRequest::FindNode { target } => {
                let nodes = dht.handle_find_node(&from, target).await;
                debug!(from = %from.peer_id.short(), returned = nodes.len(), "FIND_NODE response");
                Some(DhtResponse::Nodes(nodes))
            }
            DhtRequest::FindValue { key } => {
                let (values, closer) = dht.handle_find_value(&from, key).await;
                debug!(
                    from = %from.peer_id.short(),
                    key = %hex::encode(&key[..8]),
                    values = values.len(),
                    closer = closer.len(),
                    "FIND_VALUE response"
                );
                Some(DhtResponse::Value { values, closer })
            }
            DhtRequest::Store { key, value, ttl_secs } => {
                let outcome = dht
                    .handle_store(&from, key, value, Duration::from_secs(ttl_secs))
                    .await;
                Some(DhtResponse::Stored(outcome))
            }
            DhtRequest::Binding { mode } => {
                if !self.admit_probe(SourceKey::Addr(from.addr.ip())) {
                    return None;
                }
                self.answer_binding(dht, from, id, mode).await
            }
            DhtRequest::ReflectTo { reply_to, id: probe_id } => {
                self.reflect(dht, from, reply_to, probe_id).await;
                None
            }
        }
    }

    fn admit_probe(&self, key: SourceKey) -> bool {
        let admitted = self.inner.limiter.admit(key, Counter::Probe).is_allowed();
        if !admitted {
            debug!(source = %key, "binding probe throttled");
        }
        admitted
    }

    async fn answer_binding(
        &self,
        dht: &DhtNode<RpcEndpoint>,
        from: Contact,
        id: u64,
        mode: BindingMode,
    ) -> Option<DhtResponse> {
        let observed = from.addr;
        match mode {
            BindingMode::Basic => Some(DhtResponse::Binding { observed }),
            BindingMode::ChangePort => {
                if let Err(e) = self.answer_from_alternate_port(id, observed).await {
                    debug!(%observed, error = %e, "change-port answer failed");
                }
                None
            }
            BindingMode::ChangeAddress => {
                let candidates = dht.find_closest(&from.peer_id, REFLECT_CANDIDATES).await;
                let reflector = candidates
                    .into_iter()
                    .find(|c| c.peer_id != from.peer_id && c.addr != observed);
                match reflector {
                    Some(reflector) => {
                        let body = DhtRequest::ReflectTo { reply_to: observed, id };
                        let sent = match self.sign_request(rand::random(), body) {
                            Ok(forward) => self.send(reflector.addr, &forward).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = sent {
                            debug!(reflector = %reflector.addr, error = %e, "reflect forward failed");
                        }
                    }
                    None => trace!(%observed, "no alternate reflector for change-address probe"),
                }
                None
            }
        }
    }

    async fn answer_from_alternate_port(&self, id: u64, observed: SocketAddr) -> Result<()> {
        let local = self.local_addr()?;
        let bind_ip = match local.ip() {
            ip if !ip.is_unspecified() => ip,
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let alternate = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        let reply = Datagram::Response {
            id,
            from: self.inner.local_id,
            body: DhtResponse::Binding { observed },
        };
        alternate.send_to(&encode_datagram(&reply)?, observed).await?;
        Ok(())
    }

    async fn reflect(&self, dht: &DhtNode<RpcEndpoint>, from: Contact, reply_to: SocketAddr, probe_id: u64) {
        let known = dht
            .lookup_contact(&from.peer_id)
            .await
            .is_some_and(|c| c.addr == from.addr);
        if !known {
            debug!(from = %from.peer_id.short(), "ReflectTo from unknown contact ignored");
            return;
        }
        if !self.admit_probe(SourceKey::Peer(from.peer_id)) {
            return;
        }
        let reply = Datagram::Response {
            id: probe_id,
            from: self.inner.local_id,
            body: DhtResponse::Binding { observed: reply_to },
        };
        if let Err(e) = self.send(reply_to, &reply).await {
            trace!(%reply_to, error = %e, "reflect answer failed");
        }
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("local_id", &self.inner.local_id)
            .field("local_addr", &self.inner.socket.local_addr().ok())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

fn truncate_contacts(to: &Contact, mut contacts: Vec<Contact>) -> Vec<Contact> {
    if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %to.peer_id.short(),
            count = contacts.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        contacts.truncate(MAX_CONTACTS_PER_RESPONSE);
    }
    contacts
}

#[async_trait]
impl DhtRpc for RpcEndpoint {
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.call_contact(to, DhtRequest::Ping).await? {
            DhtResponse::Pong => Ok(()),
            other => bail!("unexpected response to Ping: {other:?}"),
        }
    }

    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>> {
        match self.call_contact(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(nodes) => Ok(truncate_contacts(to, nodes)),
            other => bail!("unexpected response to FindNode: {other:?}"),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Vec<Vec<u8>>, Vec<Contact>)> {
        match self.call_contact(to, DhtRequest::FindValue { key }).await? {
            DhtResponse::Value { mut values, closer } => {
                let before = values.len();
                values.retain(|v| v.len() <= MAX_VALUE_SIZE);
                values.truncate(MAX_VALUES_PER_RESPONSE);
                if values.len() != before {
                    warn!(
                        peer = %to.peer_id.short(),
                        returned = before,
                        kept = values.len(),
                        "peer returned oversized or excess values"
                    );
                }
                Ok((values, truncate_contacts(to, closer)))
            }
            other => bail!("unexpected response to FindValue: {other:?}"),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>, ttl: Duration) -> Result<StoreOutcome> {
        let request = DhtRequest::Store {
            key,
            value,
            ttl_secs: ttl.as_secs(),
        };
        match self.call_contact(to, request).await? {
            DhtResponse::Stored(outcome) => Ok(outcome),
            other => bail!("unexpected response to Store: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::config::{DhtSettings, RateLimitSettings};
    use crate::dht::StoreRejection;
    use crate::identity::Keypair;
    use crate::protocols::AcceptAll;

    struct TestPeer {
        endpoint: RpcEndpoint,
        dht: DhtNode<RpcEndpoint>,
        limiter: Arc<RateLimiter>,
        _shutdown: watch::Sender<bool>,
    }

    async fn spawn_peer(rate_limit: RateLimitSettings) -> TestPeer {
        let keypair = Arc::new(Keypair::generate());
        let id = keypair.peer_id();
        let limiter = Arc::new(RateLimiter::new(rate_limit, Arc::new(SystemClock)));
        let endpoint = RpcEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            keypair,
            limiter.clone(),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        let settings = DhtSettings {
            rpc_timeout_ms: 500,
            lookup_timeout_ms: 2_000,
            ..DhtSettings::default()
        };
        let dht = DhtNode::new(id, endpoint.clone(), settings, limiter.clone(), Arc::new(AcceptAll));
        let (shutdown, rx) = watch::channel(false);
        endpoint.serve(dht.clone(), rx);
        TestPeer {
            endpoint,
            dht,
            limiter,
            _shutdown: shutdown,
        }
    }

    fn contact_of(peer: &TestPeer) -> Contact {
        Contact::new(peer.endpoint.local_id(), peer.endpoint.local_addr().unwrap())
    }

    /// A request claiming `claimed` but signed with `signer`'s key.
    fn forged_request(signer: &Keypair, claimed: PeerId, public_key: PublicKey, body: DhtRequest) -> Vec<u8> {
        let id = rand::random();
        let sent_at_ms = SystemClock.now_ms();
        let signed = request_signing_bytes(id, &claimed, sent_at_ms, &body).unwrap();
        let signature = sign_with_domain(signer, RPC_REQUEST_DOMAIN, &signed);
        encode_datagram(&Datagram::Request {
            id,
            from: claimed,
            public_key,
            sent_at_ms,
            body,
            signature,
        })
        .unwrap()
    }

    async fn recv_any(socket: &UdpSocket, wait: Duration) -> Option<Datagram> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => decode_datagram(&buf[..len]).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn ping_by_address_learns_peer_id() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;

        let learned = a.endpoint.ping_addr(b.endpoint.local_addr().unwrap()).await.unwrap();
        assert_eq!(learned, b.endpoint.local_id());

        // The responder observed the caller.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.dht.lookup_contact(&a.endpoint.local_id()).await.is_some());
    }

    #[tokio::test]
    async fn response_from_wrong_peer_is_ignored() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;

        let impostor = Contact::new(Keypair::generate().peer_id(), b.endpoint.local_addr().unwrap());
        assert!(a.endpoint.ping(&impostor).await.is_err());
    }

    #[tokio::test]
    async fn store_and_find_value_over_udp() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let key = *blake3::hash(b"rpc-test").as_bytes();

        let outcome = a
            .endpoint
            .store(&contact_of(&b), key, b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        let (values, _) = a.endpoint.find_value(&contact_of(&b), key).await.unwrap();
        assert_eq!(values, vec![b"hello".to_vec()]);

        let oversized = vec![0u8; MAX_VALUE_SIZE + 1];
        let outcome = a
            .endpoint
            .store(&contact_of(&b), key, oversized, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Rejected(StoreRejection::TooLarge));
    }

    #[tokio::test]
    async fn find_node_returns_known_contacts() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let c = spawn_peer(RateLimitSettings::default()).await;

        c.endpoint.ping(&contact_of(&b)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let nodes = a
            .endpoint
            .find_node(&contact_of(&b), c.endpoint.local_id())
            .await
            .unwrap();
        assert!(nodes.iter().any(|n| n.peer_id == c.endpoint.local_id()));
    }

    #[tokio::test]
    async fn malformed_datagram_is_recorded() {
        let b = spawn_peer(RateLimitSettings::default()).await;
        let mut violations = b.limiter.subscribe();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0xFF; 9], b.endpoint.local_addr().unwrap()).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), violations.recv())
            .await
            .expect("violation published")
            .unwrap();
        assert_eq!(record.violation, ViolationType::MalformedMessage);
        assert_eq!(record.source, SourceKey::Addr(raw.local_addr().unwrap().ip()));
    }

    #[tokio::test]
    async fn forged_ping_cannot_move_a_known_contact() {
        let victim = spawn_peer(RateLimitSettings::default()).await;
        let target = spawn_peer(RateLimitSettings::default()).await;
        let mut violations = target.limiter.subscribe();
        victim.endpoint.ping(&contact_of(&target)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let victim_id = victim.endpoint.local_id();
        assert_eq!(target.dht.lookup_contact(&victim_id).await, Some(contact_of(&victim)));

        let attacker = Keypair::generate();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = target.endpoint.local_addr().unwrap();

        // Attacker's own key under the victim's PeerId.
        let mismatched = forged_request(&attacker, victim_id, attacker.public_key(), DhtRequest::Ping);
        raw.send_to(&mismatched, to).await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(2), violations.recv())
            .await
            .expect("violation published")
            .unwrap();
        assert_eq!(record.violation, ViolationType::IdentityMismatch);
        assert_eq!(record.source, SourceKey::Addr(raw.local_addr().unwrap().ip()));

        // Victim's public key, attacker's signature.
        let victim_key = victim.endpoint.inner.keypair.public_key();
        let unsigned = forged_request(&attacker, victim_id, victim_key, DhtRequest::Ping);
        raw.send_to(&unsigned, to).await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(2), violations.recv())
            .await
            .expect("violation published")
            .unwrap();
        assert_eq!(record.violation, ViolationType::SignatureInvalid);
        assert_eq!(record.source, SourceKey::Addr(raw.local_addr().unwrap().ip()));

        assert!(recv_any(&raw, Duration::from_millis(200)).await.is_none(), "forged ping was answered");
        assert_eq!(target.dht.lookup_contact(&victim_id).await, Some(contact_of(&victim)));
    }

    #[tokio::test]
    async fn forged_stores_never_blame_the_claimed_peer() {
        let victim = spawn_peer(RateLimitSettings::default()).await;
        let target = spawn_peer(RateLimitSettings::default()).await;
        let mut violations = target.limiter.subscribe();
        let victim_id = victim.endpoint.local_id();
        let victim_key = victim.endpoint.inner.keypair.public_key();

        let attacker = Keypair::generate();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = target.endpoint.local_addr().unwrap();
        let key = *blake3::hash(b"victim-key").as_bytes();
        for _ in 0..12 {
            let store = DhtRequest::Store {
                key,
                value: vec![0u8; MAX_VALUE_SIZE + 1],
                ttl_secs: 60,
            };
            let bytes = forged_request(&attacker, victim_id, victim_key, store);
            raw.send_to(&bytes, to).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        while let Ok(record) = violations.try_recv() {
            assert_ne!(record.source, SourceKey::Peer(victim_id));
        }
        assert!(target
            .limiter
            .check(SourceKey::Peer(victim_id), Counter::ConnectionAttempt)
            .is_allowed());
        assert_eq!(target.dht.stats().await.stored_values, 0);
    }

    #[tokio::test]
    async fn replayed_request_is_answered_once() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = b.endpoint.local_addr().unwrap();

        let captured = encode_datagram(&a.endpoint.sign_request(42, DhtRequest::Ping).unwrap()).unwrap();
        raw.send_to(&captured, to).await.unwrap();
        assert!(matches!(
            recv_any(&raw, Duration::from_secs(1)).await,
            Some(Datagram::Response { id: 42, body: DhtResponse::Pong, .. })
        ));

        raw.send_to(&captured, to).await.unwrap();
        assert!(recv_any(&raw, Duration::from_millis(300)).await.is_none(), "replay was answered");
    }

    #[tokio::test]
    async fn stale_request_is_dropped() {
        let b = spawn_peer(RateLimitSettings::default()).await;
        let signer = Keypair::generate();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let sent_at_ms = SystemClock.now_ms() - 5 * MAX_REQUEST_SKEW_MS;
        let signed = request_signing_bytes(7, &signer.peer_id(), sent_at_ms, &DhtRequest::Ping).unwrap();
        let stale = Datagram::Request {
            id: 7,
            from: signer.peer_id(),
            public_key: signer.public_key(),
            sent_at_ms,
            body: DhtRequest::Ping,
            signature: sign_with_domain(&signer, RPC_REQUEST_DOMAIN, &signed),
        };
        raw.send_to(&encode_datagram(&stale).unwrap(), b.endpoint.local_addr().unwrap())
            .await
            .unwrap();
        assert!(recv_any(&raw, Duration::from_millis(300)).await.is_none());
        assert!(b.dht.lookup_contact(&signer.peer_id()).await.is_none());
    }

    #[tokio::test]
    async fn binding_probes_report_observed_address() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let reflector = b.endpoint.local_addr().unwrap();
        let timeout = Duration::from_millis(500);

        let basic = a.endpoint.binding(reflector, BindingMode::Basic, timeout).await.unwrap();
        assert_eq!(basic, Some(a.endpoint.local_addr().unwrap()));

        let change_port = a
            .endpoint
            .binding(reflector, BindingMode::ChangePort, timeout)
            .await
            .unwrap();
        assert_eq!(change_port, Some(a.endpoint.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn change_address_probe_is_answered_by_third_node() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let c = spawn_peer(RateLimitSettings::default()).await;

        // b and c know each other.
        b.endpoint.ping(&contact_of(&c)).await.unwrap();
        c.endpoint.ping(&contact_of(&b)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let observed = a
            .endpoint
            .binding(
                b.endpoint.local_addr().unwrap(),
                BindingMode::ChangeAddress,
                Duration::from_millis(800),
            )
            .await
            .unwrap();
        assert_eq!(observed, Some(a.endpoint.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn probes_are_throttled() {
        let limits = RateLimitSettings {
            max_probes: 2,
            ..RateLimitSettings::default()
        };
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(limits).await;
        let reflector = b.endpoint.local_addr().unwrap();
        let timeout = Duration::from_millis(300);

        for _ in 0..2 {
            assert!(a.endpoint.binding(reflector, BindingMode::Basic, timeout).await.unwrap().is_some());
        }
        assert!(a.endpoint.binding(reflector, BindingMode::Basic, timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn simultaneous_punch_confirms_both_sides() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let b = spawn_peer(RateLimitSettings::default()).await;
        let nonce = [7u8; 16];
        let window = Duration::from_secs(2);

        let a_addr = a.endpoint.local_addr().unwrap();
        let b_addr = b.endpoint.local_addr().unwrap();
        let (ra, rb) = tokio::join!(
            a.endpoint.punch(b_addr, nonce, window),
            b.endpoint.punch(a_addr, nonce, window),
        );
        assert_eq!(ra.unwrap(), Some(b_addr));
        assert_eq!(rb.unwrap(), Some(a_addr));
    }

    #[tokio::test]
    async fn punch_without_peer_times_out() {
        let a = spawn_peer(RateLimitSettings::default()).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = a
            .endpoint
            .punch(silent.local_addr().unwrap(), [1u8; 16], Duration::from_millis(300))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
