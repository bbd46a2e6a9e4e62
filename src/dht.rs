//! # DHT Engine
//!
//! Kademlia lookups and the local value store, behind an actor.
//!
//! ## Architecture
//!
//! [`DhtNode`] is a cheap, cloneable handle. The routing table and value
//! store are owned by a single actor task and mutated only through
//! [`Command`] messages, so bucket updates are serialized without locks.
//! Network calls are made by the handle, never by the actor, so a slow peer
//! cannot stall routing updates.
//!
//! ## Iterative Lookup
//!
//! 1. Seed the shortlist with the k closest known contacts.
//! 2. Query α unqueried candidates in parallel, each under the RPC timeout.
//! 3. Fold returned contacts into the shortlist (sorted, truncated to k).
//! 4. Stop when a round finds nothing closer, no candidate is left, a value
//!    was returned (value lookups), or the lookup deadline passes.
//!
//! Every failed query counts against the contact; the routing table evicts
//! it after `max_consecutive_failures` in a row.
//!
//! ## Value Store
//!
//! | Property | Rule |
//! |----------|------|
//! | Layout | key → publisher → value, so a content key holds many providers |
//! | TTL | requested TTL, capped at `max_value_ttl` |
//! | Expiry | purged lazily on read and by the sweep task |
//! | Admission | size limit, STORE rate limit per PeerId and per IP, [`ValueValidator`] |
//! | Capacity | per-key and global value caps |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::config::DhtSettings;
use crate::identity::{distance_cmp, PeerId};
use crate::messages::{MAX_VALUES_PER_RESPONSE, MAX_VALUE_SIZE};
use crate::protocols::{DhtRpc, ValueValidator, ValueVerdict};
use crate::ratelimit::{Counter, RateLimiter, SourceKey, ViolationRecord, ViolationType};
use crate::routing::{random_id_for_bucket, Contact, InsertionLimiter, PendingEviction, RoutingTable};

pub type Key = [u8; 32];

/// Values kept per key (distinct publishers).
const MAX_VALUES_PER_KEY: usize = 32;

/// Values kept across all keys.
const LOCAL_STORE_MAX_VALUES: usize = 100_000;

/// Lookup rounds before giving up regardless of progress.
const MAX_LOOKUP_ITERATIONS: usize = 20;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRejection {
    TooLarge,
    RateLimited,
    Invalid(ViolationType),
    CapacityExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOutcome {
    Stored,
    Rejected(StoreRejection),
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored)
    }
}

// ============================================================================
// Local Store
// ============================================================================

#[derive(Clone, Debug)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LocalStore {
    entries: HashMap<Key, HashMap<PeerId, StoredValue>>,
    total: usize,
}

impl LocalStore {
    fn put(&mut self, key: Key, publisher: PeerId, value: Vec<u8>, ttl: Duration, now: Instant) -> Result<(), StoreRejection> {
        self.purge_key(&key, now);
        let replacing = self
            .entries
            .get(&key)
            .is_some_and(|values| values.contains_key(&publisher));
        if !replacing {
            let per_key = self.entries.get(&key).map_or(0, HashMap::len);
            if per_key >= MAX_VALUES_PER_KEY || self.total >= LOCAL_STORE_MAX_VALUES {
                return Err(StoreRejection::CapacityExceeded);
            }
            self.total += 1;
        }
        self.entries.entry(key).or_default().insert(
            publisher,
            StoredValue {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn get(&mut self, key: &Key, now: Instant) -> Vec<Vec<u8>> {
        self.purge_key(key, now);
        self.entries
            .get(key)
            .map(|values| values.values().map(|v| v.value.clone()).collect())
            .unwrap_or_default()
    }

    fn purge_key(&mut self, key: &Key, now: Instant) {
        let Some(values) = self.entries.get_mut(key) else {
            return;
        };
        let before = values.len();
        values.retain(|_, v| v.expires_at > now);
        self.total -= before - values.len();
        if values.is_empty() {
            self.entries.remove(key);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.total;
        let keys: Vec<Key> = self.entries.keys().copied().collect();
        for key in keys {
            self.purge_key(&key, now);
        }
        before - self.total
    }

    fn len(&self) -> usize {
        self.total
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct LookupResult {
    pub closest: Vec<Contact>,
    /// Values with the node that returned each one.
    pub values: Vec<(Contact, Vec<u8>)>,
}

/// A value and where it came from: `None` for the local store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcedValue {
    pub source: Option<Contact>,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub routing_entries: usize,
    pub stored_keys: usize,
    pub stored_values: usize,
}

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    network: Arc<N>,
    settings: Arc<DhtSettings>,
    limiter: Arc<RateLimiter>,
    validator: Arc<dyn ValueValidator>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            network: self.network.clone(),
            settings: self.settings.clone(),
            limiter: self.limiter.clone(),
            validator: self.validator.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtRpc> {
    routing: RoutingTable,
    store: LocalStore,
    insertion_limiter: InsertionLimiter,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    k: usize,
}

enum Command {
    // State updates
    ObserveContact(Contact),
    ObserveContactFromPeer(Contact, PeerId),
    RecordFailure(PeerId, oneshot::Sender<bool>),
    ApplyPingResult(PendingEviction, bool),

    // Queries
    Closest(PeerId, usize, oneshot::Sender<Vec<Contact>>),
    LookupContact(PeerId, oneshot::Sender<Option<Contact>>),
    GetLocal(Key, oneshot::Sender<Vec<Vec<u8>>>),
    StoreLocal(Key, PeerId, Vec<u8>, Duration, oneshot::Sender<Result<(), StoreRejection>>),
    Stats(oneshot::Sender<DhtStats>),

    // RPC handlers
    HandleFindNode(Contact, PeerId, oneshot::Sender<Vec<Contact>>),
    HandleFindValue(Contact, Key, oneshot::Sender<(Vec<Vec<u8>>, Vec<Contact>)>),

    // Maintenance
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    StaleContacts(Duration, oneshot::Sender<Vec<Contact>>),
    Sweep(oneshot::Sender<usize>),

    Quit,
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(
        id: PeerId,
        network: N,
        settings: DhtSettings,
        limiter: Arc<RateLimiter>,
        validator: Arc<dyn ValueValidator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let network = Arc::new(network);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, settings.k, settings.max_consecutive_failures),
            store: LocalStore::default(),
            insertion_limiter: InsertionLimiter::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            k: settings.k,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            id,
            network,
            settings: Arc::new(settings),
            limiter,
            validator,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    /// A contact we exchanged messages with directly.
    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    /// A contact learned from `from_peer`'s response.
    pub async fn observe_contact_from_peer(&self, contact: Contact, from_peer: &PeerId) {
        let _ = self
            .cmd_tx
            .send(Command::ObserveContactFromPeer(contact, *from_peer))
            .await;
    }

    /// Count a failed RPC against `peer_id`. Returns whether it was evicted.
    pub async fn record_failure(&self, peer_id: &PeerId) -> bool {
        self.request(|tx| Command::RecordFailure(*peer_id, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn find_closest(&self, target: &PeerId, k: usize) -> Vec<Contact> {
        self.request(|tx| Command::Closest(*target, k, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn lookup_contact(&self, peer_id: &PeerId) -> Option<Contact> {
        self.request(|tx| Command::LookupContact(*peer_id, tx)).await.flatten()
    }

    pub async fn stats(&self) -> DhtStats {
        self.request(Command::Stats).await.unwrap_or_default()
    }

    pub async fn get_local(&self, key: &Key) -> Vec<Vec<u8>> {
        self.request(|tx| Command::GetLocal(*key, tx)).await.unwrap_or_default()
    }

    async fn store_local(&self, key: Key, publisher: PeerId, value: Vec<u8>, ttl: Duration) -> StoreOutcome {
        let ttl = ttl.min(self.settings.max_value_ttl());
        match self
            .request(|tx| Command::StoreLocal(key, publisher, value, ttl, tx))
            .await
        {
            Some(Ok(())) => StoreOutcome::Stored,
            Some(Err(rejection)) => StoreOutcome::Rejected(rejection),
            None => StoreOutcome::Rejected(StoreRejection::CapacityExceeded),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------------

    pub async fn handle_ping(&self, from: &Contact) {
        self.observe_contact(*from).await;
    }

    pub async fn handle_find_node(&self, from: &Contact, target: PeerId) -> Vec<Contact> {
        self.request(|tx| Command::HandleFindNode(*from, target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_find_value(&self, from: &Contact, key: Key) -> (Vec<Vec<u8>>, Vec<Contact>) {
        self.request(|tx| Command::HandleFindValue(*from, key, tx))
            .await
            .unwrap_or_default()
    }

    /// Admit, validate and store a value sent by `from`.
    pub async fn handle_store(&self, from: &Contact, key: Key, value: Vec<u8>, ttl: Duration) -> StoreOutcome {
        let peer = SourceKey::Peer(from.peer_id);
        let ip = from.addr.ip();

        if value.len() > MAX_VALUE_SIZE {
            self.limiter
                .record_violation(ViolationType::MalformedMessage, peer, Some(ip));
            return StoreOutcome::Rejected(StoreRejection::TooLarge);
        }

        let admitted = self.limiter.admit(peer, Counter::Store).is_allowed()
            && self.limiter.admit(SourceKey::Addr(ip), Counter::Store).is_allowed();
        if !admitted {
            debug!(peer = %from.peer_id.short(), %ip, "store rate limited");
            self.limiter.record_violation(ViolationType::StoreFlood, peer, Some(ip));
            return StoreOutcome::Rejected(StoreRejection::RateLimited);
        }

        match self.validator.validate(&key, &value, &from.peer_id) {
            ValueVerdict::Accept { publisher } => {
                self.observe_contact(*from).await;
                let outcome = self.store_local(key, publisher, value, ttl).await;
                trace!(
                    key = %hex::encode(&key[..8]),
                    publisher = %publisher.short(),
                    ?outcome,
                    "handled store"
                );
                outcome
            }
            ValueVerdict::Reject(violation) => {
                debug!(
                    peer = %from.peer_id.short(),
                    key = %hex::encode(&key[..8]),
                    ?violation,
                    "rejected stored value"
                );
                self.limiter.record_violation(violation, peer, Some(ip));
                StoreOutcome::Rejected(StoreRejection::Invalid(violation))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub async fn iterative_find_node(&self, target: PeerId) -> Result<Vec<Contact>> {
        let result = self.iterative_lookup(target, None, Vec::new()).await?;
        Ok(result.closest)
    }

    pub async fn iterative_find_value(&self, key: Key) -> Result<LookupResult> {
        self.iterative_lookup(PeerId::from_bytes(key), Some(key), Vec::new())
            .await
    }

    async fn iterative_lookup(&self, target: PeerId, value_key: Option<Key>, seeds: Vec<Contact>) -> Result<LookupResult> {
        let lookup_start = Instant::now();
        let k = self.settings.k;
        let alpha = self.settings.alpha.max(1);
        let rpc_timeout = self.settings.rpc_timeout();
        let lookup_timeout = self.settings.lookup_timeout();

        let mut shortlist = self
            .request(|tx| Command::Closest(target, k, tx))
            .await
            .ok_or_else(|| anyhow!("dht actor closed"))?;
        for seed in seeds {
            if seed.peer_id != self.id && !shortlist.iter().any(|c| c.peer_id == seed.peer_id) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|c| c.peer_id).collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut values: Vec<(Contact, Vec<u8>)> = Vec::new();
        let mut best_distance = shortlist
            .first()
            .map(|c| c.peer_id.xor_distance(&target))
            .unwrap_or([0xff; 32]);

        for iteration in 1..=MAX_LOOKUP_ITERATIONS {
            if lookup_start.elapsed() > lookup_timeout {
                debug!(
                    target = %target.short(),
                    elapsed_ms = lookup_start.elapsed().as_millis() as u64,
                    "iterative lookup deadline reached"
                );
                break;
            }

            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.peer_id))
                .take(alpha)
                .copied()
                .collect();
            if candidates.is_empty() {
                break;
            }
            queried.extend(candidates.iter().map(|c| c.peer_id));

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let net = self.network.clone();
                join_set.spawn(async move {
                    let result = match value_key {
                        Some(key) => tokio::time::timeout(rpc_timeout, net.find_value(&contact, key)).await,
                        None => tokio::time::timeout(rpc_timeout, async {
                            net.find_node(&contact, target).await.map(|nodes| (Vec::new(), nodes))
                        })
                        .await,
                    };
                    let result = result.unwrap_or_else(|_| Err(anyhow!("query timeout")));
                    (contact, result)
                });
            }

            let mut any_closer = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok((found, nodes)) => {
                        self.observe_contact(contact).await;
                        values.extend(found.into_iter().map(|value| (contact, value)));
                        for node in nodes {
                            if node.peer_id == self.id {
                                continue;
                            }
                            self.observe_contact_from_peer(node, &contact.peer_id).await;
                            if seen.insert(node.peer_id) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %contact.peer_id.short(), error = %e, "lookup query failed");
                        if self.record_failure(&contact.peer_id).await {
                            debug!(peer = %contact.peer_id.short(), "evicted unresponsive contact");
                        }
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            if !values.is_empty() {
                break;
            }

            if let Some(first) = shortlist.first() {
                let new_best = first.peer_id.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }
            if !any_closer {
                break;
            }
            if iteration == MAX_LOOKUP_ITERATIONS {
                warn!(target = %target.short(), "iterative lookup exceeded max iterations");
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            values = values.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(LookupResult {
            closest: shortlist,
            values,
        })
    }

    // ------------------------------------------------------------------------
    // Bootstrap & maintenance
    // ------------------------------------------------------------------------

    /// Join the network through `seeds`: insert them, look up our own id
    /// through them, then run one refresh cycle. Returns the routing table
    /// size afterwards.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> Result<usize> {
        for seed in seeds {
            self.observe_contact(*seed).await;
        }
        self.iterative_lookup(self.id, None, seeds.to_vec()).await?;
        self.refresh_once().await;
        let entries = self.stats().await.routing_entries;
        debug!(seeds = seeds.len(), entries, "bootstrap complete");
        Ok(entries)
    }

    /// One maintenance cycle: ping contacts not heard from recently, look up
    /// our own id, then refresh stale buckets with random lookups.
    pub async fn refresh_once(&self) {
        let threshold = self.settings.liveness_threshold();
        let stale_contacts = self
            .request(|tx| Command::StaleContacts(threshold, tx))
            .await
            .unwrap_or_default();
        let rpc_timeout = self.settings.rpc_timeout();
        let mut pings = JoinSet::new();
        for contact in stale_contacts {
            let net = self.network.clone();
            pings.spawn(async move {
                let alive = matches!(tokio::time::timeout(rpc_timeout, net.ping(&contact)).await, Ok(Ok(())));
                (contact, alive)
            });
        }
        while let Some(joined) = pings.join_next().await {
            if let Ok((contact, alive)) = joined {
                if alive {
                    self.observe_contact(contact).await;
                } else if self.record_failure(&contact.peer_id).await {
                    debug!(peer = %contact.peer_id.short(), "evicted contact after failed pings");
                }
            }
        }

        if let Err(e) = self.iterative_find_node(self.id).await {
            debug!(error = %e, "self lookup failed");
        }

        let stale_buckets = self
            .request(|tx| Command::StaleBuckets(self.settings.refresh_interval(), tx))
            .await
            .unwrap_or_default();
        if !stale_buckets.is_empty() {
            debug!(count = stale_buckets.len(), "refreshing stale routing buckets");
        }
        for bucket_idx in stale_buckets {
            let target = random_id_for_bucket(&self.id, bucket_idx);
            if let Err(e) = self.iterative_find_node(target).await {
                debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
            }
            let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
        }
    }

    pub fn spawn_refresh(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.settings.refresh_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => node.refresh_once().await,
                    _ = shutdown.changed() => break,
                }
            }
            trace!("dht refresh task stopped");
        })
    }

    /// Drop expired values now. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.request(Command::Sweep).await.unwrap_or(0)
    }

    pub fn spawn_sweep(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.settings.expiry_sweep_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = node.sweep_expired().await;
                        if removed > 0 {
                            trace!(removed, "swept expired values");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Store `value` locally and at the k nodes closest to `key`. Returns
    /// how many remote nodes accepted it.
    pub async fn put(&self, key: Key, value: Vec<u8>, ttl: Duration) -> Result<usize> {
        let local = self.store_local(key, self.id, value.clone(), ttl).await;
        if !local.is_stored() {
            debug!(key = %hex::encode(&key[..8]), ?local, "local store refused value");
        }

        let closest = self.iterative_find_node(PeerId::from_bytes(key)).await?;
        let rpc_timeout = self.settings.rpc_timeout();
        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.settings.k) {
            let net = self.network.clone();
            let value = value.clone();
            join_set.spawn(async move {
                let result = tokio::time::timeout(rpc_timeout, net.store(&contact, key, value, ttl)).await;
                (contact, result)
            });
        }

        let mut accepted = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(StoreOutcome::Stored)) => {
                    accepted += 1;
                    self.observe_contact(contact).await;
                }
                Ok(Ok(StoreOutcome::Rejected(reason))) => {
                    self.observe_contact(contact).await;
                    debug!(peer = %contact.peer_id.short(), ?reason, "remote refused store");
                }
                Ok(Err(_)) | Err(_) => {
                    self.record_failure(&contact.peer_id).await;
                }
            }
        }
        Ok(accepted)
    }

    /// All values known for `key`: local ones plus those found by a value
    /// lookup, each tagged with its source. Deduplicated by value, first
    /// source wins; not validated.
    pub async fn get(&self, key: &Key) -> Result<Vec<SourcedValue>> {
        let mut values: Vec<SourcedValue> = self
            .get_local(key)
            .await
            .into_iter()
            .map(|value| SourcedValue { source: None, value })
            .collect();
        let remote = self.iterative_find_value(*key).await?;
        for (source, value) in remote.values {
            if !values.iter().any(|known| known.value == value) {
                values.push(SourcedValue {
                    source: Some(source),
                    value,
                });
            }
        }
        Ok(values)
    }

    /// Count a violation against the node that served a bad value.
    pub fn record_bad_value(&self, source: &Contact, violation: ViolationType) -> ViolationRecord {
        self.limiter
            .record_violation(violation, SourceKey::Peer(source.peer_id), Some(source.addr.ip()))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

fn sort_by_distance(contacts: &mut [Contact], target: &PeerId) {
    contacts.sort_by(|a, b| distance_cmp(&a.peer_id.xor_distance(target), &b.peer_id.xor_distance(target)));
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    self.insert_contact(contact);
                    self.routing.record_success(&contact.peer_id);
                }
                Command::ObserveContactFromPeer(contact, from_peer) => {
                    self.handle_observe_contact_from_peer(contact, &from_peer);
                }
                Command::RecordFailure(peer_id, reply) => {
                    let _ = reply.send(self.routing.record_failure(&peer_id));
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Closest(target, k, reply) => {
                    let _ = reply.send(self.routing.find_closest(&target, k));
                }
                Command::LookupContact(peer_id, reply) => {
                    let _ = reply.send(self.routing.lookup(&peer_id));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key, Instant::now()));
                }
                Command::StoreLocal(key, publisher, value, ttl, reply) => {
                    let _ = reply.send(self.store.put(key, publisher, value, ttl, Instant::now()));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(DhtStats {
                        routing_entries: self.routing.len(),
                        stored_keys: self.store.entries.len(),
                        stored_values: self.store.len(),
                    });
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.insert_contact(from);
                    let _ = reply.send(self.routing.find_closest(&target, self.k));
                }
                Command::HandleFindValue(from, key, reply) => {
                    self.insert_contact(from);
                    let mut values = self.store.get(&key, Instant::now());
                    if values.is_empty() {
                        let closest = self.routing.find_closest(&PeerId::from_bytes(key), self.k);
                        let _ = reply.send((values, closest));
                    } else {
                        values.truncate(MAX_VALUES_PER_RESPONSE);
                        let _ = reply.send((values, Vec::new()));
                    }
                }
                Command::StaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_buckets(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::StaleContacts(threshold, reply) => {
                    let _ = reply.send(self.routing.entries_not_seen_since(threshold));
                }
                Command::Sweep(reply) => {
                    let _ = reply.send(self.store.sweep(Instant::now()));
                }
                Command::Quit => break,
            }
        }
    }

    fn insert_contact(&mut self, contact: Contact) {
        if let Some(pending) = self.routing.insert(contact) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = network.ping(&pending.oldest).await.is_ok();
                let _ = tx.send(Command::ApplyPingResult(pending, alive)).await;
            });
        }
    }

    /// Second-hand contacts only fill gaps; they never refresh an existing
    /// entry, so a third party cannot keep a dead contact looking fresh.
    fn handle_observe_contact_from_peer(&mut self, contact: Contact, from_peer: &PeerId) {
        if self.routing.lookup(&contact.peer_id).is_some() {
            return;
        }
        if contact.peer_id != *from_peer && !self.insertion_limiter.allow_insertion(from_peer) {
            trace!(from = %from_peer.short(), "contact insertion rate limited");
            return;
        }
        self.insert_contact(contact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitSettings;
    use crate::identity::Keypair;
    use crate::protocols::AcceptAll;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<PeerId, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.peer_id(), node.clone());
        }

        async fn get(&self, id: &PeerId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
    }

    impl TestNetwork {
        async fn peer(&self, to: &Contact) -> Result<DhtNode<TestNetwork>> {
            self.registry
                .get(&to.peer_id)
                .await
                .ok_or_else(|| anyhow!("unreachable"))
        }
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        async fn ping(&self, to: &Contact) -> Result<()> {
            self.peer(to).await?.handle_ping(&self.self_contact).await;
            Ok(())
        }

        async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>> {
            Ok(self.peer(to).await?.handle_find_node(&self.self_contact, target).await)
        }

        async fn find_value(&self, to: &Contact, key: Key) -> Result<(Vec<Vec<u8>>, Vec<Contact>)> {
            Ok(self.peer(to).await?.handle_find_value(&self.self_contact, key).await)
        }

        async fn store(&self, to: &Contact, key: Key, value: Vec<u8>, ttl: Duration) -> Result<StoreOutcome> {
            Ok(self
                .peer(to)
                .await?
                .handle_store(&self.self_contact, key, value, ttl)
                .await)
        }
    }

    fn settings() -> DhtSettings {
        DhtSettings {
            k: 20,
            alpha: 3,
            rpc_timeout_ms: 200,
            lookup_timeout_ms: 2_000,
            liveness_threshold_secs: 0,
            ..DhtSettings::default()
        }
    }

    fn limiter(settings: RateLimitSettings) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(settings, Arc::new(ManualClock::new(1_000))))
    }

    fn spawn_node(registry: &Arc<NetworkRegistry>, port: u16, limiter: Arc<RateLimiter>) -> (DhtNode<TestNetwork>, Contact) {
        let id = Keypair::generate().peer_id();
        let contact = Contact::new(id, SocketAddr::from(([127, 0, 0, (port % 250) as u8 + 1], port)));
        let network = TestNetwork {
            registry: registry.clone(),
            self_contact: contact,
        };
        let node = DhtNode::new(id, network, settings(), limiter, Arc::new(AcceptAll));
        (node, contact)
    }

    async fn spawn_registered(registry: &Arc<NetworkRegistry>, port: u16) -> (DhtNode<TestNetwork>, Contact) {
        let (node, contact) = spawn_node(registry, port, limiter(RateLimitSettings::default()));
        registry.register(&node).await;
        (node, contact)
    }

    #[tokio::test]
    async fn bootstrap_from_three_seeds_excludes_dead_peer() {
        let registry = Arc::new(NetworkRegistry::default());
        let (a, a_contact) = spawn_registered(&registry, 1).await;
        let (b, b_contact) = spawn_registered(&registry, 2).await;
        a.observe_contact(b_contact).await;
        b.observe_contact(a_contact).await;

        // Never registered, so every RPC to it fails.
        let dead = Contact::new(Keypair::generate().peer_id(), "127.0.0.9:9".parse().unwrap());

        let (local, _) = spawn_registered(&registry, 3).await;
        assert!(local.find_closest(&local.peer_id(), 20).await.is_empty());

        local.bootstrap(&[a_contact, b_contact, dead]).await.unwrap();

        let closest = local.find_closest(&local.peer_id(), 20).await;
        assert!(!closest.is_empty());
        assert!(closest.iter().any(|c| c.peer_id == a_contact.peer_id));
        assert!(!closest.iter().any(|c| c.peer_id == dead.peer_id));
    }

    #[tokio::test]
    async fn three_consecutive_failures_evict() {
        let registry = Arc::new(NetworkRegistry::default());
        let (local, _) = spawn_registered(&registry, 1).await;
        let dead = Contact::new(Keypair::generate().peer_id(), "127.0.0.9:9".parse().unwrap());
        local.observe_contact(dead).await;

        assert!(!local.record_failure(&dead.peer_id).await);
        assert!(!local.record_failure(&dead.peer_id).await);
        assert!(local.lookup_contact(&dead.peer_id).await.is_some());
        assert!(local.record_failure(&dead.peer_id).await);
        assert!(local.lookup_contact(&dead.peer_id).await.is_none());
    }

    #[tokio::test]
    async fn lookup_finds_node_across_the_network() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::new();
        for port in 1..=24 {
            nodes.push(spawn_registered(&registry, port).await);
        }
        // Everyone joins through node 0.
        let hub = nodes[0].1;
        for (node, _) in nodes.iter().skip(1) {
            node.bootstrap(&[hub]).await.unwrap();
        }

        let target = nodes[23].1.peer_id;
        let found = nodes[1].0.iterative_find_node(target).await.unwrap();
        assert!(found.iter().any(|c| c.peer_id == target));
    }

    #[tokio::test]
    async fn put_then_get_from_another_node() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::new();
        for port in 1..=6 {
            nodes.push(spawn_registered(&registry, port).await);
        }
        let seeds: Vec<Contact> = nodes.iter().map(|(_, c)| *c).collect();
        for (node, _) in &nodes {
            node.bootstrap(&seeds).await.unwrap();
        }

        let key = *blake3::hash(b"content").as_bytes();
        let accepted = nodes[0].0.put(key, b"provider-0".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert!(accepted >= 1);
        nodes[1].0.put(key, b"provider-1".to_vec(), Duration::from_secs(60)).await.unwrap();

        let found = nodes[5].0.get(&key).await.unwrap();
        let values: Vec<Vec<u8>> = found.into_iter().map(|v| v.value).collect();
        assert!(values.contains(&b"provider-0".to_vec()) || values.contains(&b"provider-1".to_vec()));
    }

    #[tokio::test]
    async fn store_flood_is_rate_limited_and_reported() {
        let registry = Arc::new(NetworkRegistry::default());
        let limiter = limiter(RateLimitSettings {
            max_stores: 3,
            ..RateLimitSettings::default()
        });
        let mut violations = limiter.subscribe();
        let (node, _) = spawn_node(&registry, 1, limiter);
        let sender = Contact::new(Keypair::generate().peer_id(), "198.51.100.4:4000".parse().unwrap());

        for i in 0..3u8 {
            let outcome = node
                .handle_store(&sender, [i; 32], vec![i], Duration::from_secs(60))
                .await;
            assert_eq!(outcome, StoreOutcome::Stored);
        }
        let outcome = node
            .handle_store(&sender, [9; 32], vec![9], Duration::from_secs(60))
            .await;
        assert_eq!(outcome, StoreOutcome::Rejected(StoreRejection::RateLimited));

        let record = violations.recv().await.unwrap();
        assert_eq!(record.violation, ViolationType::StoreFlood);
        assert_eq!(node.stats().await.stored_values, 3);
    }

    struct RejectAll;

    impl ValueValidator for RejectAll {
        fn validate(&self, _key: &Key, _value: &[u8], _from: &PeerId) -> ValueVerdict {
            ValueVerdict::Reject(ViolationType::SignatureInvalid)
        }
    }

    #[tokio::test]
    async fn rejected_values_are_never_stored() {
        let registry = Arc::new(NetworkRegistry::default());
        let limiter = limiter(RateLimitSettings::default());
        let mut violations = limiter.subscribe();
        let id = Keypair::generate().peer_id();
        let network = TestNetwork {
            registry,
            self_contact: Contact::new(id, "127.0.0.1:1".parse().unwrap()),
        };
        let node = DhtNode::new(id, network, settings(), limiter, Arc::new(RejectAll));
        let sender = Contact::new(Keypair::generate().peer_id(), "198.51.100.4:4000".parse().unwrap());

        let outcome = node
            .handle_store(&sender, [1; 32], b"forged".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(
            outcome,
            StoreOutcome::Rejected(StoreRejection::Invalid(ViolationType::SignatureInvalid))
        );
        assert!(node.get_local(&[1; 32]).await.is_empty());
        assert_eq!(violations.recv().await.unwrap().violation, ViolationType::SignatureInvalid);
    }

    #[tokio::test]
    async fn oversized_value_is_rejected() {
        let registry = Arc::new(NetworkRegistry::default());
        let (node, _) = spawn_node(&registry, 1, limiter(RateLimitSettings::default()));
        let sender = Contact::new(Keypair::generate().peer_id(), "198.51.100.4:4000".parse().unwrap());
        let outcome = node
            .handle_store(&sender, [1; 32], vec![0; MAX_VALUE_SIZE + 1], Duration::from_secs(60))
            .await;
        assert_eq!(outcome, StoreOutcome::Rejected(StoreRejection::TooLarge));
    }

    #[test]
    fn local_store_expires_lazily_and_on_sweep() {
        let mut store = LocalStore::default();
        let now = Instant::now();
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        store.put([1; 32], a, b"a".to_vec(), Duration::from_secs(10), now).unwrap();
        store.put([1; 32], b, b"b".to_vec(), Duration::from_secs(30), now).unwrap();
        store.put([2; 32], a, b"c".to_vec(), Duration::from_secs(10), now).unwrap();
        assert_eq!(store.len(), 3);

        assert_eq!(store.get(&[1; 32], now + Duration::from_secs(20)), vec![b"b".to_vec()]);
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(now + Duration::from_secs(31)), 2);
        assert_eq!(store.len(), 0);
        assert!(store.entries.is_empty());
    }

    #[test]
    fn local_store_replaces_per_publisher_and_caps_per_key() {
        let mut store = LocalStore::default();
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        let publisher = Keypair::generate().peer_id();
        store.put([1; 32], publisher, b"v1".to_vec(), ttl, now).unwrap();
        store.put([1; 32], publisher, b"v2".to_vec(), ttl, now).unwrap();
        assert_eq!(store.get(&[1; 32], now), vec![b"v2".to_vec()]);

        for _ in 1..MAX_VALUES_PER_KEY {
            store
                .put([1; 32], Keypair::generate().peer_id(), b"x".to_vec(), ttl, now)
                .unwrap();
        }
        assert_eq!(
            store.put([1; 32], Keypair::generate().peer_id(), b"y".to_vec(), ttl, now),
            Err(StoreRejection::CapacityExceeded)
        );
        // Replacing an existing publisher still works at the cap.
        assert!(store.put([1; 32], publisher, b"v3".to_vec(), ttl, now).is_ok());
    }
}
