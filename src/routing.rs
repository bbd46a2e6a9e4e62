//! # Kademlia Routing Table
//!
//! 256 k-buckets indexed by the position of the first differing bit between
//! the local PeerId and the contact's PeerId. Within a bucket, contacts are
//! ordered least-recently-seen first.
//!
//! ## Eviction
//!
//! | Situation | Behavior |
//! |-----------|----------|
//! | Bucket has room | Contact appended |
//! | Contact already present | Moved to the tail, address refreshed |
//! | Bucket full | [`PendingEviction`] returned; the caller pings the head |
//! | Head answers | Head refreshed, newcomer dropped |
//! | Head silent | Head removed, newcomer inserted |
//! | N consecutive RPC failures | Contact evicted by [`RoutingTable::record_failure`] |
//!
//! Long-lived, responsive contacts are never displaced by newcomers, which
//! is what makes Kademlia resistant to routing table flooding.
//!
//! ## Insertion Limiting
//!
//! Contacts learned from third parties (lookup responses) pass through
//! [`InsertionLimiter`], a per-source token bucket, so one peer cannot fill
//! the table with fabricated entries.

use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::identity::{distance_cmp, PeerId};

const BUCKET_COUNT: usize = 256;

/// Contacts a single source may introduce per window.
const INSERTION_PER_SOURCE_LIMIT: usize = 50;

const INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

const MAX_INSERTION_TRACKED_SOURCES: usize = 1_000;

/// A peer as the DHT knows it: identity plus the UDP address it answers on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }
}

#[derive(Clone, Debug)]
struct RoutingEntry {
    contact: Contact,
    last_seen: Instant,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct RoutingBucket {
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: Contact },
}

/// A full bucket's head must be pinged before `candidate` can take its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEviction {
    pub bucket_index: usize,
    pub oldest: Contact,
    pub candidate: Contact,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.contact.peer_id == peer_id)
    }

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&contact.peer_id) {
            let mut existing = self.entries.remove(pos);
            existing.contact.addr = contact.addr;
            existing.last_seen = Instant::now();
            self.entries.push(existing);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(RoutingEntry {
                contact,
                last_seen: Instant::now(),
                consecutive_failures: 0,
            });
            self.mark_refreshed();
            BucketTouchOutcome::Inserted
        } else {
            match self.entries.first() {
                Some(head) => BucketTouchOutcome::Full { oldest: head.contact },
                // k == 0 is rejected by config validation.
                None => BucketTouchOutcome::Refreshed,
            }
        }
    }

    fn refresh(&mut self, peer_id: &PeerId) -> bool {
        if let Some(pos) = self.position(peer_id) {
            let mut existing = self.entries.remove(pos);
            existing.last_seen = Instant::now();
            existing.consecutive_failures = 0;
            self.entries.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, peer_id: &PeerId) -> bool {
        if let Some(pos) = self.position(peer_id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

pub fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// A random PeerId that falls into bucket `bucket_idx` relative to `self_id`.
pub fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let bucket_idx = bucket_idx.min(BUCKET_COUNT - 1);
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let mut target = [0u8; 32];
    for (i, byte) in target.iter_mut().enumerate() {
        *byte = self_bytes[i] ^ distance[i];
    }
    PeerId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    max_consecutive_failures: u32,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize, max_consecutive_failures: u32) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| RoutingBucket::new()).collect();
        Self {
            self_id,
            k,
            max_consecutive_failures: max_consecutive_failures.max(1),
            buckets,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert or refresh `contact`. A full bucket yields a
    /// [`PendingEviction`] for the caller to resolve with a ping.
    pub fn insert(&mut self, contact: Contact) -> Option<PendingEviction> {
        if contact.peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.peer_id);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { oldest } => Some(PendingEviction {
                bucket_index: idx,
                oldest,
                candidate: contact,
            }),
        }
    }

    /// Up to `k` contacts in strictly ascending XOR distance from `target`.
    /// Never includes the local PeerId.
    pub fn find_closest(&self, target: &PeerId, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; 32],
            contact: Contact,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let dist = entry.contact.peer_id.xor_distance(target);
                if heap.len() < k {
                    heap.push(ByDistance { dist, contact: entry.contact });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(ByDistance { dist, contact: entry.contact });
                    heap.pop();
                }
            }
        }

        // PeerIds are unique across buckets, so distances are distinct.
        heap.into_sorted_vec().into_iter().map(|d| d.contact).collect()
    }

    pub fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.peer_id);
            return;
        }
        bucket.remove(&pending.oldest.peer_id);
        if bucket.position(&pending.candidate.peer_id).is_none() && bucket.entries.len() < k {
            bucket.entries.push(RoutingEntry {
                contact: pending.candidate,
                last_seen: Instant::now(),
                consecutive_failures: 0,
            });
            bucket.mark_refreshed();
        }
    }

    /// A successful exchange: refreshes recency and clears the failure count.
    pub fn record_success(&mut self, peer_id: &PeerId) -> bool {
        if *peer_id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx].refresh(peer_id)
    }

    /// Count a failed RPC. Returns `true` when this failure evicted the
    /// contact.
    pub fn record_failure(&mut self, peer_id: &PeerId) -> bool {
        if *peer_id == self.self_id {
            return false;
        }
        let threshold = self.max_consecutive_failures;
        let bucket = &mut self.buckets[bucket_index(&self.self_id, peer_id)];
        let Some(pos) = bucket.position(peer_id) else {
            return false;
        };
        let entry = &mut bucket.entries[pos];
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= threshold {
            bucket.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        if *peer_id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx].remove(peer_id)
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<Contact> {
        if *peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.contact.peer_id == peer_id)
            .map(|e| e.contact)
    }

    pub fn consecutive_failures(&self, peer_id: &PeerId) -> Option<u32> {
        if *peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, peer_id);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.contact.peer_id == peer_id)
            .map(|e| e.consecutive_failures)
    }

    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    /// Contacts not heard from for longer than `threshold`.
    pub fn entries_not_seen_since(&self, threshold: Duration) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| e.last_seen.elapsed() > threshold)
            .map(|e| e.contact)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Insertion Limiter
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct InsertionBucket {
    tokens: f64,
    last_update: Instant,
}

impl InsertionBucket {
    fn new() -> Self {
        Self {
            tokens: INSERTION_PER_SOURCE_LIMIT as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = INSERTION_PER_SOURCE_LIMIT as f64 / INSERTION_RATE_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(INSERTION_PER_SOURCE_LIMIT as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket per introducing peer for contacts learned second-hand.
pub struct InsertionLimiter {
    buckets: LruCache<PeerId, InsertionBucket>,
}

impl InsertionLimiter {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(MAX_INSERTION_TRACKED_SOURCES).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: LruCache::new(capacity),
        }
    }

    pub fn allow_insertion(&mut self, from_peer: &PeerId) -> bool {
        self.buckets
            .get_or_insert_mut(*from_peer, InsertionBucket::new)
            .try_consume()
    }
}

impl Default for InsertionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InsertionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertionLimiter")
            .field("tracked", &self.buckets.len())
            .finish()
    }
}
