//! # Descriptor Store
//!
//! Publishing and retrieving signed records through the DHT.
//!
//! ## Records
//!
//! | Record | DHT key | Publisher | Signed under |
//! |--------|---------|-----------|--------------|
//! | [`DhtRecord::Descriptor`] | [`descriptor_key`]`(peer_id)` | the described peer | descriptor domain |
//! | [`DhtRecord::Provider`] | [`content_key`]`(content_id)` | the providing peer | provider domain |
//!
//! Every STORE passes through [`RecordValidator`] before it reaches the
//! local value store, so a record with a bad signature, a PeerId that does
//! not match its key, an expired lifetime or a rolled-back sequence is never
//! cached or served onward.
//!
//! ## Lookups
//!
//! [`DescriptorStore::find_peer_by_id`] and
//! [`DescriptorStore::find_peers_by_content`] never fail: DHT errors and
//! invalid records degrade to `None` / an empty list. Accepted descriptors
//! are kept in a bounded LRU cache for up to one republish interval.
//!
//! A node that answers FIND_VALUE with a forged record (undecodable, bad
//! signature, or bound to another identity) is charged a violation.
//! Expired or superseded records are only discarded, since an honest node
//! may still hold them until their TTL runs out.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::config::DescriptorSettings;
use crate::crypto::{sign_with_domain, verify_with_domain, PROVIDER_SIGNATURE_DOMAIN};
use crate::descriptor::{PeerDescriptor, TransportEndpoint};
use crate::dht::{DhtNode, Key, SourcedValue};
use crate::events;
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{deserialize_bounded, serialize, MAX_VALUE_SIZE};
use crate::nat::NatType;
use crate::routing::Contact;
use crate::protocols::{DhtRpc, ValueValidator, ValueVerdict};
use crate::ratelimit::ViolationType;
use crate::signing::{DescriptorOutcome, DescriptorSigningService, SequenceOutcome};

const DESCRIPTOR_KEY_DOMAIN: &[u8] = b"meshgate-descriptor-key-v1:";
const CONTENT_KEY_DOMAIN: &[u8] = b"meshgate-content-key-v1:";

/// Providers resolved to descriptors per content query.
const MAX_PROVIDERS_PER_QUERY: usize = 20;

pub fn descriptor_key(peer_id: &PeerId) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DESCRIPTOR_KEY_DOMAIN);
    hasher.update(peer_id.as_bytes());
    *hasher.finalize().as_bytes()
}

pub fn content_key(content_id: &[u8]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CONTENT_KEY_DOMAIN);
    hasher.update(content_id);
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Records
// ============================================================================

/// "`provider` serves the content behind `content_key` until `expires_at_ms`."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub content_key: Key,
    pub provider: PeerId,
    pub public_key: PublicKey,
    pub expires_at_ms: u64,
    pub signature: Vec<u8>,
}

impl ProviderRecord {
    fn signed_bytes(content_key: &Key, provider: &PeerId, expires_at_ms: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(72);
        out.extend_from_slice(content_key);
        out.extend_from_slice(provider.as_bytes());
        out.extend_from_slice(&expires_at_ms.to_le_bytes());
        out
    }

    pub fn sign(keypair: &Keypair, content_key: Key, expires_at_ms: u64) -> Self {
        let provider = keypair.peer_id();
        let signature = sign_with_domain(
            keypair,
            PROVIDER_SIGNATURE_DOMAIN,
            &Self::signed_bytes(&content_key, &provider, expires_at_ms),
        );
        Self {
            content_key,
            provider,
            public_key: keypair.public_key(),
            expires_at_ms,
            signature,
        }
    }

    /// Signature, identity binding and freshness.
    pub fn verify(&self, now_ms: u64, skew_ms: u64, max_lifetime_ms: u64) -> Result<(), ViolationType> {
        verify_with_domain(
            &self.public_key,
            PROVIDER_SIGNATURE_DOMAIN,
            &Self::signed_bytes(&self.content_key, &self.provider, self.expires_at_ms),
            &self.signature,
        )
        .map_err(|_| ViolationType::SignatureInvalid)?;
        if PeerId::derive(&self.public_key) != self.provider {
            return Err(ViolationType::IdentityMismatch);
        }
        if now_ms > self.expires_at_ms.saturating_add(skew_ms) {
            return Err(ViolationType::ExpiredDescriptor);
        }
        if self.expires_at_ms > now_ms.saturating_add(max_lifetime_ms).saturating_add(skew_ms) {
            return Err(ViolationType::MalformedMessage);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRecord {
    Descriptor(PeerDescriptor),
    Provider(ProviderRecord),
}

impl DhtRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serialize(self).context("record encoding failed")?;
        anyhow::ensure!(bytes.len() <= MAX_VALUE_SIZE, "record of {} bytes exceeds value limit", bytes.len());
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        deserialize_bounded(bytes, MAX_VALUE_SIZE).ok()
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Clone, Debug)]
struct CachedDescriptor {
    descriptor: PeerDescriptor,
    cached_at_ms: u64,
}

/// Recently accepted remote descriptors.
pub struct DescriptorCache {
    entries: Mutex<LruCache<PeerId, CachedDescriptor>>,
}

impl std::fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorCache").field("len", &self.len()).finish()
    }
}

impl DescriptorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<PeerId, CachedDescriptor>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keeps whichever of the cached and offered descriptor is newer.
    pub fn insert(&self, descriptor: PeerDescriptor, now_ms: u64) {
        let mut entries = self.lock();
        if entries
            .peek(&descriptor.peer_id)
            .is_some_and(|cached| cached.descriptor.sequence > descriptor.sequence)
        {
            return;
        }
        entries.put(
            descriptor.peer_id,
            CachedDescriptor {
                descriptor,
                cached_at_ms: now_ms,
            },
        );
    }

    fn get(&self, peer_id: &PeerId) -> Option<CachedDescriptor> {
        self.lock().get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &PeerId) {
        self.lock().pop(peer_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Admission check for every value entering the local DHT store.
pub struct RecordValidator {
    signing: Arc<DescriptorSigningService>,
    cache: Arc<DescriptorCache>,
    skew_ms: u64,
    max_lifetime_ms: u64,
}

impl RecordValidator {
    pub fn new(signing: Arc<DescriptorSigningService>, cache: Arc<DescriptorCache>, settings: &DescriptorSettings) -> Self {
        Self {
            signing,
            cache,
            skew_ms: settings.clock_skew_tolerance_ms,
            max_lifetime_ms: settings.lifetime_secs.saturating_mul(1000),
        }
    }
}

impl ValueValidator for RecordValidator {
    fn validate(&self, key: &Key, value: &[u8], from: &PeerId) -> ValueVerdict {
        let Some(record) = DhtRecord::decode(value) else {
            events::emit(ViolationType::MalformedMessage.event(), &from.short(), "undecodable DHT record");
            return ValueVerdict::Reject(ViolationType::MalformedMessage);
        };
        match record {
            DhtRecord::Descriptor(descriptor) => {
                if descriptor_key(&descriptor.peer_id) != *key {
                    events::emit(
                        ViolationType::IdentityMismatch.event(),
                        &from.short(),
                        "descriptor stored under another peer's key",
                    );
                    return ValueVerdict::Reject(ViolationType::IdentityMismatch);
                }
                match self.signing.validate(&descriptor) {
                    DescriptorOutcome::Accepted | DescriptorOutcome::Duplicate => {
                        let publisher = descriptor.peer_id;
                        self.cache.insert(descriptor, self.signing.clock().now_ms());
                        ValueVerdict::Accept { publisher }
                    }
                    DescriptorOutcome::Rejected(reason) => ValueVerdict::Reject(reason.violation()),
                }
            }
            DhtRecord::Provider(record) => {
                if record.content_key != *key {
                    events::emit(
                        ViolationType::MalformedMessage.event(),
                        &from.short(),
                        "provider record stored under another content key",
                    );
                    return ValueVerdict::Reject(ViolationType::MalformedMessage);
                }
                let now = self.signing.clock().now_ms();
                match record.verify(now, self.skew_ms, self.max_lifetime_ms) {
                    Ok(()) => ValueVerdict::Accept {
                        publisher: record.provider,
                    },
                    Err(violation) => {
                        events::emit(violation.event(), &record.provider.short(), "provider record rejected");
                        ValueVerdict::Reject(violation)
                    }
                }
            }
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// What the local node currently advertises.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalProfile {
    pub endpoints: Vec<TransportEndpoint>,
    pub nat_type: NatType,
}

pub struct DescriptorStore<N: DhtRpc> {
    dht: DhtNode<N>,
    keypair: Arc<Keypair>,
    signing: Arc<DescriptorSigningService>,
    cache: Arc<DescriptorCache>,
    settings: DescriptorSettings,
    certificate_pins: Vec<String>,
}

impl<N: DhtRpc> Clone for DescriptorStore<N> {
    fn clone(&self) -> Self {
        Self {
            dht: self.dht.clone(),
            keypair: self.keypair.clone(),
            signing: self.signing.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            certificate_pins: self.certificate_pins.clone(),
        }
    }
}

impl<N: DhtRpc> DescriptorStore<N> {
    pub fn new(
        dht: DhtNode<N>,
        keypair: Arc<Keypair>,
        signing: Arc<DescriptorSigningService>,
        cache: Arc<DescriptorCache>,
        settings: DescriptorSettings,
        certificate_pins: Vec<String>,
    ) -> Self {
        Self {
            dht,
            keypair,
            signing,
            cache,
            settings,
            certificate_pins,
        }
    }

    fn now_ms(&self) -> u64 {
        self.signing.clock().now_ms()
    }

    /// Sign a fresh descriptor for `profile` and store it at the k closest
    /// nodes. The new sequence number is committed locally first so it
    /// never repeats.
    pub async fn publish_local(&self, profile: &LocalProfile) -> Result<PeerDescriptor> {
        let local = self.keypair.peer_id();
        let sequence = self.signing.next_local_sequence(&local);
        let expires_at_ms = self.now_ms().saturating_add(self.settings.lifetime_secs.saturating_mul(1000));

        let mut descriptor = PeerDescriptor::unsigned(self.keypair.public_key(), sequence, expires_at_ms);
        descriptor.nat_type = profile.nat_type;
        descriptor.endpoints = profile.endpoints.clone();
        descriptor.certificate_pins = self.certificate_pins.clone();
        let descriptor = self
            .signing
            .sign(descriptor, &self.keypair)
            .context("signing local descriptor failed")?;

        if let SequenceOutcome::Rollback { current } =
            self.signing
                .accept_sequence_number(&local, descriptor.sequence, &descriptor.digest())
        {
            anyhow::bail!("local sequence {sequence} is not above persisted mark {current}");
        }

        let value = DhtRecord::Descriptor(descriptor.clone()).encode()?;
        let accepted = self
            .dht
            .put(descriptor_key(&local), value, self.settings.lifetime())
            .await?;
        info!(
            sequence = descriptor.sequence,
            endpoints = descriptor.endpoints.len(),
            replicas = accepted,
            "published local descriptor"
        );
        Ok(descriptor)
    }

    /// Republish on every interval tick and whenever the profile changes.
    pub fn spawn_republish(
        &self,
        mut profile: watch::Receiver<LocalProfile>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.settings.republish_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = profile.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        interval.reset();
                    }
                    _ = shutdown.changed() => break,
                }
                let current = profile.borrow_and_update().clone();
                if let Err(e) = store.publish_local(&current).await {
                    warn!(error = %e, "descriptor republish failed");
                }
                store.signing.prune_sequences();
            }
            debug!("descriptor republish stopped");
        })
    }

    pub fn cached(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        let entry = self.cache.get(peer_id)?;
        let max_age_ms = self.settings.republish_interval_secs.saturating_mul(1000);
        let fresh = self.now_ms().saturating_sub(entry.cached_at_ms) <= max_age_ms;
        if fresh && !self.signing.is_expired(&entry.descriptor) {
            Some(entry.descriptor)
        } else {
            self.cache.remove(peer_id);
            None
        }
    }

    /// Charge `source` for serving a record that no honest node would have
    /// accepted. Values from the local store have no source.
    fn blame_source(&self, source: Option<&Contact>, violation: ViolationType, detail: &str) {
        let Some(source) = source else {
            return;
        };
        if !matches!(
            violation,
            ViolationType::MalformedMessage | ViolationType::SignatureInvalid | ViolationType::IdentityMismatch
        ) {
            trace!(peer = %source.peer_id.short(), ?violation, "discarding stale record");
            return;
        }
        events::emit(violation.event(), &format!("{}@{}", source.peer_id.short(), source.addr), detail);
        self.dht.record_bad_value(source, violation);
    }

    /// Drop a cached descriptor that turned out to be stale.
    pub fn invalidate(&self, peer_id: &PeerId) {
        self.cache.remove(peer_id);
    }

    /// The newest valid descriptor for `peer_id`, from cache or the DHT.
    pub async fn find_peer_by_id(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        if let Some(descriptor) = self.cached(peer_id) {
            trace!(peer = %peer_id.short(), "descriptor cache hit");
            return Some(descriptor);
        }

        let values = match self.dht.get(&descriptor_key(peer_id)).await {
            Ok(values) => values,
            Err(e) => {
                debug!(peer = %peer_id.short(), error = %e, "descriptor lookup failed");
                return None;
            }
        };

        let mut candidates: Vec<(Option<Contact>, PeerDescriptor)> = Vec::new();
        for SourcedValue { source, value } in values {
            match DhtRecord::decode(&value) {
                Some(DhtRecord::Descriptor(d)) if d.peer_id == *peer_id => candidates.push((source, d)),
                Some(DhtRecord::Descriptor(_)) => self.blame_source(
                    source.as_ref(),
                    ViolationType::IdentityMismatch,
                    "served a descriptor for another peer",
                ),
                _ => self.blame_source(
                    source.as_ref(),
                    ViolationType::MalformedMessage,
                    "served an undecodable descriptor record",
                ),
            }
        }
        candidates.sort_by(|a, b| b.1.sequence.cmp(&a.1.sequence));

        for (source, candidate) in candidates {
            match self.signing.validate(&candidate) {
                DescriptorOutcome::Accepted | DescriptorOutcome::Duplicate => {
                    self.cache.insert(candidate.clone(), self.now_ms());
                    return Some(candidate);
                }
                DescriptorOutcome::Rejected(reason) => {
                    debug!(peer = %peer_id.short(), ?reason, "discarding fetched descriptor");
                    self.blame_source(source.as_ref(), reason.violation(), "served an invalid descriptor");
                }
            }
        }
        None
    }

    /// Advertise that this node provides `content_id`.
    pub async fn announce_content(&self, content_id: &[u8]) -> Result<usize> {
        let key = content_key(content_id);
        let expires_at_ms = self.now_ms().saturating_add(self.settings.lifetime_secs.saturating_mul(1000));
        let record = ProviderRecord::sign(&self.keypair, key, expires_at_ms);
        let value = DhtRecord::Provider(record).encode()?;
        let accepted = self.dht.put(key, value, self.settings.lifetime()).await?;
        debug!(key = %hex::encode(&key[..8]), replicas = accepted, "announced content");
        Ok(accepted)
    }

    /// Descriptors of peers that announced `content_id`.
    pub async fn find_peers_by_content(&self, content_id: &[u8]) -> Vec<PeerDescriptor> {
        let key = content_key(content_id);
        let values = match self.dht.get(&key).await {
            Ok(values) => values,
            Err(e) => {
                debug!(key = %hex::encode(&key[..8]), error = %e, "provider lookup failed");
                return Vec::new();
            }
        };

        let now = self.now_ms();
        let skew = self.settings.clock_skew_tolerance_ms;
        let max_lifetime = self.settings.lifetime_secs.saturating_mul(1000);
        let mut seen = HashSet::new();
        let mut providers: Vec<PeerId> = Vec::new();
        for SourcedValue { source, value } in values {
            let record = match DhtRecord::decode(&value) {
                Some(DhtRecord::Provider(record)) if record.content_key == key => record,
                _ => {
                    self.blame_source(source.as_ref(), ViolationType::MalformedMessage, "served a bad provider record");
                    continue;
                }
            };
            if let Err(violation) = record.verify(now, skew, max_lifetime) {
                self.blame_source(source.as_ref(), violation, "served an invalid provider record");
                continue;
            }
            if providers.len() < MAX_PROVIDERS_PER_QUERY && seen.insert(record.provider) {
                providers.push(record.provider);
            }
        }

        let mut join_set = JoinSet::new();
        for provider in providers {
            let store = self.clone();
            join_set.spawn(async move { store.find_peer_by_id(&provider).await });
        }
        let mut found = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(descriptor)) = joined {
                found.push(descriptor);
            }
        }
        found.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        found
    }
}
