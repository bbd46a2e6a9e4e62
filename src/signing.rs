//! # Descriptor Signing Service
//!
//! Signs the local node's descriptors and decides whether remote ones are
//! acceptable. A remote descriptor is accepted only when all of these hold:
//!
//! 1. **Structure**: bounded field counts and lengths.
//! 2. **Freshness**: not past `expires_at_ms`, and not claiming an expiry
//!    further out than the maximum descriptor lifetime. Both checks allow
//!    the configured clock-skew tolerance.
//! 3. **Signature**: verifies over the canonical encoding under the
//!    identity key, or under a control signing key that the identity key
//!    endorsed.
//! 4. **Identity binding**: `peer_id == derive(identity_key)`, checked
//!    separately from the signature. A peer signing validly with its own
//!    key while claiming someone else's PeerId fails here.
//! 5. **Anti-rollback**: the sequence number is strictly greater than the
//!    last one accepted for that PeerId. Re-receiving the exact descriptor
//!    already accepted is reported as a duplicate, not a rollback.
//!
//! ## Sequence High-Water Marks
//!
//! [`SequenceStore`] keeps the last accepted `(sequence, digest)` per
//! PeerId. Check and commit happen under one `DashMap` entry lock, so two
//! concurrent descriptors for the same peer can never both pass. Marks are
//! persisted as a sealed file and reloaded at startup; a file that fails
//! its integrity tag, or an older copy restored over a newer one, is
//! discarded with a `sequence_store_tampered` event.
//!
//! Marks are pruned once they are older than the maximum descriptor
//! lifetime plus skew: any descriptor they could still reject has expired
//! by then.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DescriptorSettings;
use crate::crypto::{
    sign_with_domain, verify_with_domain, CONTROL_KEY_ENDORSEMENT_DOMAIN,
    DESCRIPTOR_SIGNATURE_DOMAIN,
};
use crate::descriptor::{control_keys_encoding, PeerDescriptor, StructureError};
use crate::events::{self, SecurityEvent};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::ratelimit::ViolationType;
use crate::sealed::{SealKey, SealedFile};

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyFailure {
    Malformed(StructureError),
    SignatureInvalid,
    IdentityMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// New high-water mark committed.
    Advanced,
    /// Same sequence and same content as the current mark.
    Duplicate,
    /// Not newer than the current mark.
    Rollback { current: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorRejection {
    Malformed(StructureError),
    Expired,
    /// Expiry lies further in the future than any honest signer would set.
    ExpiryTooFar,
    SignatureInvalid,
    IdentityMismatch,
    Rollback { current: u64, presented: u64 },
}

impl DescriptorRejection {
    pub fn violation(&self) -> ViolationType {
        match self {
            DescriptorRejection::Malformed(_) | DescriptorRejection::ExpiryTooFar => {
                ViolationType::MalformedMessage
            }
            DescriptorRejection::Expired => ViolationType::ExpiredDescriptor,
            DescriptorRejection::SignatureInvalid => ViolationType::SignatureInvalid,
            DescriptorRejection::IdentityMismatch => ViolationType::IdentityMismatch,
            DescriptorRejection::Rollback { .. } => ViolationType::SequenceRollback,
        }
    }
}

impl From<VerifyFailure> for DescriptorRejection {
    fn from(failure: VerifyFailure) -> Self {
        match failure {
            VerifyFailure::Malformed(e) => DescriptorRejection::Malformed(e),
            VerifyFailure::SignatureInvalid => DescriptorRejection::SignatureInvalid,
            VerifyFailure::IdentityMismatch => DescriptorRejection::IdentityMismatch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorOutcome {
    Accepted,
    Duplicate,
    Rejected(DescriptorRejection),
}

impl DescriptorOutcome {
    /// Accepted now or previously; safe to cache and serve.
    pub fn is_usable(&self) -> bool {
        matches!(self, DescriptorOutcome::Accepted | DescriptorOutcome::Duplicate)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing key is neither the identity key nor an endorsed control key")]
    UnauthorizedKey,
    #[error("descriptor is malformed: {0}")]
    Malformed(StructureError),
}

// ============================================================================
// Sequence Store
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub peer_id: PeerId,
    pub sequence: u64,
    /// Hex BLAKE3 of the accepted descriptor's canonical encoding.
    pub digest: String,
    pub accepted_at_ms: u64,
}

pub struct SequenceStore {
    marks: DashMap<PeerId, SequenceRecord>,
    persistence: Option<SealedFile>,
}

impl SequenceStore {
    pub fn in_memory() -> Self {
        Self {
            marks: DashMap::new(),
            persistence: None,
        }
    }

    pub fn open(path: PathBuf, key: SealKey) -> Self {
        let marks = DashMap::new();
        let file = SealedFile::new(path, key);
        let path = file.path();
        match file.load::<Vec<SequenceRecord>>() {
            Ok(Some(records)) => {
                for record in records {
                    marks.insert(record.peer_id, record);
                }
                info!(path = %path.display(), count = marks.len(), "loaded sequence marks");
            }
            Ok(None) => {}
            Err(e) if e.is_tamper() => {
                events::emit(
                    SecurityEvent::SequenceStoreTampered,
                    &path.display().to_string(),
                    &format!("ignoring sequence file: {e}"),
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read sequence file, starting empty");
            }
        }
        Self {
            marks,
            persistence: Some(file),
        }
    }

    pub fn current(&self, peer_id: &PeerId) -> Option<u64> {
        self.marks.get(peer_id).map(|r| r.sequence)
    }

    /// Atomically compare `sequence` against the mark for `peer_id` and
    /// commit it if strictly newer.
    pub fn accept(&self, peer_id: &PeerId, sequence: u64, digest: &[u8; 32], now_ms: u64) -> SequenceOutcome {
        let digest_hex = hex::encode(digest);
        let record = SequenceRecord {
            peer_id: *peer_id,
            sequence,
            digest: digest_hex,
            accepted_at_ms: now_ms,
        };
        let outcome = match self.marks.entry(*peer_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                SequenceOutcome::Advanced
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if sequence > current.sequence {
                    occupied.insert(record);
                    SequenceOutcome::Advanced
                } else if sequence == current.sequence && current.digest == record.digest {
                    SequenceOutcome::Duplicate
                } else {
                    SequenceOutcome::Rollback {
                        current: current.sequence,
                    }
                }
            }
        };
        if outcome == SequenceOutcome::Advanced {
            self.persist();
        }
        outcome
    }

    /// Drop marks accepted before `cutoff_ms`. Returns how many were removed.
    pub fn prune(&self, cutoff_ms: u64) -> usize {
        let before = self.marks.len();
        self.marks.retain(|_, record| record.accepted_at_ms >= cutoff_ms);
        let removed = before.saturating_sub(self.marks.len());
        if removed > 0 {
            debug!(removed, "pruned sequence marks");
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    fn persist(&self) {
        let Some(file) = &self.persistence else {
            return;
        };
        let written = file.store(|| {
            let mut snapshot: Vec<SequenceRecord> = self.marks.iter().map(|e| e.value().clone()).collect();
            snapshot.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
            snapshot
        });
        if let Err(e) = written {
            warn!(path = %file.path().display(), error = %e, "failed to persist sequence marks");
        }
    }
}

// ============================================================================
// Signing Service
// ============================================================================

/// Identity-key endorsement of `keys` as control signing keys for the
/// keypair's PeerId.
pub fn endorse_control_keys(identity: &Keypair, keys: &[PublicKey]) -> Vec<u8> {
    sign_with_domain(
        identity,
        CONTROL_KEY_ENDORSEMENT_DOMAIN,
        &control_keys_encoding(&identity.peer_id(), keys),
    )
}

pub struct DescriptorSigningService {
    sequences: SequenceStore,
    clock: Arc<dyn Clock>,
    clock_skew_tolerance_ms: u64,
    max_lifetime_ms: u64,
}

impl DescriptorSigningService {
    pub fn new(sequences: SequenceStore, clock: Arc<dyn Clock>, settings: &DescriptorSettings) -> Self {
        Self {
            sequences,
            clock,
            clock_skew_tolerance_ms: settings.clock_skew_tolerance_ms,
            max_lifetime_ms: settings.lifetime_secs.saturating_mul(1000),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sequences(&self) -> &SequenceStore {
        &self.sequences
    }

    /// Sign `descriptor` with `keypair`.
    ///
    /// An unset identity key is filled in from `keypair` (together with the
    /// derived PeerId). Otherwise `keypair` must be the identity key or one
    /// of the endorsed control keys.
    pub fn sign(&self, mut descriptor: PeerDescriptor, keypair: &Keypair) -> Result<PeerDescriptor, SignError> {
        if descriptor.identity_key == PublicKey::default() {
            descriptor.identity_key = keypair.public_key();
            descriptor.peer_id = keypair.peer_id();
        }
        let signer = keypair.public_key();
        if signer != descriptor.identity_key && !descriptor.control_signing_keys.contains(&signer) {
            return Err(SignError::UnauthorizedKey);
        }
        descriptor.signature = sign_with_domain(keypair, DESCRIPTOR_SIGNATURE_DOMAIN, &descriptor.canonical_bytes());
        descriptor.validate_structure().map_err(SignError::Malformed)?;
        Ok(descriptor)
    }

    /// Check signature and identity binding. Does not look at time or
    /// sequence numbers.
    pub fn verify(&self, descriptor: &PeerDescriptor) -> Result<(), VerifyFailure> {
        descriptor.validate_structure().map_err(VerifyFailure::Malformed)?;

        let canonical = descriptor.canonical_bytes();
        let by_identity = verify_with_domain(
            &descriptor.identity_key,
            DESCRIPTOR_SIGNATURE_DOMAIN,
            &canonical,
            &descriptor.signature,
        )
        .is_ok();

        let signature_ok = by_identity || {
            let by_control = descriptor.control_signing_keys.iter().any(|key| {
                verify_with_domain(key, DESCRIPTOR_SIGNATURE_DOMAIN, &canonical, &descriptor.signature).is_ok()
            });
            by_control
                && verify_with_domain(
                    &descriptor.identity_key,
                    CONTROL_KEY_ENDORSEMENT_DOMAIN,
                    &control_keys_encoding(&descriptor.peer_id, &descriptor.control_signing_keys),
                    &descriptor.control_key_endorsement,
                )
                .is_ok()
        };
        if !signature_ok {
            return Err(VerifyFailure::SignatureInvalid);
        }

        if PeerId::derive(&descriptor.identity_key) != descriptor.peer_id {
            return Err(VerifyFailure::IdentityMismatch);
        }
        Ok(())
    }

    /// Whether `sequence` would be accepted for `peer_id` right now.
    pub fn validate_sequence_number(&self, peer_id: &PeerId, sequence: u64) -> bool {
        self.sequences.current(peer_id).is_none_or(|current| sequence > current)
    }

    /// Commit `sequence` as the new high-water mark for `peer_id` if it is
    /// strictly newer.
    pub fn accept_sequence_number(&self, peer_id: &PeerId, sequence: u64, digest: &[u8; 32]) -> SequenceOutcome {
        self.sequences.accept(peer_id, sequence, digest, self.clock.now_ms())
    }

    pub fn is_expired(&self, descriptor: &PeerDescriptor) -> bool {
        self.clock.now_ms() > descriptor.expires_at_ms.saturating_add(self.clock_skew_tolerance_ms)
    }

    fn expiry_too_far(&self, descriptor: &PeerDescriptor) -> bool {
        let horizon = self
            .clock
            .now_ms()
            .saturating_add(self.max_lifetime_ms)
            .saturating_add(self.clock_skew_tolerance_ms);
        descriptor.expires_at_ms > horizon
    }

    /// Full acceptance pipeline for a remote descriptor. Commits the
    /// sequence number on success and logs a security event on rejection.
    pub fn validate(&self, descriptor: &PeerDescriptor) -> DescriptorOutcome {
        let outcome = self.validate_inner(descriptor);
        if let DescriptorOutcome::Rejected(reason) = &outcome {
            let event = match reason {
                DescriptorRejection::ExpiryTooFar => SecurityEvent::DescriptorExpired,
                other => other.violation().event(),
            };
            events::emit(event, &descriptor.peer_id.short(), &format!("descriptor rejected: {reason:?}"));
        }
        outcome
    }

    fn validate_inner(&self, descriptor: &PeerDescriptor) -> DescriptorOutcome {
        if let Err(e) = descriptor.validate_structure() {
            return DescriptorOutcome::Rejected(DescriptorRejection::Malformed(e));
        }
        if self.is_expired(descriptor) {
            return DescriptorOutcome::Rejected(DescriptorRejection::Expired);
        }
        if self.expiry_too_far(descriptor) {
            return DescriptorOutcome::Rejected(DescriptorRejection::ExpiryTooFar);
        }
        if let Err(failure) = self.verify(descriptor) {
            return DescriptorOutcome::Rejected(failure.into());
        }
        match self.accept_sequence_number(&descriptor.peer_id, descriptor.sequence, &descriptor.digest()) {
            SequenceOutcome::Advanced => DescriptorOutcome::Accepted,
            SequenceOutcome::Duplicate => DescriptorOutcome::Duplicate,
            SequenceOutcome::Rollback { current } => DescriptorOutcome::Rejected(DescriptorRejection::Rollback {
                current,
                presented: descriptor.sequence,
            }),
        }
    }

    /// Sequence number for the next local descriptor: above the persisted
    /// mark and at least the current time, so it keeps increasing across
    /// restarts even if the mark file was lost.
    pub fn next_local_sequence(&self, local: &PeerId) -> u64 {
        let now = self.clock.now_ms();
        match self.sequences.current(local) {
            Some(current) => current.saturating_add(1).max(now),
            None => now,
        }
    }

    /// Forget marks that can no longer reject anything unexpired.
    pub fn prune_sequences(&self) -> usize {
        let retention = self.max_lifetime_ms.saturating_add(self.clock_skew_tolerance_ms);
        self.sequences.prune(self.clock.now_ms().saturating_sub(retention))
    }
}

impl std::fmt::Debug for DescriptorSigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSigningService")
            .field("marks", &self.sequences.len())
            .field("clock_skew_tolerance_ms", &self.clock_skew_tolerance_ms)
            .finish()
    }
}
