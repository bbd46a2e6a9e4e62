//! # Certificate Pin Store
//!
//! Trust-on-first-use pinning of each peer's TLS certificate thumbprint.
//!
//! The first authenticated connection from a PeerId records the SHA-256
//! thumbprint of the certificate it presented. Every later connection for
//! that PeerId must present exactly the same certificate; anything else is
//! a [`PinOutcome::Violation`].
//!
//! ## Atomicity
//!
//! The check and the pin happen under one `DashMap` entry lock, so two
//! concurrent first contacts for the same PeerId cannot both be accepted
//! with different certificates. Exactly one of them wins the pin.
//!
//! ## Persistence
//!
//! When a path is configured the full pin list is written as a sealed file
//! (see [`crate::sealed`]) after every new pin. A file whose integrity tag
//! fails, or that is older than the last generation written, is not
//! trusted: the store starts empty and a `pin_store_tampered` event is
//! logged.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{self, SecurityEvent};
use crate::identity::PeerId;
use crate::sealed::{SealKey, SealedFile};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePin {
    pub peer_id: PeerId,
    pub thumbprint: String,
    pub first_seen_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinOutcome {
    /// No pin existed; the thumbprint is now pinned.
    FirstContact,
    /// The thumbprint matches the existing pin.
    Matched,
    /// A different thumbprint is pinned for this peer.
    Violation { pinned: String },
}

impl PinOutcome {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, PinOutcome::Violation { .. })
    }
}

pub struct CertificatePinStore {
    pins: DashMap<PeerId, CertificatePin>,
    clock: Arc<dyn Clock>,
    persistence: Option<SealedFile>,
}

impl CertificatePinStore {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            pins: DashMap::new(),
            clock,
            persistence: None,
        }
    }

    /// Open the sealed pin file at `path`, creating it on first pin.
    pub fn open(path: PathBuf, key: SealKey, clock: Arc<dyn Clock>) -> Self {
        let pins = DashMap::new();
        let file = SealedFile::new(path, key);
        let path = file.path();
        match file.load::<Vec<CertificatePin>>() {
            Ok(Some(stored)) => {
                for pin in stored {
                    pins.insert(pin.peer_id, pin);
                }
                info!(path = %path.display(), count = pins.len(), "loaded certificate pins");
            }
            Ok(None) => {
                debug!(path = %path.display(), "no certificate pin file yet");
            }
            Err(e) if e.is_tamper() => {
                events::emit(
                    SecurityEvent::PinStoreTampered,
                    &path.display().to_string(),
                    &format!("ignoring pin file: {e}"),
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read pin file, starting empty");
            }
        }
        Self {
            pins,
            clock,
            persistence: Some(file),
        }
    }

    /// Compare `thumbprint` against the pin for `peer_id`, pinning it if
    /// this is the first contact.
    pub fn check_and_pin(&self, peer_id: &PeerId, thumbprint: &str) -> PinOutcome {
        let outcome = match self.pins.entry(*peer_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(CertificatePin {
                    peer_id: *peer_id,
                    thumbprint: thumbprint.to_string(),
                    first_seen_at_ms: self.clock.now_ms(),
                });
                PinOutcome::FirstContact
            }
            Entry::Occupied(occupied) => {
                let pinned = &occupied.get().thumbprint;
                if pinned == thumbprint {
                    PinOutcome::Matched
                } else {
                    PinOutcome::Violation {
                        pinned: pinned.clone(),
                    }
                }
            }
        };

        if outcome == PinOutcome::FirstContact {
            let short = thumbprint.get(..16).unwrap_or(thumbprint);
            debug!(peer = %peer_id.short(), thumbprint = %short, "pinned certificate");
            self.persist();
        }
        outcome
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<CertificatePin> {
        self.pins.get(peer_id).map(|pin| pin.clone())
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    fn persist(&self) {
        let Some(file) = &self.persistence else {
            return;
        };
        let written = file.store(|| {
            let mut snapshot: Vec<CertificatePin> = self.pins.iter().map(|e| e.value().clone()).collect();
            snapshot.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
            snapshot
        });
        if let Err(e) = written {
            warn!(path = %file.path().display(), error = %e, "failed to persist certificate pins");
        }
    }
}

impl std::fmt::Debug for CertificatePinStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePinStore")
            .field("pins", &self.pins.len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Keypair;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(5_000))
    }

    #[test]
    fn first_contact_pins_then_requires_match() {
        let store = CertificatePinStore::in_memory(clock());
        let peer = Keypair::generate().peer_id();

        assert_eq!(store.check_and_pin(&peer, "T1"), PinOutcome::FirstContact);
        assert_eq!(store.check_and_pin(&peer, "T1"), PinOutcome::Matched);
        assert_eq!(
            store.check_and_pin(&peer, "T2"),
            PinOutcome::Violation { pinned: "T1".into() }
        );
        // A violation never replaces the pin.
        assert_eq!(store.get(&peer).unwrap().thumbprint, "T1");
        assert_eq!(store.get(&peer).unwrap().first_seen_at_ms, 5_000);
    }

    #[tokio::test]
    async fn concurrent_first_contacts_have_one_winner() {
        let store = Arc::new(CertificatePinStore::in_memory(clock()));
        let peer = Keypair::generate().peer_id();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                store.check_and_pin(&peer, &format!("thumb-{i}"))
            }));
        }
        let mut first = 0;
        for handle in handles {
            if handle.await.unwrap() == PinOutcome::FirstContact {
                first += 1;
            }
        }
        assert_eq!(first, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn pins_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let keypair = Keypair::generate();
        let peer = Keypair::generate().peer_id();

        {
            let store = CertificatePinStore::open(path.clone(), SealKey::derive(&keypair), clock());
            store.check_and_pin(&peer, "T1");
        }
        let store = CertificatePinStore::open(path, SealKey::derive(&keypair), clock());
        assert_eq!(
            store.check_and_pin(&peer, "T2"),
            PinOutcome::Violation { pinned: "T1".into() }
        );
    }

    #[test]
    fn tampered_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let keypair = Keypair::generate();
        let peer = Keypair::generate().peer_id();

        {
            let store = CertificatePinStore::open(path.clone(), SealKey::derive(&keypair), clock());
            store.check_and_pin(&peer, "T1");
        }
        let text = std::fs::read_to_string(&path).unwrap().replace("T1", "T9");
        std::fs::write(&path, text).unwrap();

        let store = CertificatePinStore::open(path, SealKey::derive(&keypair), clock());
        assert!(store.is_empty());
    }

    #[test]
    fn restored_older_pin_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let keypair = Keypair::generate();
        let first = Keypair::generate().peer_id();
        let second = Keypair::generate().peer_id();

        {
            let store = CertificatePinStore::open(path.clone(), SealKey::derive(&keypair), clock());
            store.check_and_pin(&first, "T1");
        }
        let older = std::fs::read(&path).unwrap();
        {
            let store = CertificatePinStore::open(path.clone(), SealKey::derive(&keypair), clock());
            store.check_and_pin(&second, "T2");
        }

        // Rolling back would forget the pin for `second`.
        std::fs::write(&path, older).unwrap();
        let store = CertificatePinStore::open(path.clone(), SealKey::derive(&keypair), clock());
        assert!(store.is_empty());

        // New pins are written above the rolled-back generation and load again.
        store.check_and_pin(&second, "T3");
        drop(store);
        let store = CertificatePinStore::open(path, SealKey::derive(&keypair), clock());
        assert_eq!(store.get(&second).unwrap().thumbprint, "T3");
    }
}
