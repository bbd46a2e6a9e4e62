//! # Identity and Key Material
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PublicKey`]: 32-byte Ed25519 verifying key as advertised on the wire
//! - [`PeerId`]: 32-byte identifier derived from a public key
//!
//! ## Identity Model
//!
//! `PeerId = BLAKE3(PEER_ID_DOMAIN || public_key)`. The PeerId is the
//! coordinate in DHT space and the identity callers ask for. Because it is a
//! hash rather than the key itself, every record that carries a PeerId also
//! carries the public key, and verifiers recompute the derivation. That
//! recomputation is the identity-binding check: a peer that signs validly
//! with its own key while claiming someone else's PeerId is rejected.
//!
//! ## Persistence
//!
//! [`Keypair::load_or_generate`] stores the raw 32-byte secret. A key file
//! that exists but cannot be read or has the wrong length is a fatal local
//! fault ([`MeshError::CorruptIdentity`]); it is never silently replaced,
//! since that would change the node's identity and invalidate every pin
//! other peers hold for it.

use std::cmp::Ordering;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::MeshError;

/// Domain separation prefix for PeerId derivation.
const PEER_ID_DOMAIN: &[u8] = b"meshgate-peer-id-v1:";

/// Length of a persisted secret key file.
const SECRET_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Load the keypair stored at `path`, or generate and persist a new one
    /// if the file does not exist.
    ///
    /// # Errors
    /// Returns [`MeshError::CorruptIdentity`] when the file exists but is
    /// unreadable or malformed, and [`MeshError::Io`] when a fresh key cannot
    /// be written.
    pub fn load_or_generate(path: &Path) -> Result<Self, MeshError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; SECRET_KEY_LEN] =
                    bytes.as_slice().try_into().map_err(|_| MeshError::CorruptIdentity {
                        path: path.to_path_buf(),
                        reason: format!(
                            "expected {} bytes, found {}",
                            SECRET_KEY_LEN,
                            bytes.len()
                        ),
                    })?;
                Ok(Self::from_secret_key_bytes(&secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, keypair.secret_key_bytes())?;
                info!(
                    peer = %keypair.peer_id(),
                    path = %path.display(),
                    "generated new identity key"
                );
                Ok(keypair)
            }
            Err(e) => Err(MeshError::CorruptIdentity {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public_key_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::derive(&self.public_key())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// An advertised Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes decode to a usable Ed25519 point.
    ///
    /// All-zero and all-0xFF keys are rejected up front; they are the
    /// placeholder values an unsigned record or a fuzzer is most likely to
    /// carry.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::derive(self)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// Deterministic identifier of a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the PeerId for a public key.
    pub fn derive(public_key: &PublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_DOMAIN);
        hasher.update(public_key.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Short hex prefix used in log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two peers is closer to a target in the
/// Kademlia XOR metric space.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
