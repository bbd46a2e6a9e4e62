//! # Sealed Files
//!
//! Small JSON documents protected by a keyed BLAKE3 tag. Used for state
//! that must not be silently edited while the node is offline: the
//! certificate pin store and the descriptor sequence high-water marks.
//!
//! ## Format
//!
//! ```json
//! { "version": 1, "generation": 7, "body": "<json text>", "tag": "<hex blake3 keyed hash>" }
//! ```
//!
//! The tag covers `version || generation || body` exactly as stored, so
//! re-serializing the body can never change what was authenticated.
//!
//! ## Key
//!
//! The sealing key is derived from the node's identity secret with
//! `blake3::derive_key`, so only the node that wrote the file can produce a
//! valid tag and no extra key file is needed.
//!
//! ## Rollback
//!
//! A tag alone proves the file was written by this node, not that it is
//! the *latest* file this node wrote. [`SealedFile`] therefore numbers
//! every write and records the newest generation in a sealed marker next
//! to the data (`<name>.generation`):
//!
//! | Data | Marker | Result |
//! |------|--------|--------|
//! | absent | absent | empty store |
//! | generation `g` | generation `m`, `g >= m` | loaded |
//! | generation `g` | generation `m`, `g < m` | [`SealError::Rollback`] |
//! | absent | present | [`SealError::Rollback`] (deleted) |
//! | generation `g > 1` | absent or for another file | [`SealError::MarkerInvalid`] |
//!
//! The data is written before the marker, so a crash between the two
//! leaves a data file that is newer than its marker, which loads.
//! Restoring old copies of both files together is not detectable.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Keypair;

const SEAL_CONTEXT: &str = "meshgate sealed-store v1";
const SEALED_FORMAT_VERSION: u32 = 1;

/// Refuse to parse sealed files larger than this.
const MAX_SEALED_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealed file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("sealed file is not valid: {0}")]
    Format(#[from] serde_json::Error),
    #[error("sealed file exceeds {MAX_SEALED_FILE_SIZE} bytes")]
    TooLarge,
    #[error("unsupported sealed file version {0}")]
    Version(u32),
    #[error("integrity tag mismatch")]
    TagMismatch,
    #[error("sealed file is generation {found} but generation {latest} was written")]
    Rollback { found: u64, latest: u64 },
    #[error("generation marker is missing or belongs to another file")]
    MarkerInvalid,
}

impl SealError {
    /// Whether the file exists but cannot be trusted (as opposed to an I/O
    /// fault while reading it).
    pub fn is_tamper(&self) -> bool {
        matches!(
            self,
            SealError::Format(_)
                | SealError::TagMismatch
                | SealError::Version(_)
                | SealError::Rollback { .. }
                | SealError::MarkerInvalid
        )
    }
}

#[derive(Clone)]
pub struct SealKey([u8; 32]);

impl SealKey {
    pub fn derive(keypair: &Keypair) -> Self {
        Self(blake3::derive_key(SEAL_CONTEXT, &keypair.secret_key_bytes()))
    }

    fn tag(&self, version: u32, generation: u64, body: &str) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&version.to_le_bytes());
        hasher.update(&generation.to_le_bytes());
        hasher.update(body.as_bytes());
        hasher.finalize()
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey(..)")
    }
}

#[derive(Serialize, Deserialize)]
struct SealedEnvelope {
    version: u32,
    generation: u64,
    body: String,
    tag: String,
}

/// Body of a `.generation` marker.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct GenerationMarker {
    file: String,
    generation: u64,
}

pub fn seal<T: Serialize>(key: &SealKey, generation: u64, value: &T) -> Result<Vec<u8>, SealError> {
    let body = serde_json::to_string(value)?;
    let tag = key.tag(SEALED_FORMAT_VERSION, generation, &body);
    let envelope = SealedEnvelope {
        version: SEALED_FORMAT_VERSION,
        generation,
        body,
        tag: tag.to_hex().to_string(),
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Verify and decode a sealed document, returning its generation too.
pub fn unseal<T: DeserializeOwned>(key: &SealKey, bytes: &[u8]) -> Result<(u64, T), SealError> {
    let envelope: SealedEnvelope = serde_json::from_slice(bytes)?;
    if envelope.version != SEALED_FORMAT_VERSION {
        return Err(SealError::Version(envelope.version));
    }
    let presented = blake3::Hash::from_hex(envelope.tag.as_bytes())
        .map_err(|_| SealError::TagMismatch)?;
    // blake3::Hash equality is constant-time.
    if presented != key.tag(envelope.version, envelope.generation, &envelope.body) {
        return Err(SealError::TagMismatch);
    }
    Ok((envelope.generation, serde_json::from_str(&envelope.body)?))
}

/// `path` with `suffix` appended to its full file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Atomically replace `path` with a sealed copy of `value`.
pub fn write_sealed<T: Serialize>(path: &Path, key: &SealKey, generation: u64, value: &T) -> Result<(), SealError> {
    let bytes = seal(key, generation, value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling(path, ".tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and verify a sealed file. A missing file is `Ok(None)`.
pub fn read_sealed<T: DeserializeOwned>(path: &Path, key: &SealKey) -> Result<Option<(u64, T)>, SealError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if metadata.len() > MAX_SEALED_FILE_SIZE {
        return Err(SealError::TooLarge);
    }
    let bytes = std::fs::read(path)?;
    unseal(key, &bytes).map(Some)
}

// ============================================================================
// Generation-checked files
// ============================================================================

/// A sealed file whose every write is numbered, with rollback detection
/// through a sealed generation marker.
pub struct SealedFile {
    path: PathBuf,
    marker: PathBuf,
    key: SealKey,
    /// Newest generation written or seen on disk. Held for the whole of a
    /// write so concurrent writers apply in order.
    generation: Mutex<u64>,
}

impl SealedFile {
    pub fn new(path: PathBuf, key: SealKey) -> Self {
        let marker = sibling(&path, ".generation");
        Self {
            path,
            marker,
            key,
            generation: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Newest generation the marker vouches for, if it belongs to this file.
    fn read_marker(&self) -> Result<Option<u64>, SealError> {
        match read_sealed::<GenerationMarker>(&self.marker, &self.key)? {
            None => Ok(None),
            Some((generation, marker)) if marker.file == self.file_name() && marker.generation == generation => {
                Ok(Some(generation))
            }
            Some(_) => Err(SealError::MarkerInvalid),
        }
    }

    /// Read and verify the file. `Ok(None)` only when neither the file nor
    /// its marker exists.
    ///
    /// Whatever the outcome, later writes are numbered above every
    /// generation found on disk, so an error is reported once and the next
    /// write restores a consistent pair.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SealError> {
        let mut generation = self.lock();
        let marker = self.read_marker();
        let data = read_sealed::<T>(&self.path, &self.key);

        let latest = marker.as_ref().ok().copied().flatten().unwrap_or(0);
        let found = match &data {
            Ok(Some((found, _))) => *found,
            _ => 0,
        };
        *generation = latest.max(found);

        let data = data?;
        let marker = marker?;
        match (data, marker) {
            (None, None) => Ok(None),
            (None, Some(latest)) => Err(SealError::Rollback { found: 0, latest }),
            (Some((found, _)), Some(latest)) if found < latest => Err(SealError::Rollback { found, latest }),
            (Some((found, _)), None) if found > 1 => Err(SealError::MarkerInvalid),
            (Some((_, value)), _) => Ok(Some(value)),
        }
    }

    /// Write the value produced by `snapshot` as the next generation. The
    /// snapshot is taken under the write lock, so an older snapshot never
    /// replaces a newer one.
    pub fn store<T: Serialize>(&self, snapshot: impl FnOnce() -> T) -> Result<(), SealError> {
        let mut generation = self.lock();
        let next = generation.saturating_add(1);
        write_sealed(&self.path, &self.key, next, &snapshot())?;
        *generation = next;
        let marker = GenerationMarker {
            file: self.file_name(),
            generation: next,
        };
        write_sealed(&self.marker, &self.key, next, &marker)
    }
}

impl std::fmt::Debug for SealedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedFile")
            .field("path", &self.path)
            .field("generation", &*self.lock())
            .finish()
    }
}
