//! Error types that cross the public API.
//!
//! Authentication, freshness, malformed-input and resource-exhaustion
//! failures are never reported through [`MeshError`]: callers receive an
//! explicit outcome value (`HandshakeOutcome`, `DescriptorOutcome`,
//! `StoreOutcome`) instead. `MeshError` covers network failures that
//! exhausted the fallback chain and local faults.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::PeerId;

#[derive(Debug, Error)]
pub enum MeshError {
    /// The persisted identity key exists but cannot be used. Fatal at startup.
    #[error("identity key at {path} is corrupt: {reason}")]
    CorruptIdentity { path: PathBuf, reason: String },

    /// Every path in the traversal chain (direct, hole punch, relay) failed.
    #[error("peer {0:?} is unreachable")]
    PeerUnreachable(PeerId),

    /// No signed descriptor for the peer could be found in the DHT.
    #[error("no descriptor found for peer {0:?}")]
    DescriptorNotFound(PeerId),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
