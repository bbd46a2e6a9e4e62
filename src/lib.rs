//! # Meshgate - Secure Peer Rendezvous for Mesh Overlays
//!
//! Meshgate lets nodes of a decentralized overlay find each other by
//! identity, get a byte stream through whatever NAT sits in between, and
//! mutually authenticate before a single application byte flows:
//!
//! - **Identity**: Ed25519 keypairs; `PeerId = BLAKE3(domain ‖ public key)`
//! - **Discovery**: Kademlia DHT storing signed, sequenced peer descriptors
//! - **Reachability**: NAT classification and a direct → hole punch → relay chain
//! - **Authentication**: mutual TLS plus a signed hello bound to the certificate
//! - **Abuse resistance**: sliding-window rate limits and violation tracking
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**:
//! - Each component (DHT, relay server) has a public handle and a private actor
//! - Handles are cheap to clone and talk to the actor over async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! Shared lookup state that must be updated atomically from many tasks
//! (certificate pins, sequence marks, rate-limit windows) lives in sharded
//! concurrent maps instead.
//!
//! ## Security Model
//!
//! - Every overlay stream is mutually authenticated; rejections are values,
//!   not errors
//! - Descriptors are signed, expire, and never roll back to an older sequence
//! - First-contact certificate pins persist across restarts, sealed on disk
//! - Every inbound message size and every table is bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, public keys and PeerIds |
//! | `crypto` | Domain-separated signatures, certificates, TLS configuration |
//! | `config` | TOML configuration with defaults |
//! | `dht` / `routing` | Kademlia routing table, lookups and value store |
//! | `rpc` | UDP datagram RPC implementing the DHT and NAT probes |
//! | `descriptor` / `signing` | Peer descriptors, signing and freshness checks |
//! | `descriptor_store` | Descriptor and provider records on top of the DHT |
//! | `nat` / `transport` / `relay` | Classification, transports, relay service |
//! | `connection` | Overlay handshake and authenticated streams |
//! | `pins` / `sealed` | TOFU certificate pins and tamper-evident persistence |
//! | `ratelimit` | Sliding-window limits and violation records |
//! | `certmon` | Certificate expiration monitoring |
//! | `events` | Security event identifiers and structured logging |

mod certmon;
mod clock;
mod config;
mod connection;
mod crypto;
mod descriptor;
mod descriptor_store;
mod dht;
mod error;
mod events;
mod identity;
mod logging;
mod messages;
mod nat;
mod node;
mod pins;
mod protocols;
mod ratelimit;
mod relay;
mod routing;
mod rpc;
mod sealed;
mod signing;
mod transport;

pub use node::MeshNode;

pub use certmon::{
    CertificateExpirationMonitor, CertificateReport, CertificateSource, CertificateStatus, ScanReport,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BootstrapPeer, CertMonitorSettings, ConfigError, ConnectionSettings, DescriptorSettings, DhtSettings,
    MeshConfig, NatSettings, RateLimitSettings, TlsSettings, TlsVersionPolicy,
};
pub use connection::{AuthenticatedStream, ConnectionState, Direction, HandshakeOutcome, RejectReason};
pub use crypto::{
    certificate_not_after_ms, certificate_thumbprint, extract_public_key_from_cert, generate_certificate,
    generate_identity_certificate, sign_with_domain, verify_with_domain, SignatureError, TlsMaterial,
};
pub use descriptor::{EndpointKind, EndpointScope, PeerDescriptor, TransportEndpoint};
pub use descriptor_store::{content_key, descriptor_key, LocalProfile, ProviderRecord};
pub use dht::{DhtStats, StoreOutcome, StoreRejection};
pub use error::MeshError;
pub use events::SecurityEvent;
pub use identity::{Keypair, PeerId, PublicKey};
pub use logging::init_tracing;
pub use nat::{classify, NatType, ProbeResults};
pub use pins::{CertificatePin, CertificatePinStore, PinOutcome};
pub use ratelimit::{Admission, Counter, RateLimiter, SourceKey, ViolationRecord, ViolationType};
pub use relay::RelayStats;
pub use routing::Contact;
pub use signing::{
    DescriptorOutcome, DescriptorRejection, DescriptorSigningService, SequenceOutcome, SequenceStore,
};
