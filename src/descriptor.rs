//! # Peer Descriptors
//!
//! A [`PeerDescriptor`] is the signed, versioned record a peer publishes in
//! the DHT to say how it can be reached and how to authenticate it:
//! transport endpoints, TLS certificate pins and the keys allowed to sign
//! on its behalf.
//!
//! ## Canonical Encoding
//!
//! Signatures cover [`PeerDescriptor::canonical_bytes`], a fixed layout
//! that does not depend on any serializer's field ordering:
//!
//! | Field | Encoding |
//! |-------|----------|
//! | peer_id | 32 bytes |
//! | sequence | u64 LE |
//! | expires_at_ms | u64 LE |
//! | nat_type | u8 |
//! | endpoints | u32 LE count, then per endpoint: kind u8, host (u32 LE length + UTF-8), port u16 LE, scope u8, preference u8, cost u16 LE |
//! | certificate_pins | u32 LE count, then u32 LE length + UTF-8 each |
//! | control_signing_keys | u32 LE count, then 32 bytes each |
//! | control_key_endorsement | u32 LE length + bytes |
//! | identity_key | 32 bytes |
//!
//! Every variable-length field is length-prefixed, so no two distinct
//! descriptors share an encoding. The signature itself is excluded.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};
use crate::nat::NatType;

/// Maximum transport endpoints per descriptor.
pub const MAX_ENDPOINTS: usize = 16;

/// Maximum host length (a DNS name or textual IP address).
pub const MAX_HOST_LEN: usize = 253;

/// Maximum certificate pins per descriptor.
pub const MAX_CERTIFICATE_PINS: usize = 8;

/// Maximum length of one certificate pin (hex SHA-256 is 64).
pub const MAX_PIN_LEN: usize = 128;

/// Maximum additional signing keys per descriptor.
pub const MAX_CONTROL_SIGNING_KEYS: usize = 4;

pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Plain TCP to the peer's overlay listener.
    Direct,
    /// A relay server the peer is registered with.
    Relay,
    /// A reflexive address usable for rendezvous-coordinated hole punching.
    HolePunch,
}

impl EndpointKind {
    const fn tag(self) -> u8 {
        match self {
            EndpointKind::Direct => 0,
            EndpointKind::Relay => 1,
            EndpointKind::HolePunch => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointScope {
    Public,
    Private,
    Loopback,
}

impl EndpointScope {
    const fn tag(self) -> u8 {
        match self {
            EndpointScope::Public => 0,
            EndpointScope::Private => 1,
            EndpointScope::Loopback => 2,
        }
    }

    pub fn of(ip: std::net::IpAddr) -> Self {
        use std::net::IpAddr;
        match ip {
            IpAddr::V4(v4) if v4.is_loopback() => EndpointScope::Loopback,
            IpAddr::V4(v4) if v4.is_private() || v4.is_link_local() => EndpointScope::Private,
            IpAddr::V6(v6) if v6.is_loopback() => EndpointScope::Loopback,
            IpAddr::V6(v6)
                if (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80 =>
            {
                EndpointScope::Private
            }
            _ => EndpointScope::Public,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportEndpoint {
    pub kind: EndpointKind,
    pub host: String,
    pub port: u16,
    pub scope: EndpointScope,
    /// Higher is tried first among endpoints of the same kind.
    pub preference: u8,
    /// Relative cost; breaks preference ties, lower first.
    pub cost: u16,
}

impl TransportEndpoint {
    pub fn direct(addr: std::net::SocketAddr) -> Self {
        Self {
            kind: EndpointKind::Direct,
            host: addr.ip().to_string(),
            port: addr.port(),
            scope: EndpointScope::of(addr.ip()),
            preference: 100,
            cost: 1,
        }
    }

    pub fn relay(addr: std::net::SocketAddr) -> Self {
        Self {
            kind: EndpointKind::Relay,
            host: addr.ip().to_string(),
            port: addr.port(),
            scope: EndpointScope::of(addr.ip()),
            preference: 10,
            cost: 10,
        }
    }

    /// The peer's externally mapped overlay listener, reachable once a punch
    /// through the rendezvous relay succeeds.
    pub fn hole_punch(addr: std::net::SocketAddr) -> Self {
        Self {
            kind: EndpointKind::HolePunch,
            host: addr.ip().to_string(),
            port: addr.port(),
            scope: EndpointScope::of(addr.ip()),
            preference: 50,
            cost: 5,
        }
    }

    /// The endpoint as a socket address, when `host` is a literal IP.
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self.host.parse().ok()?;
        Some(std::net::SocketAddr::new(ip, self.port))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub sequence: u64,
    pub expires_at_ms: u64,
    pub nat_type: NatType,
    pub endpoints: Vec<TransportEndpoint>,
    /// Hex SHA-256 thumbprints of certificates the peer may present.
    pub certificate_pins: Vec<String>,
    pub control_signing_keys: Vec<PublicKey>,
    /// Identity-key signature over `control_signing_keys`; empty when there
    /// are none. A control key can only sign for the peer once endorsed.
    pub control_key_endorsement: Vec<u8>,
    /// Key the PeerId is derived from.
    pub identity_key: PublicKey,
    pub signature: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureError {
    TooManyEndpoints,
    HostTooLong,
    EmptyHost,
    TooManyPins,
    PinTooLong,
    TooManyControlKeys,
    BadEndorsement,
    BadSignatureLength,
}

impl std::fmt::Display for StructureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            StructureError::TooManyEndpoints => "too many endpoints",
            StructureError::HostTooLong => "endpoint host too long",
            StructureError::EmptyHost => "endpoint host empty",
            StructureError::TooManyPins => "too many certificate pins",
            StructureError::PinTooLong => "certificate pin too long",
            StructureError::TooManyControlKeys => "too many control signing keys",
            StructureError::BadEndorsement => "control key endorsement missing or malformed",
            StructureError::BadSignatureLength => "signature has wrong length",
        };
        f.write_str(msg)
    }
}

impl PeerDescriptor {
    /// An unsigned descriptor for `identity_key`.
    pub fn unsigned(identity_key: PublicKey, sequence: u64, expires_at_ms: u64) -> Self {
        Self {
            peer_id: identity_key.peer_id(),
            sequence,
            expires_at_ms,
            nat_type: NatType::Unknown,
            endpoints: Vec::new(),
            certificate_pins: Vec::new(),
            control_signing_keys: Vec::new(),
            control_key_endorsement: Vec::new(),
            identity_key,
            signature: Vec::new(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.peer_id.as_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.expires_at_ms.to_le_bytes());
        out.push(self.nat_type.tag());

        put_len(&mut out, self.endpoints.len());
        for endpoint in &self.endpoints {
            out.push(endpoint.kind.tag());
            put_bytes(&mut out, endpoint.host.as_bytes());
            out.extend_from_slice(&endpoint.port.to_le_bytes());
            out.push(endpoint.scope.tag());
            out.push(endpoint.preference);
            out.extend_from_slice(&endpoint.cost.to_le_bytes());
        }

        put_len(&mut out, self.certificate_pins.len());
        for pin in &self.certificate_pins {
            put_bytes(&mut out, pin.as_bytes());
        }

        put_len(&mut out, self.control_signing_keys.len());
        for key in &self.control_signing_keys {
            out.extend_from_slice(key.as_bytes());
        }
        put_bytes(&mut out, &self.control_key_endorsement);

        out.extend_from_slice(self.identity_key.as_bytes());
        out
    }

    /// BLAKE3 of the canonical encoding; identifies the signed content.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.canonical_bytes()).as_bytes()
    }

    pub fn validate_structure(&self) -> Result<(), StructureError> {
        if self.endpoints.len() > MAX_ENDPOINTS {
            return Err(StructureError::TooManyEndpoints);
        }
        for endpoint in &self.endpoints {
            if endpoint.host.is_empty() {
                return Err(StructureError::EmptyHost);
            }
            if endpoint.host.len() > MAX_HOST_LEN {
                return Err(StructureError::HostTooLong);
            }
        }
        if self.certificate_pins.len() > MAX_CERTIFICATE_PINS {
            return Err(StructureError::TooManyPins);
        }
        if self.certificate_pins.iter().any(|p| p.len() > MAX_PIN_LEN) {
            return Err(StructureError::PinTooLong);
        }
        if self.control_signing_keys.len() > MAX_CONTROL_SIGNING_KEYS {
            return Err(StructureError::TooManyControlKeys);
        }
        let endorsement_len = if self.control_signing_keys.is_empty() { 0 } else { SIGNATURE_LEN };
        if self.control_key_endorsement.len() != endorsement_len {
            return Err(StructureError::BadEndorsement);
        }
        if self.signature.len() != SIGNATURE_LEN {
            return Err(StructureError::BadSignatureLength);
        }
        Ok(())
    }

    /// Endpoints of `kind`, best first.
    pub fn endpoints_of(&self, kind: EndpointKind) -> Vec<&TransportEndpoint> {
        let mut matching: Vec<&TransportEndpoint> =
            self.endpoints.iter().filter(|e| e.kind == kind).collect();
        matching.sort_by(|a, b| b.preference.cmp(&a.preference).then(a.cost.cmp(&b.cost)));
        matching
    }

    pub fn has_public_direct_endpoint(&self) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.kind == EndpointKind::Direct && e.scope == EndpointScope::Public)
    }
}

/// Bytes the identity key signs to endorse a set of control signing keys.
pub fn control_keys_encoding(peer_id: &PeerId, keys: &[PublicKey]) -> Vec<u8> {
    let mut out = Vec::with_capacity(36 + keys.len() * 32);
    out.extend_from_slice(peer_id.as_bytes());
    put_len(&mut out, keys.len());
    for key in keys {
        out.extend_from_slice(key.as_bytes());
    }
    out
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    // Lengths are bounded by validate_structure long before u32 overflow.
    out.extend_from_slice(&(len as u32).to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_len(out, bytes.len());
    out.extend_from_slice(bytes);
}
