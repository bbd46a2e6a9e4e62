//! # Wire Protocol Messages
//!
//! Every message that crosses the network, and the bounded codecs that
//! read them.
//!
//! | Protocol | Carrier | Types |
//! |----------|---------|-------|
//! | DHT RPC, NAT probes, punching | UDP datagram | [`Datagram`] ([`DhtRequest`] / [`DhtResponse`]) |
//! | Overlay hello | length-prefixed frame inside TLS | [`Hello`] |
//! | Relay signaling | length-prefixed frame over TCP | [`RelayFrame`] |
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE`: largest value a STORE may carry
//! - `MAX_DATAGRAM_SIZE`: largest datagram decoded or sent
//! - `MAX_FRAME_SIZE`: largest stream frame
//! - All decoding goes through size-limited bincode options, so a length
//!   field inside a message can never trigger an oversized allocation.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dht::{Key, StoreOutcome};
use crate::identity::{PeerId, PublicKey};
use crate::routing::Contact;

/// Largest value accepted by STORE. A maximal descriptor fits comfortably.
pub const MAX_VALUE_SIZE: usize = 8 * 1024;

/// Largest UDP payload this node sends or decodes.
pub const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// Values returned per FIND_VALUE response, keeping it under one datagram.
pub const MAX_VALUES_PER_RESPONSE: usize = 6;

/// Largest length-prefixed frame on a stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options(MAX_FRAME_SIZE).serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, bincode::Error> {
    bincode_options(limit).deserialize(bytes)
}

// ============================================================================
// UDP Datagrams
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMode {
    /// Answer from the socket the request arrived on.
    Basic,
    /// Answer from a different port on the same host.
    ChangePort,
    /// Have a different host answer.
    ChangeAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: PeerId },
    FindValue { key: Key },
    Store { key: Key, value: Vec<u8>, ttl_secs: u64 },
    /// Report the address this request was observed from.
    Binding { mode: BindingMode },
    /// Send a Binding response for request `id` to `reply_to` on behalf of
    /// the forwarding reflector.
    ReflectTo { reply_to: SocketAddr, id: u64 },
}

impl DhtRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "ping",
            DhtRequest::FindNode { .. } => "find_node",
            DhtRequest::FindValue { .. } => "find_value",
            DhtRequest::Store { .. } => "store",
            DhtRequest::Binding { .. } => "binding",
            DhtRequest::ReflectTo { .. } => "reflect_to",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Nodes(Vec<Contact>),
    Value {
        values: Vec<Vec<u8>>,
        closer: Vec<Contact>,
    },
    Stored(StoreOutcome),
    Binding { observed: SocketAddr },
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    /// Signed by `public_key` over [`request_signing_bytes`]; `from` must be
    /// the PeerId of that key.
    Request {
        id: u64,
        from: PeerId,
        public_key: PublicKey,
        sent_at_ms: u64,
        body: DhtRequest,
        signature: Vec<u8>,
    },
    Response { id: u64, from: PeerId, body: DhtResponse },
    /// Hole-punch probe; the receiver echoes the nonce in a `PunchAck`.
    Punch { nonce: [u8; 16], from: PeerId },
    PunchAck { nonce: [u8; 16], from: PeerId },
}

/// Bytes a request signature covers.
pub fn request_signing_bytes(
    id: u64,
    from: &PeerId,
    sent_at_ms: u64,
    body: &DhtRequest,
) -> Result<Vec<u8>, bincode::Error> {
    serialize(&(id, from, sent_at_ms, body))
}

pub fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>> {
    let bytes = bincode_options(MAX_DATAGRAM_SIZE)
        .serialize(datagram)
        .context("datagram encoding failed")?;
    Ok(bytes)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, bincode::Error> {
    deserialize_bounded(bytes, MAX_DATAGRAM_SIZE)
}

// ============================================================================
// Overlay Hello
// ============================================================================

/// First application message on an overlay TLS stream, sent by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub nonce: [u8; 32],
    /// Signature over nonce, PeerId and the sender's certificate thumbprint.
    pub signature: Vec<u8>,
}

// ============================================================================
// Relay Signaling
// ============================================================================

/// Frames on a relay connection.
///
/// Every connection starts with `Challenge` / `Authenticate` /
/// `Authenticated`; the next client frame fixes its role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame on every relay connection.
    Challenge { nonce: [u8; 32] },
    /// Proves ownership of a PeerId by signing the challenge nonce.
    Authenticate { public_key: PublicKey, signature: Vec<u8> },
    Authenticated,
    /// Make this connection the control channel for the authenticated PeerId.
    Listen,
    /// Ask the relay to splice this connection to `target`.
    Connect { target: PeerId },
    /// Sent on a control channel: open a data connection for `session_id`.
    Incoming { session_id: [u8; 16], from: PeerId },
    Accept { session_id: [u8; 16] },
    /// Both halves of a session are present; raw bytes follow.
    Connected,
    Unavailable,
    /// Ask the relay to introduce us to `target` for hole punching.
    PunchRequest { target: PeerId, reflexive: SocketAddr, nonce: [u8; 16] },
    /// Sent on the target's control channel.
    PunchNotify { from: PeerId, reflexive: SocketAddr, nonce: [u8; 16] },
    /// Target's answer on its control channel.
    PunchReply { nonce: [u8; 16], reflexive: SocketAddr },
    /// Relay's answer to the initiator.
    PunchPeer { reflexive: SocketAddr },
    Rejected { reason: String },
}

// ============================================================================
// Stream Framing
// ============================================================================

/// Write `value` as a big-endian u32 length followed by its bincode bytes.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serialize(value).context("frame encoding failed")?;
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds limit", bytes.len());
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds limit");
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let value = deserialize_bounded(&buf, MAX_FRAME_SIZE).context("frame decoding failed")?;
    Ok(value)
}
