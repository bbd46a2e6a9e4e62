//! Capability traits at the seams between components.
//!
//! | Trait | Implemented by | Consumed by |
//! |-------|----------------|-------------|
//! | [`DhtRpc`] | [`crate::rpc::RpcEndpoint`] (UDP), in-memory test networks | [`crate::dht::DhtNode`] |
//! | [`ValueValidator`] | [`crate::descriptor_store::RecordValidator`] | [`crate::dht::DhtNode`] STORE handling |
//! | [`Transport`] | direct, relay and hole-punch transports in [`crate::transport`] | [`crate::nat::NatTraversal`] |
//!
//! Traits live here rather than next to their implementations so the DHT
//! can be driven by a fake network in tests, and so path selection depends
//! only on "something that yields a byte stream for an endpoint".

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::descriptor::{EndpointKind, PeerDescriptor, TransportEndpoint};
use crate::dht::{Key, StoreOutcome};
use crate::identity::PeerId;
use crate::ratelimit::ViolationType;
use crate::routing::Contact;

/// DHT operations against a remote node.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// The closest contacts `to` knows for `target`.
    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>>;

    /// Values stored under `key` at `to`, or closer contacts when it holds none.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Vec<Vec<u8>>, Vec<Contact>)>;

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>, ttl: Duration) -> Result<StoreOutcome>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueVerdict {
    /// Store the value under its authenticated publisher.
    Accept { publisher: PeerId },
    Reject(ViolationType),
}

/// Decides whether a STORE may enter the local value store.
pub trait ValueValidator: Send + Sync + 'static {
    fn validate(&self, key: &Key, value: &[u8], from: &PeerId) -> ValueVerdict;
}

/// Accepts everything, attributing each value to the peer that stored it.
#[cfg(test)]
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

#[cfg(test)]
impl ValueValidator for AcceptAll {
    fn validate(&self, _key: &Key, _value: &[u8], from: &PeerId) -> ValueVerdict {
        ValueVerdict::Accept { publisher: *from }
    }
}

/// Byte stream a transport hands to the TLS layer.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayStream for T {}

pub type BoxedStream = Box<dyn OverlayStream>;

/// One way of reaching a peer endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> EndpointKind;

    /// Open a raw stream to `endpoint` of `target`. Authentication happens
    /// above this layer.
    async fn connect(&self, endpoint: &TransportEndpoint, target: &PeerDescriptor) -> Result<BoxedStream>;
}
