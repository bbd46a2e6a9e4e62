//! # Transports
//!
//! Ways of obtaining a raw byte stream to a peer endpoint. Each one
//! implements [`Transport`]; [`crate::nat::NatTraversal`] decides which to
//! try and in what order.
//!
//! | Transport | Endpoint kind | Mechanism |
//! |-----------|---------------|-----------|
//! | [`DirectTransport`] | `Direct` | plain TCP connect |
//! | [`HolePunchTransport`] | `HolePunch` | relay introduction, UDP punch, then TCP connect |
//! | [`RelayTransport`] | `Relay` | stream spliced through a relay server |
//!
//! None of these authenticate anything: the overlay handshake on top of the
//! returned stream does.
//!
//! ## Hole Punching
//!
//! 1. Ask a relay the target is registered with to introduce us, trading
//!    our reflexive UDP address for theirs.
//! 2. Both sides send punch datagrams to each other from their RPC sockets.
//! 3. An acknowledgement inside the punch window confirms a round trip.
//! 4. Connect over TCP to the target's advertised hole-punch endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::descriptor::{EndpointKind, PeerDescriptor, TransportEndpoint};
use crate::protocols::{BoxedStream, Transport};
use crate::relay::RelayClient;
use crate::rpc::RpcEndpoint;

fn endpoint_addr(endpoint: &TransportEndpoint) -> Result<SocketAddr> {
    endpoint
        .socket_addr()
        .ok_or_else(|| anyhow!("endpoint host {:?} is not an IP address", endpoint.host))
}

async fn tcp_connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("TCP connect to {addr} failed"))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// ============================================================================
// Direct
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct DirectTransport;

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Direct
    }

    async fn connect(&self, endpoint: &TransportEndpoint, _target: &PeerDescriptor) -> Result<BoxedStream> {
        let stream = tcp_connect(endpoint_addr(endpoint)?).await?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Clone, Debug)]
pub struct RelayTransport {
    client: RelayClient,
}

impl RelayTransport {
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Relay
    }

    async fn connect(&self, endpoint: &TransportEndpoint, target: &PeerDescriptor) -> Result<BoxedStream> {
        let relay = endpoint_addr(endpoint)?;
        let stream = self.client.connect_via(relay, target.peer_id).await?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// Hole Punch
// ============================================================================

pub struct HolePunchTransport {
    rpc: RpcEndpoint,
    relay: RelayClient,
    reflexive: watch::Receiver<Option<SocketAddr>>,
    punch_window: Duration,
}

impl HolePunchTransport {
    pub fn new(
        rpc: RpcEndpoint,
        relay: RelayClient,
        reflexive: watch::Receiver<Option<SocketAddr>>,
        punch_window: Duration,
    ) -> Self {
        Self {
            rpc,
            relay,
            reflexive,
            punch_window,
        }
    }

    async fn punch_through(&self, rendezvous: SocketAddr, target: &PeerDescriptor, ours: SocketAddr) -> Result<()> {
        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce).map_err(|e| anyhow!("CSPRNG unavailable: {e}"))?;
        let theirs = self
            .relay
            .request_punch(rendezvous, target.peer_id, ours, nonce)
            .await?;
        trace!(peer = %target.peer_id.short(), %theirs, "punch introduction received");
        match self.rpc.punch(theirs, nonce, self.punch_window).await? {
            Some(confirmed) => {
                debug!(peer = %target.peer_id.short(), %confirmed, "punch confirmed round trip");
                Ok(())
            }
            None => bail!("no punch acknowledgement within {:?}", self.punch_window),
        }
    }
}

impl std::fmt::Debug for HolePunchTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePunchTransport")
            .field("reflexive", &*self.reflexive.borrow())
            .field("punch_window", &self.punch_window)
            .finish()
    }
}

#[async_trait]
impl Transport for HolePunchTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::HolePunch
    }

    async fn connect(&self, endpoint: &TransportEndpoint, target: &PeerDescriptor) -> Result<BoxedStream> {
        let destination = endpoint_addr(endpoint)?;
        let ours = (*self.reflexive.borrow()).context("own reflexive address unknown")?;

        let mut last_error = anyhow!("target advertises no rendezvous relay");
        for relay in target.endpoints_of(EndpointKind::Relay) {
            let Some(rendezvous) = relay.socket_addr() else {
                continue;
            };
            match self.punch_through(rendezvous, target, ours).await {
                Ok(()) => {
                    let stream = tcp_connect(destination).await?;
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!(%rendezvous, error = %e, "punch via relay failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
