//! TCP Relay with Actor-based Architecture
//!
//! Relays let peers that cannot accept inbound connections be reached
//! anyway, and act as the rendezvous point for hole punching.
//!
//! # Architecture
//!
//! ## Server Side (runs on relay-eligible nodes)
//! - [`RelayServer`]: public handle (cheap to clone)
//! - `RelayServerActor`: owns control channels, parked sessions and punch
//!   waiters; processes commands sequentially
//!
//! ## Client Side
//! - [`RelayClient`]: dials a relay, opens relayed streams, requests punches
//!   and keeps a control channel registered ([`RelayClient::listen`])
//!
//! # Protocol
//!
//! Every connection authenticates first: the relay sends a random
//! challenge and the client signs it with its identity key. The next frame
//! fixes the connection's role:
//!
//! | Frame | Role |
//! |-------|------|
//! | `Listen` | control channel: receives `Incoming` and `PunchNotify` |
//! | `Connect{target}` | initiator half of a relayed stream |
//! | `Accept{session_id}` | target half, answering an `Incoming` |
//! | `PunchRequest{..}` | asks the relay to exchange reflexive addresses |
//!
//! Once both halves of a session are present the relay answers `Connected`
//! on each and splices them byte for byte. Relayed bytes are end-to-end
//! TLS; the relay only sees ciphertext.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use lru::LruCache;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, RELAY_REGISTER_DOMAIN};
use crate::events::{self, SecurityEvent};
use crate::identity::{Keypair, PeerId};
use crate::messages::{read_frame, write_frame, RelayFrame};
use crate::ratelimit::{Counter, RateLimiter, SourceKey, ViolationType};

// ============================================================================
// Constants
// ============================================================================

/// Maximum concurrent connections the relay server handles.
/// SECURITY: Bounds spawned tasks and open sockets.
pub const MAX_RELAY_CONNECTIONS: usize = 1_024;

/// Maximum sessions parked while waiting for the target to accept.
pub const MAX_PENDING_SESSIONS: usize = 1_000;

/// Parked sessions the target has not accepted by now are dropped.
pub const PENDING_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum punch introductions awaiting the target's reply.
pub const MAX_PENDING_PUNCHES: usize = 1_000;

/// Interval for the cleanup pass over parked sessions and punches.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Time allowed for the challenge/authenticate exchange and the role frame.
pub const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames queued for one control channel before it is considered stuck.
const CONTROL_QUEUE_SIZE: usize = 32;

/// Delay before a dropped control channel is re-established.
const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn generate_session_id() -> Result<[u8; 16]> {
    let mut id = [0u8; 16];
    getrandom::getrandom(&mut id).map_err(|e| anyhow!("CSPRNG unavailable: {e}"))?;
    Ok(id)
}

// ============================================================================
// Actor State
// ============================================================================

struct PendingSession {
    initiator: PeerId,
    target: PeerId,
    stream: TcpStream,
    created_at: Instant,
}

struct PendingPunch {
    initiator: PeerId,
    target: PeerId,
    reply: oneshot::Sender<std::net::SocketAddr>,
    created_at: Instant,
}

struct ControlChannel {
    generation: u64,
    frames: mpsc::Sender<RelayFrame>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub control_channels: usize,
    pub pending_sessions: usize,
    pub pending_punches: usize,
}

enum RelayCommand {
    Listen {
        peer: PeerId,
        frames: mpsc::Sender<RelayFrame>,
        reply: oneshot::Sender<u64>,
    },
    Unlisten {
        peer: PeerId,
        generation: u64,
    },
    ControlFor {
        peer: PeerId,
        reply: oneshot::Sender<Option<mpsc::Sender<RelayFrame>>>,
    },
    Park {
        session_id: [u8; 16],
        session: PendingSession,
    },
    Take {
        session_id: [u8; 16],
        reply: oneshot::Sender<Option<PendingSession>>,
    },
    AwaitPunch {
        nonce: [u8; 16],
        punch: PendingPunch,
    },
    CompletePunch {
        nonce: [u8; 16],
        from: PeerId,
        reflexive: SocketAddr,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Quit,
}

struct RelayServerActor {
    controls: std::collections::HashMap<PeerId, ControlChannel>,
    sessions: LruCache<[u8; 16], PendingSession>,
    punches: LruCache<[u8; 16], PendingPunch>,
    next_generation: u64,
}

impl RelayServerActor {
    fn new() -> Self {
        let sessions = NonZeroUsize::new(MAX_PENDING_SESSIONS).unwrap_or(NonZeroUsize::MIN);
        let punches = NonZeroUsize::new(MAX_PENDING_PUNCHES).unwrap_or(NonZeroUsize::MIN);
        Self {
            controls: std::collections::HashMap::new(),
            sessions: LruCache::new(sessions),
            punches: LruCache::new(punches),
            next_generation: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Quit) | None => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = cleanup.tick() => self.cleanup(),
            }
        }
        debug!("relay actor stopped");
    }

    fn handle(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Listen { peer, frames, reply } => {
                self.next_generation += 1;
                let generation = self.next_generation;
                if self.controls.insert(peer, ControlChannel { generation, frames }).is_some() {
                    debug!(peer = %peer.short(), "control channel replaced");
                }
                let _ = reply.send(generation);
            }
            RelayCommand::Unlisten { peer, generation } => {
                if self.controls.get(&peer).is_some_and(|c| c.generation == generation) {
                    self.controls.remove(&peer);
                }
            }
            RelayCommand::ControlFor { peer, reply } => {
                let _ = reply.send(self.controls.get(&peer).map(|c| c.frames.clone()));
            }
            RelayCommand::Park { session_id, session } => {
                if let Some((_, evicted)) = self.sessions.push(session_id, session)
                    && evicted.created_at.elapsed() < PENDING_SESSION_TIMEOUT
                {
                    warn!(initiator = %evicted.initiator.short(), "pending session table full, evicting oldest");
                }
            }
            RelayCommand::Take { session_id, reply } => {
                let _ = reply.send(self.sessions.pop(&session_id));
            }
            RelayCommand::AwaitPunch { nonce, punch } => {
                self.punches.put(nonce, punch);
            }
            RelayCommand::CompletePunch { nonce, from, reflexive } => {
                let matches = self.punches.peek(&nonce).is_some_and(|p| p.target == from);
                if !matches {
                    debug!(peer = %from.short(), "punch reply for unknown introduction");
                    return;
                }
                if let Some(punch) = self.punches.pop(&nonce) {
                    trace!(
                        initiator = %punch.initiator.short(),
                        target = %from.short(),
                        "punch introduction complete"
                    );
                    let _ = punch.reply.send(reflexive);
                }
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(RelayStats {
                    control_channels: self.controls.len(),
                    pending_sessions: self.sessions.len(),
                    pending_punches: self.punches.len(),
                });
            }
            RelayCommand::Quit => {}
        }
    }

    fn cleanup(&mut self) {
        let expired: Vec<[u8; 16]> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.created_at.elapsed() > PENDING_SESSION_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.sessions.pop(id);
        }
        let stale: Vec<[u8; 16]> = self
            .punches
            .iter()
            .filter(|(_, p)| p.created_at.elapsed() > PENDING_SESSION_TIMEOUT || p.reply.is_closed())
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in &stale {
            self.punches.pop(nonce);
        }
        self.controls.retain(|_, c| !c.frames.is_closed());
        if !expired.is_empty() {
            debug!(count = expired.len(), "dropped unaccepted relay sessions");
        }
    }
}

// ============================================================================
// RelayServer Handle
// ============================================================================

/// Handle to a running relay service. Cheap to clone.
#[derive(Clone)]
pub struct RelayServer {
    cmd_tx: mpsc::Sender<RelayCommand>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RelayServer {
    /// Bind the relay listener and spawn the actor and accept loop. Both
    /// stop when `shutdown` flips.
    pub async fn start(
        addr: SocketAddr,
        limiter: Arc<RateLimiter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(RelayServerActor::new().run(cmd_rx));
        info!(addr = %local_addr, "relay server started");

        let server = Self { cmd_tx, local_addr };
        let accept_server = server.clone();
        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(MAX_RELAY_CONNECTIONS));
            loop {
                let (stream, remote) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            debug!(error = %e, "relay accept failed");
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                };
                let ip = remote.ip();
                if !limiter.admit(SourceKey::Addr(ip), Counter::ConnectionAttempt).is_allowed() {
                    trace!(%remote, "relay connection rate limited");
                    continue;
                }
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    debug!(%remote, "relay at connection capacity");
                    continue;
                };
                let server = accept_server.clone();
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle_connection(stream, remote, &limiter).await {
                        trace!(%remote, error = %e, "relay connection ended");
                    }
                    drop(permit);
                });
            }
            accept_server.quit().await;
        });
        Ok((server, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stats(&self) -> RelayStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::Stats { reply }).await.is_err() {
            return RelayStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }

    async fn control_for(&self, peer: PeerId) -> Option<mpsc::Sender<RelayFrame>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(RelayCommand::ControlFor { peer, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    async fn take_session(&self, session_id: [u8; 16]) -> Option<PendingSession> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(RelayCommand::Take { session_id, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    async fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr, limiter: &RateLimiter) -> Result<()> {
        let peer = match tokio::time::timeout(SIGNALING_TIMEOUT, authenticate_client(&mut stream)).await {
            Ok(Ok(peer)) => peer,
            Ok(Err(failure)) => {
                events::emit(failure.event(), &remote.to_string(), "relay authentication failed");
                limiter.record_violation(failure, SourceKey::Addr(remote.ip()), Some(remote.ip()));
                let _ = write_frame(&mut stream, &RelayFrame::Rejected {
                    reason: "authentication failed".into(),
                })
                .await;
                return Ok(());
            }
            Err(_) => bail!("authentication timed out"),
        };

        let role: RelayFrame = tokio::time::timeout(SIGNALING_TIMEOUT, read_frame(&mut stream))
            .await
            .context("role frame timed out")??;
        match role {
            RelayFrame::Listen => self.serve_control(stream, peer).await,
            RelayFrame::Connect { target } => self.open_session(stream, peer, target).await,
            RelayFrame::Accept { session_id } => self.accept_session(stream, peer, session_id).await,
            RelayFrame::PunchRequest { target, reflexive, nonce } => {
                self.introduce(stream, peer, target, reflexive, nonce).await
            }
            other => {
                events::emit(SecurityEvent::MalformedMessage, &remote.to_string(), "unexpected relay role frame");
                limiter.record_violation(ViolationType::MalformedMessage, SourceKey::Peer(peer), Some(remote.ip()));
                bail!("unexpected role frame {other:?}")
            }
        }
    }

    async fn serve_control(&self, stream: TcpStream, peer: PeerId) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (frames_tx, mut frames_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Listen {
                peer,
                frames: frames_tx,
                reply,
            })
            .await
            .map_err(|_| anyhow!("relay actor closed"))?;
        let generation = rx.await.map_err(|_| anyhow!("relay actor closed"))?;
        write_frame(&mut writer, &RelayFrame::Listen).await?;
        debug!(peer = %peer.short(), "control channel registered");

        let cmd_tx = self.cmd_tx.clone();
        let mut inbound = tokio::spawn(async move {
            loop {
                let frame: RelayFrame = match read_frame(&mut reader).await {
                    Ok(f) => f,
                    Err(_) => break,
                };
                if let RelayFrame::PunchReply { nonce, reflexive } = frame {
                    let _ = cmd_tx
                        .send(RelayCommand::CompletePunch {
                            nonce,
                            from: peer,
                            reflexive,
                        })
                        .await;
                }
            }
        });

        loop {
            tokio::select! {
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut inbound => break,
            }
        }
        inbound.abort();
        let _ = self.cmd_tx.send(RelayCommand::Unlisten { peer, generation }).await;
        debug!(peer = %peer.short(), "control channel closed");
        Ok(())
    }

    async fn open_session(&self, mut stream: TcpStream, initiator: PeerId, target: PeerId) -> Result<()> {
        let Some(control) = self.control_for(target).await else {
            write_frame(&mut stream, &RelayFrame::Unavailable).await?;
            return Ok(());
        };
        let session_id = generate_session_id()?;
        self.cmd_tx
            .send(RelayCommand::Park {
                session_id,
                session: PendingSession {
                    initiator,
                    target,
                    stream,
                    created_at: Instant::now(),
                },
            })
            .await
            .map_err(|_| anyhow!("relay actor closed"))?;

        let notified = control
            .send(RelayFrame::Incoming {
                session_id,
                from: initiator,
            })
            .await
            .is_ok();
        if !notified && let Some(mut session) = self.take_session(session_id).await {
            write_frame(&mut session.stream, &RelayFrame::Unavailable).await?;
        }
        trace!(
            initiator = %initiator.short(),
            target = %target.short(),
            session = %hex::encode(session_id),
            notified,
            "relay session parked"
        );
        Ok(())
    }

    async fn accept_session(&self, mut stream: TcpStream, peer: PeerId, session_id: [u8; 16]) -> Result<()> {
        let Some(session) = self.take_session(session_id).await else {
            write_frame(&mut stream, &RelayFrame::Unavailable).await?;
            return Ok(());
        };
        if session.target != peer {
            warn!(
                peer = %peer.short(),
                target = %session.target.short(),
                "relay session accepted by the wrong peer"
            );
            write_frame(&mut stream, &RelayFrame::Rejected {
                reason: "session belongs to another peer".into(),
            })
            .await?;
            return Ok(());
        }

        let mut initiator = session.stream;
        write_frame(&mut initiator, &RelayFrame::Connected).await?;
        write_frame(&mut stream, &RelayFrame::Connected).await?;
        debug!(
            initiator = %session.initiator.short(),
            target = %peer.short(),
            "relay session spliced"
        );
        let (up, down) = tokio::io::copy_bidirectional(&mut initiator, &mut stream).await?;
        trace!(bytes_up = up, bytes_down = down, "relay session finished");
        Ok(())
    }

    async fn introduce(
        &self,
        mut stream: TcpStream,
        initiator: PeerId,
        target: PeerId,
        reflexive: SocketAddr,
        nonce: [u8; 16],
    ) -> Result<()> {
        let Some(control) = self.control_for(target).await else {
            write_frame(&mut stream, &RelayFrame::Unavailable).await?;
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::AwaitPunch {
                nonce,
                punch: PendingPunch {
                    initiator,
                    target,
                    reply,
                    created_at: Instant::now(),
                },
            })
            .await
            .map_err(|_| anyhow!("relay actor closed"))?;
        if control
            .send(RelayFrame::PunchNotify {
                from: initiator,
                reflexive,
                nonce,
            })
            .await
            .is_err()
        {
            write_frame(&mut stream, &RelayFrame::Unavailable).await?;
            return Ok(());
        }

        let answer = match tokio::time::timeout(SIGNALING_TIMEOUT, rx).await {
            Ok(Ok(peer_reflexive)) => RelayFrame::PunchPeer {
                reflexive: peer_reflexive,
            },
            _ => RelayFrame::Unavailable,
        };
        write_frame(&mut stream, &answer).await
    }
}

/// Server half of the challenge exchange. Returns the authenticated PeerId
/// or the violation to record.
async fn authenticate_client(stream: &mut TcpStream) -> Result<PeerId, ViolationType> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).map_err(|_| ViolationType::HandshakeFailure)?;
    write_frame(stream, &RelayFrame::Challenge { nonce })
        .await
        .map_err(|_| ViolationType::HandshakeFailure)?;
    let frame: RelayFrame = read_frame(stream)
        .await
        .map_err(|_| ViolationType::MalformedMessage)?;
    let RelayFrame::Authenticate { public_key, signature } = frame else {
        return Err(ViolationType::MalformedMessage);
    };
    verify_with_domain(&public_key, RELAY_REGISTER_DOMAIN, &nonce, &signature)
        .map_err(|_| ViolationType::SignatureInvalid)?;
    write_frame(stream, &RelayFrame::Authenticated)
        .await
        .map_err(|_| ViolationType::HandshakeFailure)?;
    Ok(public_key.peer_id())
}

// ============================================================================
// RelayClient
// ============================================================================

/// What a registered control channel reports to the node.
#[derive(Debug)]
pub enum RelayEvent {
    /// A relayed stream from `from`, ready for the overlay handshake.
    Incoming {
        from: PeerId,
        relay: SocketAddr,
        stream: TcpStream,
    },
    /// `from` wants to hole punch; its reflexive UDP address is attached.
    PunchRequested {
        from: PeerId,
        peer_reflexive: SocketAddr,
        nonce: [u8; 16],
    },
}

/// Client-side relay operations for one identity.
#[derive(Clone)]
pub struct RelayClient {
    keypair: Arc<Keypair>,
    timeout: Duration,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("peer_id", &self.keypair.peer_id())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RelayClient {
    pub fn new(keypair: Arc<Keypair>, timeout: Duration) -> Self {
        Self { keypair, timeout }
    }

    async fn dial(&self, relay: SocketAddr) -> Result<TcpStream> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(relay))
            .await
            .context("relay connect timed out")?
            .with_context(|| format!("relay {relay} refused connection"))?;
        let challenge: RelayFrame = self.read(&mut stream).await?;
        let RelayFrame::Challenge { nonce } = challenge else {
            bail!("relay sent {challenge:?} instead of a challenge");
        };
        let signature = sign_with_domain(&self.keypair, RELAY_REGISTER_DOMAIN, &nonce);
        write_frame(&mut stream, &RelayFrame::Authenticate {
            public_key: self.keypair.public_key(),
            signature,
        })
        .await?;
        match self.read(&mut stream).await? {
            RelayFrame::Authenticated => Ok(stream),
            RelayFrame::Rejected { reason } => bail!("relay rejected authentication: {reason}"),
            other => bail!("unexpected relay frame {other:?}"),
        }
    }

    async fn read(&self, stream: &mut TcpStream) -> Result<RelayFrame> {
        tokio::time::timeout(self.timeout, read_frame(stream))
            .await
            .context("relay signaling timed out")?
    }

    /// Open a stream to `target` through `relay`. The returned stream
    /// carries raw bytes to the target once this returns.
    pub async fn connect_via(&self, relay: SocketAddr, target: PeerId) -> Result<TcpStream> {
        let mut stream = self.dial(relay).await?;
        write_frame(&mut stream, &RelayFrame::Connect { target }).await?;
        match self.read(&mut stream).await? {
            RelayFrame::Connected => {
                debug!(%relay, target = %target.short(), "relayed stream established");
                Ok(stream)
            }
            RelayFrame::Unavailable => bail!("target {} not registered at relay {relay}", target.short()),
            other => bail!("unexpected relay frame {other:?}"),
        }
    }

    /// Exchange reflexive UDP addresses with `target` through `relay`.
    pub async fn request_punch(
        &self,
        relay: SocketAddr,
        target: PeerId,
        reflexive: SocketAddr,
        nonce: [u8; 16],
    ) -> Result<SocketAddr> {
        let mut stream = self.dial(relay).await?;
        write_frame(&mut stream, &RelayFrame::PunchRequest {
            target,
            reflexive,
            nonce,
        })
        .await?;
        let answer = tokio::time::timeout(SIGNALING_TIMEOUT + self.timeout, read_frame(&mut stream))
            .await
            .context("punch introduction timed out")??;
        match answer {
            RelayFrame::PunchPeer { reflexive } => Ok(reflexive),
            RelayFrame::Unavailable => bail!("target {} unavailable for punching", target.short()),
            other => bail!("unexpected relay frame {other:?}"),
        }
    }

    /// Keep a control channel registered at `relay` until shutdown,
    /// reconnecting when it drops. Punch introductions are answered with
    /// the current value of `reflexive`.
    pub fn listen(
        &self,
        relay: SocketAddr,
        reflexive: watch::Receiver<Option<SocketAddr>>,
        events: mpsc::Sender<RelayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = client.run_control(relay, &reflexive, &events) => {
                        if let Err(e) = result {
                            debug!(%relay, error = %e, "relay control channel dropped");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                if events.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(LISTEN_RETRY_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
            }
            trace!(%relay, "relay listener stopped");
        })
    }

    async fn run_control(
        &self,
        relay: SocketAddr,
        reflexive: &watch::Receiver<Option<SocketAddr>>,
        events: &mpsc::Sender<RelayEvent>,
    ) -> Result<()> {
        let stream = self.dial(relay).await?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &RelayFrame::Listen).await?;
        match tokio::time::timeout(self.timeout, read_frame(&mut reader)).await?? {
            RelayFrame::Listen => {}
            other => bail!("relay refused control channel: {other:?}"),
        }
        info!(%relay, "registered with relay");

        loop {
            let frame: RelayFrame = read_frame(&mut reader).await?;
            match frame {
                RelayFrame::Incoming { session_id, from } => {
                    let client = self.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        match client.accept_session(relay, session_id).await {
                            Ok(stream) => {
                                let _ = events.send(RelayEvent::Incoming { from, relay, stream }).await;
                            }
                            Err(e) => debug!(%relay, error = %e, "failed to accept relayed session"),
                        }
                    });
                }
                RelayFrame::PunchNotify { from, reflexive: peer_reflexive, nonce } => {
                    self.answer_punch(&mut writer, reflexive, nonce).await?;
                    let _ = events
                        .send(RelayEvent::PunchRequested {
                            from,
                            peer_reflexive,
                            nonce,
                        })
                        .await;
                }
                other => trace!(%relay, frame = ?other, "ignoring control frame"),
            }
        }
    }

    async fn answer_punch(
        &self,
        writer: &mut OwnedWriteHalf,
        reflexive: &watch::Receiver<Option<SocketAddr>>,
        nonce: [u8; 16],
    ) -> Result<()> {
        let current = *reflexive.borrow();
        match current {
            Some(reflexive) => write_frame(writer, &RelayFrame::PunchReply { nonce, reflexive }).await,
            None => {
                debug!("punch requested before our reflexive address is known");
                Ok(())
            }
        }
    }

    async fn accept_session(&self, relay: SocketAddr, session_id: [u8; 16]) -> Result<TcpStream> {
        let mut stream = self.dial(relay).await?;
        write_frame(&mut stream, &RelayFrame::Accept { session_id }).await?;
        match self.read(&mut stream).await? {
            RelayFrame::Connected => Ok(stream),
            other => bail!("relay did not complete session: {other:?}"),
        }
    }
}
