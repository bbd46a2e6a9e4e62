//! # Rate Limiting and Violation Tracking
//!
//! Per-source sliding windows that bound how much work any address or
//! peer can make this node do, and escalate against sources that keep
//! failing authentication or sending garbage.
//!
//! ## Counters
//!
//! | Counter | Fed by | Blocks |
//! |---------|--------|--------|
//! | `ConnectionAttempt` | [`RateLimiter::admit`] before every inbound handshake | connections |
//! | `HandshakeFailure` | violations from the handshake | everything |
//! | `ProtocolViolation` | malformed messages, bad records | everything |
//! | `Store` | DHT STORE requests | STORE |
//! | `Probe` | NAT classification probes | probes |
//!
//! ## Escalation
//!
//! When a window fills up to its limit the source has committed an
//! *offense*. The first offense throttles it: requests of the blocking
//! kind are refused until enough timestamps age out of the window. Every
//! further offense (before the offense count decays after a long quiet
//! period) quarantines the source for `quarantine_base * 2^(n-2)`, capped
//! at `quarantine_max`.
//!
//! Windows only drain with time. Nothing a source does, including
//! completing a successful handshake, clears its recorded failures.
//!
//! ## Bounded Tracking
//!
//! At most `max_tracked_sources` sources are tracked. When the table is
//! full, the least recently used *idle* source makes room. A source that
//! is quarantined, throttled, or has anything in an abuse window is never
//! evicted; if every tracked source is in that state, new sources are
//! refused until windows drain. Flooding the table with fresh addresses
//! therefore cannot launder an offender's record.
//!
//! ## Consumers
//!
//! Every [`ViolationRecord`] is published on a broadcast channel so an
//! external reputation or moderation layer can act on it.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::events::{self, SecurityEvent};
use crate::identity::PeerId;

/// Capacity of the violation broadcast channel. Slow subscribers lag
/// rather than block the limiter.
const VIOLATION_CHANNEL_CAPACITY: usize = 1024;

/// Windows keep at most this multiple of their limit in timestamps.
const WINDOW_CAPACITY_FACTOR: usize = 2;

const COUNTER_COUNT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKey {
    Addr(IpAddr),
    Peer(PeerId),
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKey::Addr(ip) => write!(f, "{ip}"),
            SourceKey::Peer(peer) => write!(f, "{}", peer.short()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    ConnectionAttempt,
    HandshakeFailure,
    ProtocolViolation,
    Store,
    Probe,
}

impl Counter {
    const fn index(self) -> usize {
        match self {
            Counter::ConnectionAttempt => 0,
            Counter::HandshakeFailure => 1,
            Counter::ProtocolViolation => 2,
            Counter::Store => 3,
            Counter::Probe => 4,
        }
    }

    /// Abuse counters block every kind of request once full.
    const fn blocks_everything(self) -> bool {
        matches!(self, Counter::HandshakeFailure | Counter::ProtocolViolation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Throttled { retry_after_ms: u64 },
    Quarantined { until_ms: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// What a source did wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    MalformedMessage,
    HandshakeFailure,
    HandshakeTimeout,
    SignatureInvalid,
    IdentityMismatch,
    PinViolation,
    SequenceRollback,
    ExpiredDescriptor,
    StoreFlood,
}

impl ViolationType {
    pub const fn counter(self) -> Counter {
        match self {
            ViolationType::HandshakeFailure
            | ViolationType::HandshakeTimeout
            | ViolationType::SignatureInvalid
            | ViolationType::IdentityMismatch
            | ViolationType::PinViolation => Counter::HandshakeFailure,
            ViolationType::MalformedMessage
            | ViolationType::SequenceRollback
            | ViolationType::ExpiredDescriptor
            | ViolationType::StoreFlood => Counter::ProtocolViolation,
        }
    }

    /// Security event logged by the component that detects the violation.
    pub const fn event(self) -> SecurityEvent {
        match self {
            ViolationType::MalformedMessage => SecurityEvent::MalformedMessage,
            ViolationType::HandshakeFailure => SecurityEvent::HandshakeFailure,
            ViolationType::HandshakeTimeout => SecurityEvent::HandshakeTimeout,
            ViolationType::SignatureInvalid => SecurityEvent::SignatureInvalid,
            ViolationType::IdentityMismatch => SecurityEvent::IdentityMismatch,
            ViolationType::PinViolation => SecurityEvent::PinViolation,
            ViolationType::SequenceRollback => SecurityEvent::SequenceRollback,
            ViolationType::ExpiredDescriptor => SecurityEvent::DescriptorExpired,
            ViolationType::StoreFlood => SecurityEvent::RateLimitTripped,
        }
    }
}

/// A single recorded violation, as published to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Most specific identity known for the offender.
    pub source: SourceKey,
    /// Network address the violation arrived from, when known.
    pub addr: Option<IpAddr>,
    pub violation: ViolationType,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
struct SourceState {
    windows: [VecDeque<u64>; COUNTER_COUNT],
    offenses: u32,
    last_offense_ms: u64,
    quarantined_until_ms: u64,
}

impl SourceState {
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        for window in &mut self.windows {
            while window.front().is_some_and(|&t| t <= cutoff) {
                window.pop_front();
            }
        }
    }

    fn window(&self, counter: Counter) -> &VecDeque<u64> {
        &self.windows[counter.index()]
    }

    /// Newest timestamp in `counter`'s window is still inside it.
    fn is_live(&self, counter: Counter, now_ms: u64, window_ms: u64) -> bool {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.window(counter).back().is_some_and(|&t| t > cutoff)
    }
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    settings: RateLimitSettings,
    sources: Mutex<LruCache<SourceKey, SourceState>>,
    violations: broadcast::Sender<ViolationRecord>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(settings.max_tracked_sources.max(1)).unwrap_or(NonZeroUsize::MIN);
        let (violations, _) = broadcast::channel(VIOLATION_CHANNEL_CAPACITY);
        Self {
            clock,
            settings,
            sources: Mutex::new(LruCache::new(capacity)),
            violations,
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Current time on the limiter's clock.
    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Receive every violation recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ViolationRecord> {
        self.violations.subscribe()
    }

    fn limit(&self, counter: Counter) -> usize {
        let limit = match counter {
            Counter::ConnectionAttempt => self.settings.max_connection_attempts,
            Counter::HandshakeFailure => self.settings.max_handshake_failures,
            Counter::ProtocolViolation => self.settings.max_protocol_violations,
            Counter::Store => self.settings.max_stores,
            Counter::Probe => self.settings.max_probes,
        };
        (limit as usize).max(1)
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, LruCache<SourceKey, SourceState>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether forgetting this source would lose a penalty.
    fn is_evictable(&self, state: &SourceState, now: u64) -> bool {
        let window_ms = self.settings.window_ms;
        let cutoff = now.saturating_sub(window_ms);
        let throttled = [
            Counter::ConnectionAttempt,
            Counter::HandshakeFailure,
            Counter::ProtocolViolation,
            Counter::Store,
            Counter::Probe,
        ]
        .into_iter()
        .any(|c| state.window(c).iter().filter(|&&t| t > cutoff).count() >= self.limit(c));

        state.quarantined_until_ms <= now
            && !throttled
            && !state.is_live(Counter::HandshakeFailure, now, window_ms)
            && !state.is_live(Counter::ProtocolViolation, now, window_ms)
    }

    /// State for `key`, created when absent. `None` when the table is full
    /// and no tracked source may be evicted.
    fn tracked<'a>(
        &self,
        sources: &'a mut LruCache<SourceKey, SourceState>,
        key: SourceKey,
        now: u64,
    ) -> Option<&'a mut SourceState> {
        if !sources.contains(&key) && sources.len() >= sources.cap().get() {
            let idle = sources
                .iter()
                .rev()
                .find(|(_, state)| self.is_evictable(state, now))
                .map(|(k, _)| *k);
            match idle {
                Some(idle) => {
                    sources.pop(&idle);
                }
                None => return None,
            }
        }
        Some(sources.get_or_insert_mut(key, SourceState::default))
    }

    /// Ask to perform one unit of `counter` work for `key`.
    ///
    /// A blocked source is refused without the attempt being counted, so a
    /// flood cannot extend its own penalty window indefinitely; only
    /// violations do that.
    pub fn admit(&self, key: SourceKey, counter: Counter) -> Admission {
        let now = self.clock.now_ms();
        let mut sources = self.lock_sources();
        let Some(state) = self.tracked(&mut sources, key, now) else {
            debug!(source = %key, "source table saturated with penalized sources, refusing");
            return Admission::Throttled {
                retry_after_ms: self.settings.window_ms.max(1),
            };
        };
        state.prune(now, self.settings.window_ms);

        let status = self.blocked_status(state, counter, now);
        if !status.is_allowed() {
            return status;
        }
        self.push(state, key, counter, now);
        Admission::Allowed
    }

    /// Current status for `counter` work without counting anything.
    pub fn check(&self, key: SourceKey, counter: Counter) -> Admission {
        let now = self.clock.now_ms();
        let mut sources = self.lock_sources();
        match sources.get_mut(&key) {
            Some(state) => {
                state.prune(now, self.settings.window_ms);
                self.blocked_status(state, counter, now)
            }
            None => Admission::Allowed,
        }
    }

    pub fn is_quarantined(&self, key: SourceKey) -> bool {
        let now = self.clock.now_ms();
        self.lock_sources()
            .peek(&key)
            .is_some_and(|state| state.quarantined_until_ms > now)
    }

    /// Count one unit of `counter` unconditionally.
    pub fn record(&self, key: SourceKey, counter: Counter) {
        let now = self.clock.now_ms();
        let mut sources = self.lock_sources();
        let Some(state) = self.tracked(&mut sources, key, now) else {
            debug!(source = %key, ?counter, "source table saturated, not recorded");
            return;
        };
        state.prune(now, self.settings.window_ms);
        self.push(state, key, counter, now);
    }

    /// Count a violation against `source` (and `addr` when it is a
    /// distinct key) and publish it.
    pub fn record_violation(
        &self,
        violation: ViolationType,
        source: SourceKey,
        addr: Option<IpAddr>,
    ) -> ViolationRecord {
        let counter = violation.counter();
        self.record(source, counter);
        if let Some(ip) = addr
            && SourceKey::Addr(ip) != source
        {
            self.record(SourceKey::Addr(ip), counter);
        }

        let record = ViolationRecord {
            source,
            addr,
            violation,
            timestamp_ms: self.clock.now_ms(),
        };
        debug!(source = %source, violation = ?violation, "violation recorded");
        // No subscribers is fine.
        let _ = self.violations.send(record.clone());
        record
    }

    fn blocked_status(&self, state: &SourceState, counter: Counter, now: u64) -> Admission {
        if state.quarantined_until_ms > now {
            return Admission::Quarantined {
                until_ms: state.quarantined_until_ms,
            };
        }

        let full = |c: Counter| state.window(c).len() >= self.limit(c);
        let blocking = [Counter::HandshakeFailure, Counter::ProtocolViolation]
            .into_iter()
            .chain(std::iter::once(counter))
            .find(|&c| (c == counter || c.blocks_everything()) && full(c));

        match blocking {
            Some(c) => {
                let window = state.window(c);
                // The window frees a slot once its (len - limit + 1)-th oldest entry ages out.
                let idx = window.len().saturating_sub(self.limit(c));
                let freeing = window.get(idx).copied().unwrap_or(now);
                let retry_after_ms = (freeing + self.settings.window_ms).saturating_sub(now).max(1);
                Admission::Throttled { retry_after_ms }
            }
            None => Admission::Allowed,
        }
    }

    fn push(&self, state: &mut SourceState, key: SourceKey, counter: Counter, now: u64) {
        let limit = self.limit(counter);
        let window = &mut state.windows[counter.index()];
        let before = window.len();
        window.push_back(now);
        if window.len() > limit * WINDOW_CAPACITY_FACTOR {
            window.pop_front();
        }
        if before < limit && window.len() >= limit {
            self.register_offense(state, key, counter, now);
        }
    }

    fn register_offense(&self, state: &mut SourceState, key: SourceKey, counter: Counter, now: u64) {
        let decay_ms = self.settings.quarantine_max_ms.saturating_mul(2);
        if state.offenses > 0 && now.saturating_sub(state.last_offense_ms) > decay_ms {
            state.offenses = 0;
        }
        state.offenses += 1;
        state.last_offense_ms = now;

        let source = key.to_string();
        if state.offenses == 1 {
            events::emit(
                SecurityEvent::RateLimitTripped,
                &source,
                &format!("{counter:?} limit reached"),
            );
            return;
        }

        let shift = (state.offenses - 2).min(32);
        let duration = self
            .settings
            .quarantine_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.settings.quarantine_max_ms);
        state.quarantined_until_ms = now.saturating_add(duration);
        events::emit(
            SecurityEvent::Quarantined,
            &source,
            &format!(
                "{counter:?} limit reached again, offense {} quarantined for {duration}ms",
                state.offenses
            ),
        );
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::Ipv4Addr;

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            window_ms: 10_000,
            max_connection_attempts: 5,
            max_handshake_failures: 3,
            max_protocol_violations: 4,
            max_stores: 2,
            max_probes: 2,
            quarantine_base_ms: 1_000,
            quarantine_max_ms: 8_000,
            max_tracked_sources: 16,
        }
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RateLimiter::new(settings(), clock.clone()), clock)
    }

    fn addr(last: u8) -> SourceKey {
        SourceKey::Addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[test]
    fn connection_attempts_throttle_at_limit() {
        let (limiter, _) = limiter();
        let key = addr(1);
        for _ in 0..5 {
            assert!(limiter.admit(key, Counter::ConnectionAttempt).is_allowed());
        }
        assert!(matches!(
            limiter.admit(key, Counter::ConnectionAttempt),
            Admission::Throttled { .. }
        ));
        assert!(limiter.admit(addr(2), Counter::ConnectionAttempt).is_allowed());
    }

    #[test]
    fn window_expiry_is_the_only_reset() {
        let (limiter, clock) = limiter();
        let key = addr(1);
        for _ in 0..3 {
            limiter.record(key, Counter::HandshakeFailure);
        }
        assert!(!limiter.admit(key, Counter::ConnectionAttempt).is_allowed());

        // Time inside the window changes nothing.
        clock.advance(9_000);
        assert!(!limiter.admit(key, Counter::ConnectionAttempt).is_allowed());

        clock.advance(1_001);
        assert!(limiter.admit(key, Counter::ConnectionAttempt).is_allowed());
    }

    #[test]
    fn repeated_offense_quarantines_with_backoff() {
        let (limiter, clock) = limiter();
        let key = addr(7);

        for _ in 0..3 {
            limiter.record(key, Counter::HandshakeFailure);
        }
        assert!(matches!(
            limiter.check(key, Counter::ConnectionAttempt),
            Admission::Throttled { .. }
        ));

        clock.advance(10_001);
        for _ in 0..3 {
            limiter.record(key, Counter::HandshakeFailure);
        }
        let now = clock.now_ms();
        assert_eq!(
            limiter.check(key, Counter::ConnectionAttempt),
            Admission::Quarantined { until_ms: now + 1_000 }
        );
        assert!(limiter.is_quarantined(key));

        clock.advance(10_001);
        for _ in 0..3 {
            limiter.record(key, Counter::HandshakeFailure);
        }
        let now = clock.now_ms();
        assert_eq!(
            limiter.check(key, Counter::ConnectionAttempt),
            Admission::Quarantined { until_ms: now + 2_000 }
        );
    }

    #[test]
    fn quarantine_is_capped() {
        let (limiter, clock) = limiter();
        let key = addr(9);
        let mut last = 0;
        for _ in 0..8 {
            for _ in 0..3 {
                limiter.record(key, Counter::HandshakeFailure);
            }
            if let Admission::Quarantined { until_ms } = limiter.check(key, Counter::Store) {
                last = until_ms - clock.now_ms();
            }
            clock.advance(10_001);
        }
        assert_eq!(last, 8_000);
    }

    #[test]
    fn store_flood_does_not_block_connections() {
        let (limiter, _) = limiter();
        let key = addr(3);
        assert!(limiter.admit(key, Counter::Store).is_allowed());
        assert!(limiter.admit(key, Counter::Store).is_allowed());
        assert!(!limiter.admit(key, Counter::Store).is_allowed());
        assert!(limiter.admit(key, Counter::ConnectionAttempt).is_allowed());
    }

    #[tokio::test]
    async fn violations_are_broadcast_and_counted_per_key() {
        let (limiter, _) = limiter();
        let mut rx = limiter.subscribe();
        let peer = SourceKey::Peer(crate::identity::Keypair::generate().peer_id());
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

        let record = limiter.record_violation(ViolationType::PinViolation, peer, Some(ip));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, record);
        assert_eq!(received.violation, ViolationType::PinViolation);

        for _ in 0..2 {
            limiter.record_violation(ViolationType::SignatureInvalid, peer, Some(ip));
        }
        assert!(!limiter.admit(peer, Counter::ConnectionAttempt).is_allowed());
        assert!(!limiter.admit(SourceKey::Addr(ip), Counter::ConnectionAttempt).is_allowed());
    }

    #[test]
    fn offender_survives_a_flood_of_fresh_sources() {
        let (limiter, _) = limiter();
        let offender = addr(1);
        for _ in 0..3 {
            limiter.record(offender, Counter::HandshakeFailure);
        }
        assert!(matches!(
            limiter.check(offender, Counter::ConnectionAttempt),
            Admission::Throttled { .. }
        ));

        for _ in 0..16 {
            let fresh = SourceKey::Peer(crate::identity::Keypair::generate().peer_id());
            assert!(limiter.admit(fresh, Counter::ConnectionAttempt).is_allowed());
        }
        assert!(matches!(
            limiter.admit(offender, Counter::ConnectionAttempt),
            Admission::Throttled { .. }
        ));
    }

    #[test]
    fn saturated_table_refuses_newcomers_until_windows_drain() {
        let (limiter, clock) = limiter();
        for i in 0..16 {
            limiter.record_violation(ViolationType::MalformedMessage, addr(i), None);
        }
        let newcomer = addr(200);
        assert!(matches!(
            limiter.admit(newcomer, Counter::ConnectionAttempt),
            Admission::Throttled { .. }
        ));
        {
            let sources = limiter.lock_sources();
            for i in 0..16 {
                let state = sources.peek(&addr(i)).expect("penalized source evicted");
                assert_eq!(state.window(Counter::ProtocolViolation).len(), 1);
            }
        }

        clock.advance(10_001);
        assert!(limiter.admit(newcomer, Counter::ConnectionAttempt).is_allowed());
    }

    #[test]
    fn throttled_retry_after_points_at_window_drain() {
        let (limiter, clock) = limiter();
        let key = addr(4);
        limiter.admit(key, Counter::Probe);
        clock.advance(2_000);
        limiter.admit(key, Counter::Probe);
        assert_eq!(
            limiter.admit(key, Counter::Probe),
            Admission::Throttled { retry_after_ms: 8_000 }
        );
    }
}
