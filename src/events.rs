//! # Security Event Identifiers
//!
//! Every security-relevant condition is logged with a stable numeric
//! `event_id` field so external monitoring can filter on it without
//! matching log text. Identifiers are part of the public contract: never
//! renumber an existing variant, only append.
//!
//! | Range | Meaning |
//! |-------|---------|
//! | 1000-1999 | authentication, freshness and abuse events |
//! | 2000-2999 | certificate lifecycle observations |

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityEvent {
    SignatureInvalid,
    IdentityMismatch,
    PinViolation,
    SequenceRollback,
    RateLimitTripped,
    DescriptorExpired,
    MalformedMessage,
    HandshakeTimeout,
    PinStoreTampered,
    SequenceStoreTampered,
    Quarantined,
    HandshakeFailure,
    CertExpiryWarning,
    CertExpiryCritical,
    CertExpired,
}

impl SecurityEvent {
    pub const fn id(self) -> u32 {
        match self {
            SecurityEvent::SignatureInvalid => 1001,
            SecurityEvent::IdentityMismatch => 1002,
            SecurityEvent::PinViolation => 1003,
            SecurityEvent::SequenceRollback => 1004,
            SecurityEvent::RateLimitTripped => 1005,
            SecurityEvent::DescriptorExpired => 1006,
            SecurityEvent::MalformedMessage => 1007,
            SecurityEvent::HandshakeTimeout => 1008,
            SecurityEvent::PinStoreTampered => 1009,
            SecurityEvent::SequenceStoreTampered => 1010,
            SecurityEvent::Quarantined => 1011,
            SecurityEvent::HandshakeFailure => 1012,
            SecurityEvent::CertExpiryWarning => 2001,
            SecurityEvent::CertExpiryCritical => 2002,
            SecurityEvent::CertExpired => 2003,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SecurityEvent::SignatureInvalid => "signature_invalid",
            SecurityEvent::IdentityMismatch => "identity_mismatch",
            SecurityEvent::PinViolation => "pin_violation",
            SecurityEvent::SequenceRollback => "sequence_rollback",
            SecurityEvent::RateLimitTripped => "rate_limit_tripped",
            SecurityEvent::DescriptorExpired => "descriptor_expired",
            SecurityEvent::MalformedMessage => "malformed_message",
            SecurityEvent::HandshakeTimeout => "handshake_timeout",
            SecurityEvent::PinStoreTampered => "pin_store_tampered",
            SecurityEvent::SequenceStoreTampered => "sequence_store_tampered",
            SecurityEvent::Quarantined => "quarantined",
            SecurityEvent::HandshakeFailure => "handshake_failure",
            SecurityEvent::CertExpiryWarning => "cert_expiry_warning",
            SecurityEvent::CertExpiryCritical => "cert_expiry_critical",
            SecurityEvent::CertExpired => "cert_expired",
        }
    }

    const fn is_critical(self) -> bool {
        matches!(
            self,
            SecurityEvent::PinStoreTampered
                | SecurityEvent::SequenceStoreTampered
                | SecurityEvent::CertExpiryCritical
                | SecurityEvent::CertExpired
        )
    }
}

impl std::fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}

/// Emit a structured log line for a security event.
///
/// `source` names the offending peer or address (or the local artifact for
/// store and certificate events).
pub(crate) fn emit(event: SecurityEvent, source: &str, detail: &str) {
    if event.is_critical() {
        error!(
            event_id = event.id(),
            event = event.name(),
            source = source,
            detail = detail,
            "security event"
        );
    } else {
        warn!(
            event_id = event.id(),
            event = event.name(),
            source = source,
            detail = detail,
            "security event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [SecurityEvent; 15] = [
        SecurityEvent::SignatureInvalid,
        SecurityEvent::IdentityMismatch,
        SecurityEvent::PinViolation,
        SecurityEvent::SequenceRollback,
        SecurityEvent::RateLimitTripped,
        SecurityEvent::DescriptorExpired,
        SecurityEvent::MalformedMessage,
        SecurityEvent::HandshakeTimeout,
        SecurityEvent::PinStoreTampered,
        SecurityEvent::SequenceStoreTampered,
        SecurityEvent::Quarantined,
        SecurityEvent::HandshakeFailure,
        SecurityEvent::CertExpiryWarning,
        SecurityEvent::CertExpiryCritical,
        SecurityEvent::CertExpired,
    ];

    #[test]
    fn event_ids_are_distinct() {
        let ids: HashSet<u32> = ALL.iter().map(|e| e.id()).collect();
        assert_eq!(ids.len(), ALL.len(), "every event needs its own identifier");
        let names: HashSet<&str> = ALL.iter().map(|e| e.name()).collect();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn event_ids_are_stable() {
        assert_eq!(SecurityEvent::SignatureInvalid.id(), 1001);
        assert_eq!(SecurityEvent::IdentityMismatch.id(), 1002);
        assert_eq!(SecurityEvent::PinViolation.id(), 1003);
        assert_eq!(SecurityEvent::SequenceRollback.id(), 1004);
        assert_eq!(SecurityEvent::RateLimitTripped.id(), 1005);
        assert_eq!(SecurityEvent::CertExpired.id(), 2003);
    }

    #[test]
    fn display_includes_id() {
        assert_eq!(SecurityEvent::PinViolation.to_string(), "pin_violation(1003)");
    }
}
