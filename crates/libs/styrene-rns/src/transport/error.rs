//! Typed outcomes for the inbound/outbound dispatchers, so tests can assert
//! on *why* a packet was dropped rather than grepping a log line.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Malformed header, IFAC mismatch, or a proof that arrived on the wrong interface.
    Invalid,
    /// The packet hash was already present in the current or previous hashlist generation.
    Duplicate,
    /// `hops > 1` on a PLAIN/GROUP destination.
    Loop,
    /// Access-point announce policy, rate limiting, or ingress limiting.
    Policy,
    /// Admitted but parked for later processing (held announce, discovery path request).
    Deferred,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Invalid => "dropped: invalid",
            Self::Duplicate => "dropped: duplicate",
            Self::Loop => "dropped: loop",
            Self::Policy => "dropped: policy",
            Self::Deferred => "deferred",
        };
        write!(f, "{msg}")
    }
}

/// Result of running a single packet through the inbound or outbound dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Delivered to a local destination or application callback.
    DeliveredLocal,
    /// Forwarded to one or more interfaces as transit traffic.
    Forwarded,
    /// Admitted into a table without an immediate send (e.g. announce admission only).
    Admitted,
    /// Not processed further; carries the reason.
    Dropped(DropReason),
}

impl PacketOutcome {
    pub fn is_dropped(self) -> bool {
        matches!(self, Self::Dropped(_))
    }

    pub fn reason(self) -> Option<DropReason> {
        match self {
            Self::Dropped(reason) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DropReason, PacketOutcome};

    #[test]
    fn dropped_outcome_exposes_reason() {
        let outcome = PacketOutcome::Dropped(DropReason::Duplicate);
        assert!(outcome.is_dropped());
        assert_eq!(outcome.reason(), Some(DropReason::Duplicate));
    }
}
