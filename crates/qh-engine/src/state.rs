//! The commission state machine.
//!
//! `PENDING → ACCEPTED` or `PENDING → REJECTED`, both terminal. Resolving an
//! already-terminal commission is a no-op that reports the existing terminal
//! state — the caller may deliver accept/reject at-least-once.

use qh_schemas::CommissionState;

/// The two ways a pending commission can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accept,
    Reject,
}

impl Resolution {
    pub fn target_state(&self) -> CommissionState {
        match self {
            Self::Accept => CommissionState::Accepted,
            Self::Reject => CommissionState::Rejected,
        }
    }
}

/// Outcome of applying a resolution to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The commission was pending; the store must apply the transition
    /// (and, for Reject, reverse the provisions).
    Apply(CommissionState),
    /// The commission was already terminal; nothing must be re-applied.
    AlreadyTerminal(CommissionState),
}

impl Transition {
    /// The state the commission ends up in either way.
    pub fn final_state(&self) -> CommissionState {
        match self {
            Self::Apply(s) | Self::AlreadyTerminal(s) => *s,
        }
    }
}

/// Decide what resolving `current` with `resolution` means.
pub fn resolve(current: CommissionState, resolution: Resolution) -> Transition {
    if current.is_terminal() {
        Transition::AlreadyTerminal(current)
    } else {
        Transition::Apply(resolution.target_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_accept_applies() {
        assert_eq!(
            resolve(CommissionState::Pending, Resolution::Accept),
            Transition::Apply(CommissionState::Accepted)
        );
    }

    #[test]
    fn pending_reject_applies() {
        assert_eq!(
            resolve(CommissionState::Pending, Resolution::Reject),
            Transition::Apply(CommissionState::Rejected)
        );
    }

    #[test]
    fn terminal_states_are_sticky() {
        // Re-delivery of either verb on a terminal commission must not
        // re-apply anything, whichever verb arrives.
        for terminal in [CommissionState::Accepted, CommissionState::Rejected] {
            for r in [Resolution::Accept, Resolution::Reject] {
                assert_eq!(resolve(terminal, r), Transition::AlreadyTerminal(terminal));
            }
        }
    }

    #[test]
    fn double_resolution_is_idempotent() {
        let first = resolve(CommissionState::Pending, Resolution::Accept);
        let second = resolve(first.final_state(), Resolution::Accept);
        assert_eq!(first.final_state(), second.final_state());
        assert!(matches!(second, Transition::AlreadyTerminal(_)));
    }
}
