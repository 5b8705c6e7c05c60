//! Session lifecycle phases.
//!
//! Both ends of a session stream track the same forward-only phase machine:
//!
//! ```text
//!   Opening ──> Active ──> Closing ──> Closed
//! ```
//!
//! `Opening` ends when `Connect` pins the kind. `Closing` covers the
//! disconnect exchange. Transitions are explicit and validated; an illegal
//! jump is a programming error surfaced as a `Result` so callers can log
//! the exact violation.

use std::fmt;

/// Phase of one session conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Stream open, no `Connect` seen yet. Only `Connect` is valid.
    Opening,
    /// Kind pinned; observe/create/update/delete loop.
    Active,
    /// Disconnect exchange in flight.
    Closing,
    /// Conversation over; every further operation fails.
    Closed,
}

/// An attempted transition that skips or reverses the phase order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal session phase transition from {from} to {to}")]
pub struct PhaseError {
    /// Phase the session was in.
    pub from: SessionPhase,
    /// Phase the caller attempted to reach.
    pub to: SessionPhase,
}

impl SessionPhase {
    /// Advances `Opening → Active` when `Connect` succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] unless the current phase is `Opening`.
    pub fn activate(self) -> Result<Self, PhaseError> {
        match self {
            Self::Opening => Ok(Self::Active),
            _ => Err(PhaseError {
                from: self,
                to: Self::Active,
            }),
        }
    }

    /// Advances `Active → Closing` when disconnect starts.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] unless the current phase is `Active`.
    pub fn begin_close(self) -> Result<Self, PhaseError> {
        match self {
            Self::Active => Ok(Self::Closing),
            _ => Err(PhaseError {
                from: self,
                to: Self::Closing,
            }),
        }
    }

    /// Terminal transition; valid from every phase.
    #[must_use]
    pub fn close(self) -> Self {
        Self::Closed
    }

    /// Whether CRUD operations may be dispatched in this phase.
    #[must_use]
    pub const fn allows_operations(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "Opening",
            Self::Active => "Active",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_progression() {
        let phase = SessionPhase::Opening;
        let phase = phase.activate().unwrap();
        assert!(phase.allows_operations());
        let phase = phase.begin_close().unwrap();
        assert!(!phase.allows_operations());
        assert_eq!(phase.close(), SessionPhase::Closed);
    }

    #[test]
    fn skipping_opening_is_rejected() {
        let err = SessionPhase::Opening.begin_close().unwrap_err();
        assert_eq!(err.from, SessionPhase::Opening);
        assert_eq!(err.to, SessionPhase::Closing);
    }

    #[test]
    fn reactivating_a_closed_session_is_rejected() {
        assert!(SessionPhase::Closed.activate().is_err());
        assert!(SessionPhase::Closing.activate().is_err());
    }

    #[test]
    fn close_is_valid_from_any_phase() {
        assert_eq!(SessionPhase::Opening.close(), SessionPhase::Closed);
        assert_eq!(SessionPhase::Active.close(), SessionPhase::Closed);
        assert_eq!(SessionPhase::Closed.close(), SessionPhase::Closed);
    }
}
