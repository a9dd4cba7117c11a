//! # Session Lifecycle State
//!
//! `Created → Active → Ending → Completed`. Transitions only move forward;
//! re-entering the current state is a no-op so duplicate end requests (explicit
//! end followed by a disconnect) are harmless.

use crate::error::{EvalResult, EvaluationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, not yet joined to its broadcast group
    Created,
    /// Receiving audio and slides
    Active,
    /// No new batches; queued work is draining
    Ending,
    /// Final report built, session released
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Completed => "completed",
        }
    }

    pub fn accepts_audio(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Active)
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(true)` when the state changed, `Ok(false)` when already there,
    /// and `InvalidTransition` for any backwards move.
    pub fn advance(&mut self, next: SessionState) -> EvalResult<bool> {
        if next < *self {
            return Err(EvaluationError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if next == *self {
            return Ok(false);
        }
        *self = next;
        Ok(true)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut state = SessionState::Created;
        assert!(state.advance(SessionState::Active).unwrap());
        assert!(state.advance(SessionState::Ending).unwrap());
        assert!(!state.advance(SessionState::Ending).unwrap());
        assert!(state.advance(SessionState::Completed).unwrap());
        assert_eq!(state, SessionState::Completed);
    }

    #[test]
    fn test_skipping_forward_is_allowed() {
        let mut state = SessionState::Created;
        assert!(state.advance(SessionState::Ending).unwrap());
    }

    #[test]
    fn test_backwards_transition_is_rejected() {
        let mut state = SessionState::Ending;
        let err = state.advance(SessionState::Active).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(state, SessionState::Ending);
    }

    #[test]
    fn test_audio_acceptance() {
        assert!(SessionState::Created.accepts_audio());
        assert!(SessionState::Active.accepts_audio());
        assert!(!SessionState::Ending.accepts_audio());
        assert!(!SessionState::Completed.accepts_audio());
    }
}
