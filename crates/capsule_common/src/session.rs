//! Staged-session states and the IPC view of a session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::image::CapsuleImage;

/// Lifecycle of a staged install session.
///
/// Happy path: `Verified -> Staged -> Ready -> Activated -> Success`.
/// `Activated` sessions that the boot did not confirm end in `Reverted`;
/// any pre-terminal session can end in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Verified,
    Staged,
    Ready,
    Activated,
    Success,
    Reverted,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Success | SessionState::Reverted | SessionState::Aborted
        )
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Verified, Staged) => true,
            (Staged, Ready) => true,
            (Ready, Activated) => true,
            (Activated, Success) => true,
            (Activated, Reverted) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Position along the happy path, used to take the minimum over a
    /// parent session's children. Terminal failure states rank lowest so
    /// a failed child pins its parent.
    pub fn rank(self) -> u8 {
        match self {
            SessionState::Aborted | SessionState::Reverted => 0,
            SessionState::Verified => 1,
            SessionState::Staged => 2,
            SessionState::Ready => 3,
            SessionState::Activated => 4,
            SessionState::Success => 5,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Verified => "verified",
            SessionState::Staged => "staged",
            SessionState::Ready => "ready",
            SessionState::Activated => "activated",
            SessionState::Success => "success",
            SessionState::Reverted => "reverted",
            SessionState::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Session as reported over IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub state: SessionState,
    pub child_ids: Vec<u64>,
    pub is_rollback: bool,
    pub rollback_of: Option<u64>,
    pub images: Vec<CapsuleImage>,
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Verified.can_transition_to(Staged));
        assert!(Staged.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Activated));
        assert!(Activated.can_transition_to(Success));
    }

    #[test]
    fn failure_transitions() {
        assert!(Activated.can_transition_to(Reverted));
        assert!(Verified.can_transition_to(Aborted));
        assert!(Ready.can_transition_to(Aborted));
        assert!(Activated.can_transition_to(Aborted));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Success, Reverted, Aborted] {
            for next in [Verified, Staged, Ready, Activated, Success, Reverted, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn no_skipping_states() {
        assert!(!Verified.can_transition_to(Ready));
        assert!(!Staged.can_transition_to(Activated));
        assert!(!Ready.can_transition_to(Success));
    }

    #[test]
    fn rank_orders_the_happy_path_and_pins_failures() {
        // A parent's effective state is the minimum rank among its
        // children, so a failed child must rank below everything else.
        assert!(Verified.rank() < Staged.rank());
        assert!(Staged.rank() < Ready.rank());
        assert!(Ready.rank() < Activated.rank());
        assert!(Activated.rank() < Success.rank());
        assert!(Aborted.rank() < Verified.rank());
        assert_eq!(
            [Activated, Ready, Activated].iter().map(|s| s.rank()).min(),
            Some(Ready.rank())
        );
    }
}
