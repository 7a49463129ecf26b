use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a recommendation.
///
/// Stored as an integer in `recommendations.unlock_state`. The set is closed:
/// every state the engine can observe is listed here, and the transition table
/// in [`UnlockState::can_transition_to`] is exhaustive over it.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockState {
    Locked = 0,
    Active = 1,
    InProgress = 2,
    Completed = 3,
    Verified = 4,
    Skipped = 5,
}

impl UnlockState {
    pub const ALL: [UnlockState; 6] = [
        UnlockState::Locked,
        UnlockState::Active,
        UnlockState::InProgress,
        UnlockState::Completed,
        UnlockState::Verified,
        UnlockState::Skipped,
    ];

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    /// Returns None for values this build does not know about. Callers reading
    /// rows treat that as a column type error rather than guessing a state.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(UnlockState::Locked),
            1 => Some(UnlockState::Active),
            2 => Some(UnlockState::InProgress),
            3 => Some(UnlockState::Completed),
            4 => Some(UnlockState::Verified),
            5 => Some(UnlockState::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockState::Locked => "locked",
            UnlockState::Active => "active",
            UnlockState::InProgress => "in_progress",
            UnlockState::Completed => "completed",
            UnlockState::Verified => "verified",
            UnlockState::Skipped => "skipped",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "locked" => Some(UnlockState::Locked),
            "active" => Some(UnlockState::Active),
            "in_progress" | "in-progress" | "inprogress" => Some(UnlockState::InProgress),
            "completed" => Some(UnlockState::Completed),
            "verified" => Some(UnlockState::Verified),
            "skipped" => Some(UnlockState::Skipped),
            _ => None,
        }
    }

    /// Nothing leaves `skipped`
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnlockState::Skipped)
    }

    /// Unlocked and still waiting on the user
    pub fn is_open(&self) -> bool {
        matches!(self, UnlockState::Active | UnlockState::InProgress)
    }

    /// Counted as done for progress and batch gating
    pub fn is_done(&self) -> bool {
        matches!(self, UnlockState::Completed | UnlockState::Verified)
    }

    pub fn can_transition_to(&self, to: UnlockState) -> bool {
        use UnlockState::*;

        match (*self, to) {
            (Skipped, _) => false,
            (_, Skipped) => true,
            (Locked, Active) => true,
            (Active, InProgress) | (Active, Completed) => true,
            (InProgress, Completed) => true,
            (Completed, Verified) | (Completed, InProgress) => true,
            (Verified, InProgress) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UnlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
