//! Session lifecycle state.

use std::{
    sync::atomic::{AtomicI64, AtomicU8, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Session state.
///
/// Transitions only move forward: `Connecting -> Active -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Socket accepted, not yet registered.
    Connecting,
    /// Registered and reachable.
    Active,
    /// Torn down. Terminal.
    Disconnected,
}

impl SessionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Active => 1,
            Self::Disconnected => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Disconnected,
        }
    }
}

/// Lock-free state and activity clock for one session.
///
/// Shared between the registry entry and the connection that owns the
/// socket. The connection uses it for status updates only.
#[derive(Debug)]
pub struct SessionTracker {
    state: AtomicU8,
    connected_at: i64,
    last_activity: AtomicI64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    /// Create a tracker in the `Connecting` state.
    #[must_use]
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            state: AtomicU8::new(SessionState::Connecting.as_u8()),
            connected_at: now,
            last_activity: AtomicI64::new(now),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the session is `Active`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move `Connecting -> Active`.
    ///
    /// Returns false if the session was already active or disconnected.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting.as_u8(),
                SessionState::Active.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Disconnected`.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn mark_disconnected(&self) -> bool {
        self.state
            .swap(SessionState::Disconnected.as_u8(), Ordering::AcqRel)
            != SessionState::Disconnected.as_u8()
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity.fetch_max(now_millis(), Ordering::AcqRel);
    }

    /// Accept timestamp (Unix epoch milliseconds).
    #[must_use]
    pub const fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Last send or receive (Unix epoch milliseconds).
    #[must_use]
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }
}
