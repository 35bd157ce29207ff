//! Registry of reachable agents.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use agent_relay_core::{AgentIdentity, DisconnectObserver, SessionId, SessionState};
use agent_relay_transport::AgentConnection;
use serde::{Deserialize, Serialize};

/// Registry entry for one agent connection.
///
/// Cheap to clone. A handle obtained from the registry may go stale as soon
/// as it is returned; check [`AgentSession::state`] before relying on it.
#[derive(Debug, Clone)]
pub struct AgentSession {
    connection: Arc<AgentConnection>,
    seq: u64,
}

impl AgentSession {
    /// Registry key.
    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        self.connection.identity()
    }

    /// Session identifier, unique per accepted connection.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.connection.session_id()
    }

    /// Live lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    /// Accept timestamp (Unix epoch milliseconds).
    #[must_use]
    pub fn connected_at(&self) -> i64 {
        self.connection.tracker().connected_at()
    }

    /// Last send or receive (Unix epoch milliseconds).
    #[must_use]
    pub fn last_activity(&self) -> i64 {
        self.connection.tracker().last_activity()
    }

    /// Serializable snapshot of this session.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            identity: self.identity(),
            session: self.session_id(),
            state: self.state(),
            connected_at: self.connected_at(),
            last_activity: self.last_activity(),
        }
    }

    pub(crate) const fn connection(&self) -> &Arc<AgentConnection> {
        &self.connection
    }
}

/// Point-in-time view of a session for front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub identity: AgentIdentity,
    pub session: SessionId,
    pub state: SessionState,
    pub connected_at: i64,
    pub last_activity: i64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<AgentIdentity, AgentSession>,
    next_seq: u64,
}

/// Thread-safe map from agent identity to its live session.
///
/// Mutations are serialized under one registry-wide write lock; lookups and
/// listings share a read lock and see a consistent snapshot.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `connection` and mark it active.
    ///
    /// A session already registered under the same identity is superseded:
    /// its connection is closed and its entry replaced. A connection that
    /// was closed before registration is returned but not inserted.
    pub fn register(&self, connection: Arc<AgentConnection>) -> AgentSession {
        let identity = connection.identity();

        let (session, prior) = {
            let mut inner = self.write();
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let session = AgentSession { connection, seq };
            if !session.connection.tracker().activate() && session.connection.is_closed() {
                return session;
            }
            let prior = inner.sessions.insert(identity, session.clone());
            (session, prior)
        };

        match prior {
            Some(prior) if prior.session_id() != session.session_id() => {
                tracing::warn!(
                    %identity,
                    old = %prior.session_id(),
                    new = %session.session_id(),
                    "identity reused, superseding prior session"
                );
                prior.connection.close();
            }
            _ => tracing::info!(%identity, session = %session.session_id(), "agent registered"),
        }

        session
    }

    /// Remove and close whatever session is registered under `identity`.
    ///
    /// Removing an unknown identity is a no-op.
    pub fn remove(&self, identity: AgentIdentity) -> Option<AgentSession> {
        let removed = self.write().sessions.remove(&identity);
        if let Some(session) = &removed {
            session.connection.close();
            tracing::info!(%identity, session = %session.session_id(), "agent removed");
        }
        removed
    }

    /// Remove `identity` only if it still maps to `session`.
    ///
    /// Returns true if an entry was removed.
    pub fn remove_session(&self, identity: AgentIdentity, session: SessionId) -> bool {
        let removed = {
            let mut inner = self.write();
            match inner.sessions.get(&identity) {
                Some(current) if current.session_id() == session => inner.sessions.remove(&identity),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.connection.close();
                tracing::debug!(%identity, %session, "session removed");
                true
            }
            None => false,
        }
    }

    /// Look up the session registered under `identity`.
    #[must_use]
    pub fn lookup(&self, identity: AgentIdentity) -> Option<AgentSession> {
        self.read().sessions.get(&identity).cloned()
    }

    /// Active sessions in connection order.
    #[must_use]
    pub fn list_active(&self) -> Vec<AgentSession> {
        let mut sessions: Vec<AgentSession> = self
            .read()
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
    }

    /// Serializable view of [`Self::list_active`].
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.list_active().iter().map(AgentSession::info).collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    /// Remove and close every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<AgentSession> = self.write().sessions.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.connection.close();
        }
        drained.len()
    }
}

impl DisconnectObserver for SessionRegistry {
    fn on_disconnect(&self, identity: AgentIdentity, session: SessionId) {
        self.remove_session(identity, session);
    }
}
