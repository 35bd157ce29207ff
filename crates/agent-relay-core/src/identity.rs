//! Agent identities.

use std::{fmt, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Per-connection session identifier.
///
/// Distinguishes two sessions that were accepted from the same
/// address:port tuple.
pub type SessionId = Uuid;

/// Registry key for a connected agent.
///
/// Derived from the remote endpoint at accept time and never changed
/// afterwards. Renders and parses as `ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIdentity(SocketAddr);

impl AgentIdentity {
    /// Identity of the peer at `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Remote endpoint this identity was derived from.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for AgentIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity parse error.
#[derive(Debug, Error)]
#[error("Invalid agent identity {input:?}: expected ip:port")]
pub struct ParseIdentityError {
    input: String,
}

impl FromStr for AgentIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| ParseIdentityError {
                input: s.to_string(),
            })
    }
}
