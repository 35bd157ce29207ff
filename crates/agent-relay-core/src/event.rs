//! Commands flowing to agents and events flowing back.

use std::fmt;

use bytes::Bytes;

use crate::{AgentIdentity, SessionId, now_millis};

/// Operator command addressed to one agent.
///
/// Consumed by value on dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Agent that should receive the payload.
    pub target: AgentIdentity,
    /// Opaque command bytes.
    pub payload: Bytes,
    /// Issue timestamp (Unix epoch milliseconds).
    pub issued_at: i64,
}

impl CommandRequest {
    /// Create a command stamped with the current time.
    #[must_use]
    pub fn new(target: AgentIdentity, payload: impl Into<Bytes>) -> Self {
        Self {
            target,
            payload: payload.into(),
            issued_at: now_millis(),
        }
    }
}

/// One message received from an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Agent that sent the message.
    pub source: AgentIdentity,
    /// Decoded frame payload.
    pub payload: Bytes,
    /// Receive timestamp (Unix epoch milliseconds).
    pub received_at: i64,
}

impl InboundEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(source: AgentIdentity, payload: Bytes) -> Self {
        Self {
            source,
            payload,
            received_at: now_millis(),
        }
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed its end of the stream.
    PeerClosed,
    /// Closed locally (operator removal, replacement or shutdown).
    Closed,
    /// A write to the agent failed.
    SendFailed(String),
    /// Malformed frame; the stream cannot be resynchronised.
    Protocol(String),
    /// Read error on the socket.
    Io(String),
    /// Nothing received within the idle deadline.
    IdleTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed connection"),
            Self::Closed => f.write_str("closed locally"),
            Self::SendFailed(e) => write!(f, "send failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

/// Event delivered to operator front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// An agent was accepted and registered.
    Connected {
        identity: AgentIdentity,
        session: SessionId,
    },
    /// An agent sent a message.
    Inbound(InboundEvent),
    /// An agent's connection was torn down.
    Disconnected {
        identity: AgentIdentity,
        session: SessionId,
        reason: DisconnectReason,
    },
}

impl RelayEvent {
    /// Agent this event concerns.
    #[must_use]
    pub const fn identity(&self) -> AgentIdentity {
        match self {
            Self::Connected { identity, .. } | Self::Disconnected { identity, .. } => *identity,
            Self::Inbound(event) => event.source,
        }
    }

    /// Approximate in-memory size, used to bound event history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 64;
        match self {
            Self::Inbound(event) => OVERHEAD + event.payload.len(),
            Self::Connected { .. } | Self::Disconnected { .. } => OVERHEAD,
        }
    }
}
