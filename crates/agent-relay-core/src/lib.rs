//! Core types for the agent relay control plane.
//!
//! This crate provides the building blocks shared by the transport and
//! session layers:
//! - `AgentIdentity` - Registry key derived from the remote endpoint
//! - `SessionState` / `SessionTracker` - Lifecycle state shared between a
//!   connection and its registry entry
//! - `RelayEvent` - Typed events delivered to operator front-ends
//! - `EventHub` - Broadcast + history for late subscribers
//! - `RelayConfig` - Tunables for framing, deadlines and fan-out
//! - `DisconnectObserver` - Hook a connection uses to report its teardown

pub mod config;
pub mod event;
pub mod event_hub;
pub mod identity;
pub mod session;
pub mod traits;

pub use config::RelayConfig;
pub use event::{CommandRequest, DisconnectReason, InboundEvent, RelayEvent};
pub use event_hub::EventHub;
pub use identity::{AgentIdentity, ParseIdentityError, SessionId};
pub use session::{SessionState, SessionTracker, now_millis};
pub use traits::DisconnectObserver;
