//! Session orchestration for the agent relay.
//!
//! Provides:
//! - `SessionRegistry` - Who is currently reachable
//! - `Dispatcher` - Route operator commands to one agent
//! - `Listener` - Accept agents and start their receive loops

pub mod dispatcher;
pub mod listener;
pub mod registry;

pub use dispatcher::{DispatchError, Dispatcher};
pub use listener::{AcceptError, BindError, Listener, serve};
pub use registry::{AgentSession, SessionInfo, SessionRegistry};
