//! Seams between the transport and session layers.

use crate::{AgentIdentity, SessionId};

/// Receives teardown notifications from connection receive loops.
///
/// Implemented by the session registry. Called once per connection, after
/// its socket has been shut down.
pub trait DisconnectObserver: Send + Sync {
    /// The connection for `session` under `identity` has ended.
    fn on_disconnect(&self, identity: AgentIdentity, session: SessionId);
}
