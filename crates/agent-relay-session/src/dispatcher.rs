//! Routing operator commands to agents.

use std::sync::Arc;

use agent_relay_core::{AgentIdentity, CommandRequest, SessionState};
use agent_relay_transport::SendError;
use bytes::Bytes;
use futures::future::join_all;

use crate::SessionRegistry;

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown agent: {0}")]
    UnknownTarget(AgentIdentity),
    #[error("Agent {identity} is not active ({state:?})")]
    TargetDisconnected {
        identity: AgentIdentity,
        state: SessionState,
    },
    #[error("Command of {len} bytes exceeds frame limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Delivery to {identity} failed: {source}")]
    DeliveryFailed {
        identity: AgentIdentity,
        #[source]
        source: SendError,
    },
}

/// Resolves command targets through the registry and forwards payloads.
///
/// Does not retry; failures are reported to the caller.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `request.payload` to `request.target`.
    ///
    /// # Errors
    /// - `UnknownTarget` if nothing is registered under the identity
    /// - `TargetDisconnected` if the session is no longer active
    /// - `PayloadTooLarge` if the payload cannot be framed
    /// - `DeliveryFailed` if the write failed; the target is dropped from the
    ///   registry since its connection is known dead
    pub async fn dispatch(&self, request: CommandRequest) -> Result<(), DispatchError> {
        let CommandRequest {
            target, payload, ..
        } = request;

        let session = self
            .registry
            .lookup(target)
            .ok_or(DispatchError::UnknownTarget(target))?;

        let state = session.state();
        if state != SessionState::Active {
            return Err(DispatchError::TargetDisconnected {
                identity: target,
                state,
            });
        }

        match session.connection().send(payload).await {
            Ok(()) => {
                tracing::debug!(identity = %target, "command delivered");
                Ok(())
            }
            Err(SendError::PayloadTooLarge { len, max }) => {
                Err(DispatchError::PayloadTooLarge { len, max })
            }
            Err(source) => {
                tracing::warn!(identity = %target, "command delivery failed: {source}");
                self.registry.remove_session(target, session.session_id());
                Err(DispatchError::DeliveryFailed {
                    identity: target,
                    source,
                })
            }
        }
    }

    /// Send the same payload to every active agent.
    ///
    /// Targets are written concurrently, so a stalled agent delays only its
    /// own result. Results are reported in connection order.
    pub async fn broadcast(
        &self,
        payload: impl Into<Bytes>,
    ) -> Vec<(AgentIdentity, Result<(), DispatchError>)> {
        let payload = payload.into();
        let sends = self.registry.list_active().into_iter().map(|session| {
            let identity = session.identity();
            let request = CommandRequest::new(identity, payload.clone());
            async move { (identity, self.dispatch(request).await) }
        });
        join_all(sends).await
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use agent_relay_core::RelayConfig;
    use agent_relay_transport::AgentConnection;

    use super::*;

    fn identity(port: u16) -> AgentIdentity {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn dispatcher() -> (Arc<SessionRegistry>, Dispatcher) {
        let registry = Arc::new(SessionRegistry::new());
        (Arc::clone(&registry), Dispatcher::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (_registry, dispatcher) = dispatcher();
        let err = dispatcher
            .dispatch(CommandRequest::new(identity(1), "dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTarget(id) if id == identity(1)));
    }

    #[tokio::test]
    async fn test_delivers_framed_payload() {
        let (registry, dispatcher) = dispatcher();
        let writer = tokio_test::io::Builder::new()
            .write(b"\x00\x00\x00\x03dir")
            .build();
        let reader = tokio_test::io::Builder::new().build();
        let (conn, _reader) =
            AgentConnection::new(identity(2), reader, writer, &RelayConfig::default());
        registry.register(conn);

        dispatcher
            .dispatch(CommandRequest::new(identity(2), "dir"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_socket_reports_and_evicts() {
        let (registry, dispatcher) = dispatcher();
        let writer = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let reader = tokio_test::io::Builder::new().build();
        let (conn, _reader) =
            AgentConnection::new(identity(3), reader, writer, &RelayConfig::default());
        registry.register(conn);

        let err = dispatcher
            .dispatch(CommandRequest::new(identity(3), "dir"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DeliveryFailed {
                source: SendError::Io(_),
                ..
            }
        ));
        assert!(registry.list_active().is_empty());
        assert!(registry.lookup(identity(3)).is_none());
    }

    #[tokio::test]
    async fn test_inactive_target() {
        let (registry, dispatcher) = dispatcher();
        let writer = tokio_test::io::Builder::new().build();
        let reader = tokio_test::io::Builder::new().build();
        let (conn, _reader) =
            AgentConnection::new(identity(4), reader, writer, &RelayConfig::default());
        let session = registry.register(Arc::clone(&conn));

        // Connection died but its teardown has not reached the registry yet.
        conn.tracker().mark_disconnected();
        assert_eq!(session.state(), SessionState::Disconnected);

        let err = dispatcher
            .dispatch(CommandRequest::new(identity(4), "dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TargetDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_oversized_command_keeps_session() {
        let (registry, dispatcher) = dispatcher();
        let config = RelayConfig {
            max_frame_len: 2,
            ..RelayConfig::default()
        };
        let writer = tokio_test::io::Builder::new().build();
        let reader = tokio_test::io::Builder::new().build();
        let (conn, _reader) = AgentConnection::new(identity(5), reader, writer, &config);
        registry.register(conn);

        let err = dispatcher
            .dispatch(CommandRequest::new(identity(5), "dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PayloadTooLarge { len: 3, max: 2 }));
        assert_eq!(registry.list_active().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reports_each_target() {
        let (registry, dispatcher) = dispatcher();

        let ok_writer = tokio_test::io::Builder::new()
            .write(b"\x00\x00\x00\x06uptime")
            .build();
        let (ok, _r1) = AgentConnection::new(
            identity(6),
            tokio_test::io::Builder::new().build(),
            ok_writer,
            &RelayConfig::default(),
        );
        let bad_writer = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let (bad, _r2) = AgentConnection::new(
            identity(7),
            tokio_test::io::Builder::new().build(),
            bad_writer,
            &RelayConfig::default(),
        );
        registry.register(ok);
        registry.register(bad);

        let results = dispatcher.broadcast("uptime").await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, identity(6));
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(DispatchError::DeliveryFailed { .. })));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_does_not_wait_on_stalled_agent() {
        let (registry, dispatcher) = dispatcher();
        let config = RelayConfig {
            write_timeout: Duration::from_millis(200),
            ..RelayConfig::default()
        };

        // Connected first, so it comes first in connection order.
        let (stalled_peer, stalled_side) = tokio::io::duplex(16);
        let (r, w) = tokio::io::split(stalled_side);
        let (stalled, _r1) = AgentConnection::new(identity(8), r, w, &config);
        registry.register(stalled);

        let (mut healthy_peer, healthy_side) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(healthy_side);
        let (healthy, _r2) = AgentConnection::new(identity(9), r, w, &config);
        registry.register(healthy);

        let command = vec![b'x'; 4096];
        let broadcast = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.broadcast(command).await }
        });

        // The healthy agent gets its frame while the stalled write is pending.
        let mut header = [0u8; 4];
        tokio::time::timeout(
            Duration::from_millis(150),
            tokio::io::AsyncReadExt::read_exact(&mut healthy_peer, &mut header),
        )
        .await
        .expect("healthy agent should not wait for the stalled one")
        .unwrap();
        assert_eq!(u32::from_be_bytes(header), 4096);

        let results = broadcast.await.unwrap();
        assert_eq!(results[0].0, identity(8));
        assert!(matches!(
            results[0].1,
            Err(DispatchError::DeliveryFailed {
                source: SendError::TimedOut(_),
                ..
            })
        ));
        assert_eq!(results[1].0, identity(9));
        assert!(results[1].1.is_ok());
        assert_eq!(registry.len(), 1);
        drop(stalled_peer);
    }
}
