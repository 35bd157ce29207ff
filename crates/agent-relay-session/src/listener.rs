//! Accept loop for agent connections.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use agent_relay_core::{DisconnectObserver, EventHub, RelayConfig, RelayEvent};
use agent_relay_transport::AgentConnection;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::SessionRegistry;

/// Pause after a failed accept so resource exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Fatal listener error.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("Address {addr} is already in use")]
    AddrInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Permission denied binding {addr}")]
    PermissionDenied {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => Self::AddrInUse { addr, source },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { addr, source },
            _ => Self::Io { addr, source },
        }
    }
}

/// Transient accept error. Logged; the accept loop keeps running.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("Accepted socket has no peer address: {0}")]
    PeerAddr(#[source] io::Error),
}

/// Bound agent listener.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    events: Arc<EventHub>,
    config: RelayConfig,
}

impl Listener {
    /// Bind the agent control channel.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        events: Arc<EventHub>,
        config: RelayConfig,
    ) -> Result<Self, BindError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io(addr, e))?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            events,
            config,
        })
    }

    /// Address actually bound (useful when binding port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept agents until `shutdown` fires, then close every session.
    ///
    /// Each accepted agent is registered and its receive loop spawned on a
    /// separate task; the accept loop never waits on an agent.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(addr = %self.local_addr, "listening for agents");

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let result = accepted
                .map_err(AcceptError::Accept)
                .and_then(|(stream, _)| self.admit(stream));

            if let Err(e) = result {
                tracing::warn!("{e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }

        let closed = self.registry.close_all();
        tracing::info!(addr = %self.local_addr, closed, "listener stopped");
    }

    fn admit(&self, stream: TcpStream) -> Result<(), AcceptError> {
        let (connection, reader) =
            AgentConnection::from_tcp(stream, &self.config).map_err(AcceptError::PeerAddr)?;
        let identity = connection.identity();
        let session = connection.session_id();

        self.registry.register(connection);
        self.events.push(RelayEvent::Connected { identity, session });
        tracing::info!(%identity, %session, "agent connected");

        let observer: Arc<dyn DisconnectObserver> = self.registry.clone();
        reader.spawn(Arc::clone(&self.events), observer);
        Ok(())
    }
}

/// Bind `addr` and accept agents until `shutdown` fires.
///
/// # Errors
/// Only a bind failure is returned; per-connection and accept errors are
/// contained and logged.
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    events: Arc<EventHub>,
    config: RelayConfig,
    shutdown: CancellationToken,
) -> Result<(), BindError> {
    Listener::bind(addr, registry, events, config)
        .await?
        .run(shutdown)
        .await;
    Ok(())
}
