//! A single agent connection.
//!
//! Creating a connection yields two halves: the shared [`AgentConnection`]
//! handle, which the registry stores and the dispatcher sends through, and
//! a [`ConnectionReader`] that is consumed by the connection's one and only
//! receive loop. The read and write paths never contend with each other.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{
    AgentIdentity, DisconnectObserver, DisconnectReason, EventHub, InboundEvent, RelayConfig,
    RelayEvent, SessionId, SessionState, SessionTracker,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::{DecodeError, EncodeError, FrameCodec};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,
    #[error("Payload of {len} bytes exceeds frame limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Write failed: {0}")]
    Io(#[source] io::Error),
    #[error("Write timed out after {0:?}")]
    TimedOut(Duration),
}

/// Shared handle to one agent socket.
pub struct AgentConnection {
    identity: AgentIdentity,
    session: SessionId,
    tracker: Arc<SessionTracker>,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    write_timeout: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .field("state", &self.tracker.state())
            .finish_non_exhaustive()
    }
}

impl AgentConnection {
    /// Wrap an accepted TCP stream.
    ///
    /// The identity is the stream's peer address.
    ///
    /// # Errors
    /// Returns error if the peer address cannot be read.
    pub fn from_tcp(
        stream: TcpStream,
        config: &RelayConfig,
    ) -> io::Result<(Arc<Self>, ConnectionReader)> {
        let identity = AgentIdentity::new(stream.peer_addr()?);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%identity, "failed to set TCP_NODELAY: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(identity, read_half, write_half, config))
    }

    /// Wrap an arbitrary read/write pair as the connection for `identity`.
    #[must_use]
    pub fn new<R, W>(
        identity: AgentIdentity,
        reader: R,
        writer: W,
        config: &RelayConfig,
    ) -> (Arc<Self>, ConnectionReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = FrameCodec::new(config.max_frame_len);
        let connection = Arc::new(Self {
            identity,
            session: Uuid::new_v4(),
            tracker: Arc::new(SessionTracker::new()),
            writer: tokio::sync::Mutex::new(FramedWrite::new(Box::new(writer) as BoxedWriter, codec)),
            write_timeout: config.write_timeout,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        });

        let reader = ConnectionReader {
            connection: Arc::clone(&connection),
            frames: FramedRead::new(Box::new(reader) as BoxedReader, codec),
            idle_timeout: config.idle_timeout,
        };

        (connection, reader)
    }

    /// Identity of the remote agent.
    #[must_use]
    pub const fn identity(&self) -> AgentIdentity {
        self.identity
    }

    /// Session this connection belongs to.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// Shared lifecycle tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.tracker.state()
    }

    /// Whether `close` has been called or the connection failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Why the connection ended, once it has.
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write one framed message to the agent.
    ///
    /// Safe to call concurrently with the receive loop and with other
    /// senders; frames are never interleaved.
    ///
    /// # Errors
    /// Returns `Closed` if the connection is already down. A write error or
    /// timeout disconnects the connection before returning.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        let payload = payload.into();
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let len = payload.len();
        let error = match timeout(self.write_timeout, writer.send(payload)).await {
            Ok(Ok(())) => {
                self.tracker.touch();
                tracing::trace!(identity = %self.identity, len, "frame sent");
                return Ok(());
            }
            Ok(Err(EncodeError::PayloadTooLarge { len, max })) => {
                return Err(SendError::PayloadTooLarge { len, max });
            }
            Ok(Err(EncodeError::Io(e))) => SendError::Io(e),
            Err(_) => SendError::TimedOut(self.write_timeout),
        };
        drop(writer);

        tracing::warn!(identity = %self.identity, "send failed: {error}");
        self.shutdown(DisconnectReason::SendFailed(error.to_string()));
        Err(error)
    }

    /// Close the connection.
    ///
    /// Unblocks the receive loop, which then tears the socket down and
    /// reports the disconnect. Returns true only for the first call.
    pub fn close(&self) -> bool {
        self.shutdown(DisconnectReason::Closed)
    }

    fn shutdown(&self, reason: DisconnectReason) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        }
        self.tracker.mark_disconnected();
        self.cancel.cancel();
        first
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.get_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(identity = %self.identity, "socket shutdown: {e}"),
            Err(_) => tracing::debug!(identity = %self.identity, "socket shutdown timed out"),
        }
    }
}

/// Read half of a connection; drives the receive loop exactly once.
pub struct ConnectionReader {
    connection: Arc<AgentConnection>,
    frames: FramedRead<BoxedReader, FrameCodec>,
    idle_timeout: Option<Duration>,
}

enum ReadFailure {
    Idle,
    Decode(DecodeError),
}

impl ConnectionReader {
    /// Spawn the receive loop on its own task.
    pub fn spawn(
        self,
        sink: Arc<EventHub>,
        observer: Arc<dyn DisconnectObserver>,
    ) -> JoinHandle<DisconnectReason> {
        let span = tracing::info_span!(
            "agent",
            identity = %self.connection.identity,
            session = %self.connection.session,
        );
        tokio::spawn(self.run(sink, observer).instrument(span))
    }

    /// Read frames until the connection ends.
    ///
    /// Each payload is pushed to `sink` as an inbound event. On end of
    /// stream, a decode error, a read error, the idle deadline or `close`,
    /// the session is marked disconnected, the socket is shut down,
    /// `observer` is notified and a `Disconnected` event is pushed.
    pub async fn run(
        mut self,
        sink: Arc<EventHub>,
        observer: Arc<dyn DisconnectObserver>,
    ) -> DisconnectReason {
        let conn = Arc::clone(&self.connection);

        let detected = loop {
            let next = tokio::select! {
                biased;
                () = conn.cancel.cancelled() => break DisconnectReason::Closed,
                next = self.next_frame() => next,
            };

            match next {
                Ok(Some(payload)) => {
                    conn.tracker.touch();
                    tracing::trace!(len = payload.len(), "frame received");
                    sink.push_inbound(InboundEvent::new(conn.identity, payload));
                }
                Ok(None) => break DisconnectReason::PeerClosed,
                Err(ReadFailure::Idle) => break DisconnectReason::IdleTimeout,
                Err(ReadFailure::Decode(DecodeError::Io(e))) => {
                    break DisconnectReason::Io(e.to_string());
                }
                Err(ReadFailure::Decode(e)) => {
                    tracing::warn!("dropping agent after malformed frame: {e}");
                    break DisconnectReason::Protocol(e.to_string());
                }
            }
        };

        conn.shutdown(detected.clone());
        let reason = conn.disconnect_reason().unwrap_or(detected);

        conn.shutdown_writer().await;
        drop(self.frames);

        observer.on_disconnect(conn.identity, conn.session);
        sink.push(RelayEvent::Disconnected {
            identity: conn.identity,
            session: conn.session,
            reason: reason.clone(),
        });
        tracing::info!(%reason, "agent disconnected");

        reason
    }

    async fn next_frame(&mut self) -> Result<Option<Bytes>, ReadFailure> {
        let next = match self.idle_timeout {
            Some(limit) => timeout(limit, self.frames.next())
                .await
                .map_err(|_| ReadFailure::Idle)?,
            None => self.frames.next().await,
        };
        next.transpose().map_err(ReadFailure::Decode)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex, split};

    use super::*;
    use crate::codec::encode_frame;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<(AgentIdentity, SessionId)>>,
    }

    impl DisconnectObserver for Recorder {
        fn on_disconnect(&self, identity: AgentIdentity, session: SessionId) {
            self.calls.lock().unwrap().push((identity, session));
        }
    }

    fn identity() -> AgentIdentity {
        "10.1.1.1:40001".parse().unwrap()
    }

    fn empty_reader() -> tokio_test::io::Mock {
        tokio_test::io::Builder::new().build()
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let writer = tokio_test::io::Builder::new()
            .write(b"\x00\x00\x00\x04ping")
            .build();
        let (conn, _reader) =
            AgentConnection::new(identity(), empty_reader(), writer, &RelayConfig::default());

        let before = conn.tracker().last_activity();
        conn.send("ping").await.unwrap();
        assert!(conn.tracker().last_activity() >= before);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_disconnects() {
        let writer = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let (conn, _reader) =
            AgentConnection::new(identity(), empty_reader(), writer, &RelayConfig::default());
        conn.tracker().activate();

        let err = conn.send("ls").await.unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert!(matches!(
            conn.disconnect_reason(),
            Some(DisconnectReason::SendFailed(_))
        ));

        let err = conn.send("ls").await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn test_write_timeout_disconnects() {
        // The agent never reads, so the pipe fills after 16 bytes.
        let (_agent, relay_side) = duplex(16);
        let (read_half, write_half) = split(relay_side);
        let config = RelayConfig {
            write_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        let (conn, _reader) = AgentConnection::new(identity(), read_half, write_half, &config);
        conn.tracker().activate();

        let err = conn.send(vec![0u8; 4096]).await.unwrap_err();
        assert!(matches!(err, SendError::TimedOut(limit) if limit == Duration::from_millis(50)));
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert!(matches!(
            conn.disconnect_reason(),
            Some(DisconnectReason::SendFailed(_))
        ));

        let err = conn.send("ls").await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn test_oversized_payload_keeps_connection() {
        let config = RelayConfig {
            max_frame_len: 4,
            ..RelayConfig::default()
        };
        let writer = tokio_test::io::Builder::new().build();
        let (conn, _reader) = AgentConnection::new(identity(), empty_reader(), writer, &config);

        let err = conn.send("too long").await.unwrap_err();
        assert!(matches!(err, SendError::PayloadTooLarge { len: 8, max: 4 }));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_receive_loop_emits_events_until_eof() {
        let mut stream = encode_frame(b"hello").unwrap().to_vec();
        stream.extend_from_slice(&encode_frame(b"world").unwrap());
        let (head, tail) = stream.split_at(7);
        let reader = tokio_test::io::Builder::new().read(head).read(tail).build();
        let writer = tokio_test::io::Builder::new().build();

        let hub = Arc::new(EventHub::default());
        let recorder = Arc::new(Recorder::default());
        let (conn, reader) = AgentConnection::new(identity(), reader, writer, &RelayConfig::default());
        conn.tracker().activate();

        let reason = reader.run(Arc::clone(&hub), recorder.clone()).await;
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![(identity(), conn.session_id())]
        );

        let history = hub.history();
        assert_eq!(history.len(), 3);
        assert!(matches!(&history[0], RelayEvent::Inbound(e) if e.payload == "hello"));
        assert!(matches!(&history[1], RelayEvent::Inbound(e) if e.payload == "world"));
        assert!(matches!(
            &history[2],
            RelayEvent::Disconnected { reason: DisconnectReason::PeerClosed, .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let config = RelayConfig {
            max_frame_len: 16,
            ..RelayConfig::default()
        };
        let reader = tokio_test::io::Builder::new()
            .read(b"\x00\x01\x00\x00garbage")
            .build();
        let writer = tokio_test::io::Builder::new().build();
        let (_conn, reader) = AgentConnection::new(identity(), reader, writer, &config);

        let reason = reader
            .run(Arc::new(EventHub::default()), Arc::new(Recorder::default()))
            .await;
        assert!(matches!(reason, DisconnectReason::Protocol(_)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (mut agent, relay_side) = duplex(1024);
        let (read_half, write_half) = split(relay_side);
        let (conn, reader) =
            AgentConnection::new(identity(), read_half, write_half, &RelayConfig::default());
        let recorder = Arc::new(Recorder::default());
        let task = reader.spawn(Arc::new(EventHub::default()), recorder.clone());

        assert!(conn.close());
        assert!(!conn.close());

        assert_eq!(task.await.unwrap(), DisconnectReason::Closed);
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);

        // The agent side observes end of stream.
        let mut buf = Vec::new();
        agent.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_disconnects() {
        let (_agent, relay_side) = duplex(1024);
        let (read_half, write_half) = split(relay_side);
        let config = RelayConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..RelayConfig::default()
        };
        let (_conn, reader) = AgentConnection::new(identity(), read_half, write_half, &config);

        let reason = reader
            .run(Arc::new(EventHub::default()), Arc::new(Recorder::default()))
            .await;
        assert_eq!(reason, DisconnectReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_send_concurrent_with_receive() {
        let (mut agent, relay_side) = duplex(64 * 1024);
        let (read_half, write_half) = split(relay_side);
        let (conn, reader) =
            AgentConnection::new(identity(), read_half, write_half, &RelayConfig::default());
        let hub = Arc::new(EventHub::default());
        let mut events = hub.subscribe();
        let task = reader.spawn(Arc::clone(&hub), Arc::new(Recorder::default()));

        agent.write_all(&encode_frame(b"output").unwrap()).await.unwrap();
        conn.send("command").await.unwrap();

        let mut frame = [0u8; 11];
        agent.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"\x00\x00\x00\x07command");

        match events.recv().await.unwrap() {
            RelayEvent::Inbound(e) => assert_eq!(e.payload, "output"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(agent);
        assert_eq!(task.await.unwrap(), DisconnectReason::PeerClosed);
    }
}
