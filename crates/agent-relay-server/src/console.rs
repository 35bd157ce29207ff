//! Line-oriented operator console.
//!
//! Talks to the relay only through its boundary API: the registry listing,
//! the dispatcher and the event hub.

use std::{
    io::{self, BufRead},
    sync::Arc,
};

use agent_relay_core::{AgentIdentity, CommandRequest, EventHub, ParseIdentityError, RelayEvent};
use agent_relay_session::{Dispatcher, SessionRegistry};
use futures::{Stream, StreamExt};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;

const HELP: &str = "\
commands:
  list [json]              show connected agents
  send <target> <command>  send a command (target: ip:port or list number)
  all <command>            send a command to every agent
  kick <target>            disconnect an agent
  help                     show this help
  quit                     exit";

/// Console error.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("Unknown command {0:?}; type `help`")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Identity(#[from] ParseIdentityError),
    #[error("No agent #{0} in the current list")]
    NoSuchIndex(usize),
    #[error("Console I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the operator names an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// 1-based position in `list` output.
    Index(usize),
    Identity(AgentIdentity),
}

/// Parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List { json: bool },
    Send { target: Target, payload: String },
    All(String),
    Kick(Target),
    Help,
    Quit,
}

fn parse_target(raw: &str) -> Result<Target, ConsoleError> {
    match raw.parse::<usize>() {
        Ok(index) => Ok(Target::Index(index)),
        Err(_) => Ok(Target::Identity(raw.parse()?)),
    }
}

/// Parse one input line. Blank lines yield `None`.
///
/// # Errors
/// Returns error for unknown commands or missing arguments.
pub fn parse_command(line: &str) -> Result<Option<Command>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();

    let command = match verb {
        "list" | "ls" => Command::List {
            json: rest == "json",
        },
        "send" => {
            let (target, payload) = rest
                .split_once(char::is_whitespace)
                .ok_or(ConsoleError::Usage("send <target> <command>"))?;
            Command::Send {
                target: parse_target(target)?,
                payload: payload.trim_start().to_string(),
            }
        }
        "all" if !rest.is_empty() => Command::All(rest.to_string()),
        "all" => return Err(ConsoleError::Usage("all <command>")),
        "kick" if !rest.is_empty() => Command::Kick(parse_target(rest)?),
        "kick" => return Err(ConsoleError::Usage("kick <target>")),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Render a relay event as one console line.
#[must_use]
pub fn format_event(event: &RelayEvent) -> String {
    match event {
        RelayEvent::Connected { identity, .. } => format!("[+] Connection from {identity}"),
        RelayEvent::Inbound(inbound) => {
            let text = String::from_utf8_lossy(&inbound.payload);
            format!("[{}] {}", inbound.source, text.trim_end())
        }
        RelayEvent::Disconnected {
            identity, reason, ..
        } => format!("[-] Disconnected: {identity} ({reason})"),
    }
}

/// Read lines from a blocking source on a dedicated thread.
///
/// The thread is detached: a read that never returns does not hold up
/// runtime shutdown. The stream ends at end of input or after the first
/// read error.
///
/// # Errors
/// Returns error if the thread cannot be spawned.
pub fn spawn_line_reader<R>(input: R) -> io::Result<ReceiverStream<io::Result<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in input.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(ReceiverStream::new(rx))
}

/// Operator console bound to one relay.
pub struct Console {
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    events: Arc<EventHub>,
}

impl Console {
    /// Create a console over the relay's boundary API.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, events: Arc<EventHub>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
            events,
        }
    }

    /// Read command lines from `input` until `quit` or end of input.
    ///
    /// Relay events are printed to `output` as they arrive, interleaved
    /// with command responses.
    ///
    /// # Errors
    /// Returns error if reading input or writing output fails.
    pub async fn run<L, W>(self, mut input: L, mut output: W) -> Result<(), ConsoleError>
    where
        L: Stream<Item = io::Result<String>> + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            output.shutdown().await
        });

        let printer = {
            let tx = tx.clone();
            let mut stream = self.events.history_plus_stream();
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    if tx.send(format_event(&event)).is_err() {
                        break;
                    }
                }
            })
        };

        let result = loop {
            let line = match input.next().await {
                Some(Ok(line)) => line,
                None => break Ok(()),
                Some(Err(e)) => break Err(ConsoleError::Io(e)),
            };

            match parse_command(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break Ok(()),
                Ok(Some(command)) => {
                    for reply in self.execute(command).await {
                        let _ = tx.send(reply);
                    }
                }
                Err(e) => {
                    let _ = tx.send(format!("error: {e}"));
                }
            }
        };

        printer.abort();
        drop(tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ConsoleError::Io(e)),
            Err(e) => tracing::warn!("console writer task failed: {e}"),
        }
        result
    }

    fn resolve(&self, target: Target) -> Result<AgentIdentity, ConsoleError> {
        match target {
            Target::Identity(identity) => Ok(identity),
            Target::Index(index) => index
                .checked_sub(1)
                .and_then(|i| self.registry.list_active().get(i).map(|s| s.identity()))
                .ok_or(ConsoleError::NoSuchIndex(index)),
        }
    }

    async fn execute(&self, command: Command) -> Vec<String> {
        match command {
            Command::List { json: true } => vec![
                serde_json::to_string_pretty(&self.registry.snapshot())
                    .unwrap_or_else(|e| format!("error: {e}")),
            ],
            Command::List { json: false } => {
                let sessions = self.registry.list_active();
                if sessions.is_empty() {
                    return vec!["No agents connected".to_string()];
                }
                let now = agent_relay_core::now_millis();
                sessions
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        format!(
                            "{:>3}. {}  up {}s  idle {}s",
                            i + 1,
                            s.identity(),
                            (now - s.connected_at()).max(0) / 1000,
                            (now - s.last_activity()).max(0) / 1000,
                        )
                    })
                    .collect()
            }
            Command::Send { target, payload } => {
                let identity = match self.resolve(target) {
                    Ok(identity) => identity,
                    Err(e) => return vec![format!("error: {e}")],
                };
                match self
                    .dispatcher
                    .dispatch(CommandRequest::new(identity, payload.clone()))
                    .await
                {
                    Ok(()) => vec![format!("[Sent to {identity}] {payload}")],
                    Err(e) => vec![format!("error: {e}")],
                }
            }
            Command::All(payload) => {
                let results = self.dispatcher.broadcast(payload.clone()).await;
                if results.is_empty() {
                    return vec!["No agents connected".to_string()];
                }
                results
                    .into_iter()
                    .map(|(identity, result)| match result {
                        Ok(()) => format!("[Sent to {identity}] {payload}"),
                        Err(e) => format!("error: {e}"),
                    })
                    .collect()
            }
            Command::Kick(target) => match self.resolve(target) {
                Ok(identity) => match self.registry.remove(identity) {
                    Some(_) => vec![format!("Disconnecting {identity}")],
                    None => vec![format!("error: Unknown agent: {identity}")],
                },
                Err(e) => vec![format!("error: {e}")],
            },
            Command::Help => vec![HELP.to_string()],
            Command::Quit => Vec::new(),
        }
    }
}
