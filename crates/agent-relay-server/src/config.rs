//! CLI configuration for `agent-relay`.
//!
//! ```text
//! agent-relay [--bind 0.0.0.0:5555] [--idle-timeout-secs 300] [--no-console]
//! ```

use std::{net::SocketAddr, time::Duration};

use agent_relay_core::{
    RelayConfig,
    config::{DEFAULT_EVENT_CAPACITY, DEFAULT_HISTORY_BYTES, DEFAULT_MAX_FRAME_LEN},
};
use clap::Parser;

// ---------------------------------------------------------------------------
// Cli
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Agent session registry and command relay")]
pub struct Cli {
    /// TCP address agents connect to.
    #[arg(long, default_value = "0.0.0.0:5555")]
    pub bind: SocketAddr,

    /// Largest frame payload accepted from or sent to an agent.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Deadline for writing one command to an agent.
    #[arg(long, default_value_t = 30)]
    pub write_timeout_secs: u64,

    /// Drop agents that stay silent this long. Unset waits forever.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Live event buffer per subscriber before it starts lagging.
    #[arg(long, default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,

    /// Bytes of agent output replayed when the console attaches.
    #[arg(long, default_value_t = DEFAULT_HISTORY_BYTES)]
    pub history_bytes: usize,

    /// Run headless; stop on Ctrl-C.
    #[arg(long)]
    pub no_console: bool,
}

impl Cli {
    /// Relay tunables selected on the command line.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_frame_len: self.max_frame_len,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            event_capacity: self.event_capacity,
            history_bytes: self.history_bytes,
        }
    }
}
