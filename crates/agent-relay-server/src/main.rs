//! Agent relay daemon.
//!
//! Run with: cargo run -p agent-relay-server -- --bind 0.0.0.0:5555
//!
//! Agents connect over TCP and exchange `[u32 BE length][payload]` frames.
//! Commands are issued from the console on stdin.

mod config;
mod console;

use std::sync::Arc;

use agent_relay_core::EventHub;
use agent_relay_session::{Listener, SessionRegistry};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::Cli,
    console::{Console, spawn_line_reader},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout belongs to the console.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.relay_config();

    let registry = Arc::new(SessionRegistry::new());
    let events = Arc::new(EventHub::from_config(&config));

    let listener = Listener::bind(cli.bind, Arc::clone(&registry), Arc::clone(&events), config)
        .await
        .with_context(|| format!("cannot listen on {}", cli.bind))?;

    let shutdown = CancellationToken::new();
    let accept_task = tokio::spawn(listener.run(shutdown.clone()));

    if cli.no_console {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    } else {
        let console = Console::new(Arc::clone(&registry), events);
        let input = spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
            .context("starting console input")?;
        tokio::select! {
            result = console.run(input, tokio::io::stdout()) => {
                result.context("console failed")?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
            }
        }
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    accept_task.await.context("accept loop panicked")?;
    Ok(())
}
