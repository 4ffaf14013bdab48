//! Table Net node
//!
//! Hosts or joins a table from the command line and logs session events
//! until Ctrl-C.
//!
//! ```text
//! table-net host <port> <player>
//! table-net join <host> <port> <player>
//! ```
//!
//! The table password is read from `TABLE_NET_PASSWORD`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use table_net::{
    InMemoryTable, NetworkSettings, SecretBuffer, Table, TableNetwork, TableNetworkConfiguration,
    TableNetworkController, TableNetworkEvent, VERSION,
};

const PASSWORD_VAR: &str = "TABLE_NET_PASSWORD";

enum Command {
    Host { port: u16, player: String },
    Join { host: String, port: u16, player: String },
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [mode, port, player] if mode == "host" => Ok(Command::Host {
            port: port.parse().context("Invalid port")?,
            player: player.clone(),
        }),
        [mode, host, port, player] if mode == "join" => Ok(Command::Join {
            host: host.clone(),
            port: port.parse().context("Invalid port")?,
            player: player.clone(),
        }),
        _ => bail!("Usage: table-net host <port> <player> | table-net join <host> <port> <player>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let password = std::env::var(PASSWORD_VAR)
        .map(SecretBuffer::from)
        .unwrap_or_default();
    if password.is_empty() {
        warn!("{} not set, table is open to anyone", PASSWORD_VAR);
    }

    info!("Table Net v{}", VERSION);

    let table: Arc<dyn Table> = Arc::new(InMemoryTable::new());
    let node = TableNetwork::new(NetworkSettings::from_env());
    let mut events = node.subscribe();

    match command {
        Command::Host { port, player } => {
            let config = TableNetworkConfiguration::builder()
                .host_name("0.0.0.0")
                .port(port)
                .ephemeral_port()
                .password(password)
                .local_player_name(player)
                .local_table(table.clone())
                .build()?;
            let addr = node.host(config).await?;
            info!("Hosting on {}", addr);
        }
        Command::Join { host, port, player } => {
            let config = TableNetworkConfiguration::builder()
                .host_name(host)
                .port(port)
                .password(password)
                .local_player_name(player)
                .local_table(table.clone())
                .build()?;
            node.join(config).await?;
            info!("Players: {}", node.players().join(", "));
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(TableNetworkEvent::Disconnected(reason)) => {
                    info!("Session ended: {}", reason);
                    break;
                }
                Ok(TableNetworkEvent::TableChanged { sequence, origin }) => {
                    info!(
                        "Table change {} from {}, digest {}",
                        sequence,
                        origin,
                        hex::encode(table.memento().digest())
                    );
                }
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    node.disconnect().await;
    Ok(())
}
