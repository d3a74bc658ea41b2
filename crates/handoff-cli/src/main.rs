// handoff: move a local database and its attachments to another device on
// the same network.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use handoff_db::Database;
use handoff_transfer::{
    ClientState, ClosedReason, ServerState, TransferClient, TransferServer, file_path,
};
use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(about = "Device-to-device data migration over the local network", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the local database to one receiving device
    Send,
    /// Receive a database from the device that printed `uri`
    Receive { uri: String },
    /// Fill the local database with sample data
    Seed {
        #[arg(default_value = "20")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handoff=debug,handoff_transfer=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Send => cmd_send(&config).await,
        Commands::Receive { uri } => cmd_receive(&config, &uri).await,
        Commands::Seed { count } => cmd_seed(&config, count),
    }
}

async fn cmd_send(config: &Config) -> Result<ExitCode> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let server = TransferServer::new(config.server_config(), db);
    server.start_listening().await.context("unable to start listening")?;
    let payload = server
        .pairing_payload()
        .context("server stopped before listening")?;

    println!("Pairing code: {:03}", payload.code);
    println!("{}", payload.to_uri());

    let mut states = server.subscribe();
    let mut blocked = server.subscribe_blocked_reason();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                server.stop_listening();
            }
            Ok(()) = blocked.changed() => {
                let reason = *blocked.borrow_and_update();
                if let Some(reason) = reason {
                    warn!("Receiver turned away: {:?}", reason);
                    server.consume_last_connection_blocked_reason();
                }
            }
            Ok(()) = states.changed() => {
                let state = states.borrow_and_update().clone();
                match state {
                    ServerState::Transfer { progress, speed } => {
                        info!("Sending {:.1}% {}", progress, speed);
                    }
                    ServerState::Closed(ClosedReason::Finished) => return Ok(ExitCode::SUCCESS),
                    ServerState::Closed(reason) => {
                        error!("Send ended: {:?}", reason);
                        return Ok(ExitCode::FAILURE);
                    }
                    other => info!("{:?}", other),
                }
            }
        }
    }
}

async fn cmd_receive(config: &Config, uri: &str) -> Result<ExitCode> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let client = TransferClient::from_pairing(
        uri,
        config.account_id.clone(),
        config.cache_dir.clone(),
        Some(config.attachments_dir.clone()),
        db,
    )?;

    let mut states = client.subscribe();
    client.start();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling");
                client.cancel();
            }
            Ok(()) = states.changed() => {
                let state = states.borrow_and_update().clone();
                match state {
                    ClientState::Transfer { progress, speed } => {
                        info!("Receiving {:.1}% {}", progress, speed);
                    }
                    ClientState::Importing { progress } => {
                        info!("Importing {:.0}%", progress * 100.0);
                    }
                    ClientState::Finished => {
                        info!("Received {} items", client.processed_count());
                        return Ok(ExitCode::SUCCESS);
                    }
                    ClientState::Failed(e) => {
                        error!("Receive failed: {}", e);
                        return Ok(ExitCode::FAILURE);
                    }
                    ClientState::Cancelled => return Ok(ExitCode::FAILURE),
                    other => info!("{:?}", other),
                }
            }
        }
    }
}

fn cmd_seed(config: &Config, count: usize) -> Result<ExitCode> {
    let db = Database::open(&config.db_path)?;
    let media = db.seed(&config.account_id, count)?;

    std::fs::create_dir_all(&config.attachments_dir)
        .with_context(|| format!("creating {}", config.attachments_dir.display()))?;
    let mut rng = rand::rng();
    for message in &media {
        let id = Uuid::parse_str(&message.message_id)?;
        let mut bytes = vec![0u8; rng.random_range(1024..=256 * 1024)];
        rng.fill(bytes.as_mut_slice());
        std::fs::write(file_path(&config.attachments_dir, &id), &bytes)?;
    }

    info!(
        "Seeded {} messages, {} attachments in {}",
        count,
        media.len(),
        config.attachments_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}
