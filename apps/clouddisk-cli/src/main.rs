//! CloudDisk command line client.

mod config;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clouddisk_api::{HttpClient, format_size};
use clouddisk_transfer::{Direction, TransferSnapshot, TransferStatus};
use tracing_subscriber::EnvFilter;

use crate::config::ClientConfig;
use crate::session::{Session, folder_label};

#[derive(Parser)]
#[command(name = "clouddisk", version, about = "CloudDisk file transfer client")]
struct Cli {
    /// Bearer token for the server.
    #[arg(long, env = "CLOUDDISK_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Overrides the configured server URL.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Print listings and transfer updates as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a folder (the root when omitted).
    Ls { folder: Option<i64> },

    /// Download files by id.
    Get {
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Folder containing the files.
        #[arg(long)]
        folder: Option<i64>,

        /// Target directory (defaults to the configured download directory).
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Upload local files.
    Put {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Destination folder (the root when omitted).
        #[arg(long)]
        folder: Option<i64>,
    },

    /// Check that the server is reachable.
    Probe,

    /// Show the configuration in effect.
    Config {
        /// Write it to the configuration file.
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,clouddisk=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match ClientConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            ClientConfig::default()
        }
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    tracing::debug!(server = %config.server_url, "configuration loaded");

    if let Command::Config { save } = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        if save {
            config.save()?;
            println!("saved to {}", config::config_path()?.display());
        }
        return Ok(());
    }

    let client = Arc::new(HttpClient::new(config.client_settings(cli.token))?);

    if let Command::Probe = cli.command {
        if client.probe().await {
            println!("{} is reachable", client.base_url());
            return Ok(());
        }
        anyhow::bail!("{} is not reachable", client.base_url());
    }

    let session = Session::new(client, &config);

    match cli.command {
        Command::Ls { folder } => {
            let listing = session.listing(folder).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&listing)?);
                return Ok(());
            }
            println!("folder {}", folder_label(folder));
            for f in &listing.folders {
                println!("  [dir]  {:>8}  {}", f.id, f.name);
            }
            for f in &listing.files {
                println!("  {:>8}  {:>10}  {}", f.id, f.formatted_size(), f.name);
            }
            if listing.is_empty() {
                println!("  (empty)");
            }
        }
        Command::Get { ids, folder, dir } => {
            let mut events = session.subscribe();
            let started = session.download(&ids, folder, dir).await?;
            run_transfers(&session, &started, &mut events, cli.json).await?;
        }
        Command::Put { paths, folder } => {
            let mut events = session.subscribe();
            let mut indicator = session.uploads().subscribe();
            tokio::spawn(async move {
                while indicator.changed().await.is_ok() {
                    let state = indicator.borrow_and_update().clone();
                    if let Some(name) = state.file_name {
                        tracing::debug!(file = %name, progress = state.progress, "uploading");
                    }
                }
            });
            let started = session.upload(&paths, folder).await?;
            run_transfers(&session, &started, &mut events, cli.json).await?;
        }
        Command::Probe | Command::Config { .. } => {}
    }

    Ok(())
}

/// Prints progress until every task finishes. Ctrl-C stops all transfers.
async fn run_transfers(
    session: &Session,
    ids: &[i64],
    events: &mut tokio::sync::mpsc::UnboundedReceiver<clouddisk_transfer::TransferEvent>,
    json: bool,
) -> anyhow::Result<()> {
    let report = |s: &TransferSnapshot| {
        if json {
            match serde_json::to_string(s) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "cannot encode snapshot"),
            }
        } else {
            print_snapshot(s);
        }
    };
    let finished = tokio::select! {
        done = session.wait(ids, events, report) => done,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping transfers");
            session.shutdown();
            anyhow::bail!("interrupted");
        }
    };

    let failed = finished
        .iter()
        .filter(|s| s.status == TransferStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} transfers failed", finished.len());
    }
    Ok(())
}

fn print_snapshot(s: &TransferSnapshot) {
    let arrow = match s.direction {
        Direction::Download => "down",
        Direction::Upload => "up",
    };
    match s.status {
        TransferStatus::Failed => println!(
            "{arrow} {}: failed: {}",
            s.display_name,
            s.error.as_deref().unwrap_or("unknown error")
        ),
        TransferStatus::Completed => println!(
            "{arrow} {}: done ({})",
            s.display_name,
            format_size(s.bytes_transferred)
        ),
        status => println!(
            "{arrow} {}: {:?} {:>3}% {}/s",
            s.display_name,
            status,
            s.progress,
            format_size(s.throughput)
        ),
    }
}
