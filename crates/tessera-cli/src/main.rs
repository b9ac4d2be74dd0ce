//! tessera - trickled ticket voting on governance proposals.
//!
//! CLI client that casts one vote per eligible ticket against a governance
//! server, spreading the submissions randomly over the remaining voting
//! window so an observer cannot cluster tickets by the address that cast
//! them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessera_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod session;

/// tessera - trickled ticket voting on governance proposals
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Governance server base URL
    #[arg(long)]
    server: Option<String>,

    /// Directory holding per-proposal vote journals
    #[arg(long)]
    vote_dir: Option<PathBuf>,

    /// Wallet gRPC host:port
    #[arg(long)]
    wallet_host: Option<String>,

    /// Outbound proxy URL (socks5h://... or http://...)
    #[arg(long)]
    proxy: Option<String>,

    /// Skip TLS certificate verification against the governance server
    #[arg(long)]
    skip_verify: bool,

    /// Submit the whole ballot at once instead of trickling
    #[arg(long)]
    no_trickle: bool,

    /// Duration to spread votes over (e.g. "36h"); derived from the
    /// remaining voting window when unset
    #[arg(long, value_parser = humantime::parse_duration)]
    vote_duration: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List proposals currently under active vote
    Inventory,

    /// Cast one vote per eligible ticket on a proposal
    Vote {
        /// Proposal token
        token: String,

        /// Vote option id (e.g. yes, no)
        vote_id: String,
    },

    /// Tally the votes cast on a proposal
    Tally {
        /// Proposal token
        token: String,
    },

    /// Reconcile local vote journals against server results
    Verify {
        /// Proposal tokens, or ALL for every journaled proposal; with no
        /// tokens, lists the journaled proposals
        tokens: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).context("load configuration")?,
        None => Config::default(),
    };

    if let Some(server) = &cli.server {
        config.server_url.clone_from(server);
    }
    if let Some(vote_dir) = &cli.vote_dir {
        config.vote_dir.clone_from(vote_dir);
    }
    if let Some(wallet_host) = &cli.wallet_host {
        config.wallet_host.clone_from(wallet_host);
    }
    if let Some(proxy) = &cli.proxy {
        config.proxy = Some(proxy.clone());
    }
    if cli.skip_verify {
        config.skip_verify = true;
    }
    if cli.no_trickle {
        config.trickle = false;
    }
    if let Some(duration) = cli.vote_duration {
        config.vote_duration = Some(duration);
    }

    Ok(config)
}

/// Cancel the root token when the process is told to stop.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(&cli)?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let session = session::Session::connect(config, cancel).await?;

    match cli.command {
        Commands::Inventory => commands::inventory::run(&session).await,
        Commands::Vote { token, vote_id } => commands::vote::run(&session, &token, &vote_id).await,
        Commands::Tally { token } => commands::tally::run(&session, &token).await,
        Commands::Verify { tokens } => commands::verify::run(&session, &tokens).await,
    }
}
