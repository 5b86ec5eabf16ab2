//! ocisync CLI - Sync OCI artifacts into a local cache and push new ones.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocisync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding work");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Download(args) => commands::download::run(&args, cancel).await,
        Commands::Upload(args) => commands::upload::run(&args, cancel).await,
        Commands::Version => {
            println!("ocisync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
