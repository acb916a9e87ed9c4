//! Mandi - moderated negotiation chat server
//!
//! Serves farmer/buyer deal conversations over TCP, backed by SQLite.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mandi_core::{ChatService, Database};
use mandi_net::Server;

mod config;

use config::{Cli, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mandi: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Starting Mandi");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config.database_path()?;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open_with_busy_timeout(&db_path, config.busy_timeout())?;
    tracing::info!(path = %db_path.display(), schema = db.schema_version(), "Database ready");

    let service = ChatService::new(db);
    let server = Server::start(config.server_config(), service).await?;

    tokio::signal::ctrl_c().await?;
    server.shutdown();

    // Give sessions a moment to flush the shutdown notice
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    tracing::info!("Stopped");
    Ok(())
}
