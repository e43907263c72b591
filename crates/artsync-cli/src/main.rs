mod cli;
mod commands;

use anyhow::Result;
use artsync_config::Config;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let config = Config::load()?;

    match cli.command {
        cli::Commands::Cache(cmd) => commands::cache::handle(cmd, &config),
        cli::Commands::Manifest(cmd) => commands::manifest::handle(cmd, &config).await,
    }
}
