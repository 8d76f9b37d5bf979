//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "aegis")]
#[command(version)]
#[command(about = "Session bridge for the hosted identity provider")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Log in through the hosted UI (authorization-code flow)
    Login,
    /// Show the current session state
    Status,
    /// Log out (clear persisted tokens)
    Logout,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Commands::Login => commands::auth::login().await,
            Commands::Status => commands::auth::status(),
            Commands::Logout => commands::auth::logout(),
        }
    })
}
