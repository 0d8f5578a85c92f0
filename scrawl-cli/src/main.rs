//! Scrawl pipeline CLI
//!
//! `scrawl serve` runs the engine with the HTTP API; `scrawl demo` runs a
//! seeded project through the whole pipeline and streams its events.

mod commands;
mod fixtures;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scrawl", version, about = "Handwritten-note processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and HTTP API
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080", env = "SCRAWL_ADDR")]
        addr: SocketAddr,
        /// Sled data directory (ephemeral when omitted)
        #[arg(long, env = "SCRAWL_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Seed a demo project on startup
        #[arg(long)]
        seed_demo: bool,
    },
    /// Run a seeded project end-to-end and print its events
    Demo {
        /// Print raw event JSON instead of the compact form
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrawl_pipeline=info,scrawl_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            addr,
            data_dir,
            seed_demo,
        } => commands::serve::run(addr, data_dir, seed_demo).await,
        Command::Demo { json } => commands::demo::run(json).await,
    }
}
