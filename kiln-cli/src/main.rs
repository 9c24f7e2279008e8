//! Kiln CLI
//!
//! Command-line front end for the Kiln job dispatcher. `generate` and
//! `batch` drive the dispatcher from a fixed-cadence frame loop the way a
//! renderer would; `mock-backend` stands in for the generation worker.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use kiln_core::wire::DEFAULT_BACKEND_ADDR;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln sprite generation job dispatcher", long_about = None)]
struct Cli {
    /// Backend address (host:port)
    #[arg(long, env = "KILN_BACKEND_ADDR", default_value = DEFAULT_BACKEND_ADDR)]
    backend_addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `--json` output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_cli=info,kiln_engine=warn,kiln_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.backend_addr)?;

    handle_command(cli.command, &config).await
}
