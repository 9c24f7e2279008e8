//! Commands module
//!
//! Defines all CLI commands and their handlers, plus the shared output
//! helpers.

mod batch;
mod generate;
mod mock;
mod ping;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use kiln_core::{ChangeRecord, JobStatus};

use crate::config::Config;

pub use generate::GenerateArgs;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check that the backend answers
    Ping {
        /// How long to wait for the pong
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Generate one sprite and follow it to completion
    Generate(GenerateArgs),
    /// Submit a JSON file of requests as one batch
    Batch {
        /// JSON array of `{ "prompt": ..., "params": { ... } }` objects
        file: PathBuf,

        /// Batch name (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,

        /// Frame budget of the polling loop
        #[arg(long, default_value_t = 16)]
        frame_ms: u64,

        /// Cancel whatever is still pending after this many seconds
        #[arg(long, default_value_t = 900)]
        max_wait_secs: u64,
    },
    /// Run a simulated generation backend
    MockBackend {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:5555")]
        listen: String,

        /// Time spent in each generation stage
        #[arg(long, default_value_t = 400)]
        step_ms: u64,

        /// Fail every Nth job
        #[arg(long)]
        fail_every: Option<u64>,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Ping { timeout_ms } => ping::run(config, timeout_ms).await,
        Commands::Generate(args) => generate::run(args, config).await,
        Commands::Batch {
            file,
            name,
            frame_ms,
            max_wait_secs,
        } => {
            let timing = batch::Timing {
                frame: Duration::from_millis(frame_ms.max(1)),
                max_wait: Duration::from_secs(max_wait_secs),
            };
            batch::run(&file, name, timing, config).await
        }
        Commands::MockBackend {
            listen,
            step_ms,
            fail_every,
        } => mock::run(&listen, step_ms, fail_every).await,
    }
}

/// Prints one change record as a colored line or a JSON line
fn print_change(change: &ChangeRecord, json: bool) {
    if json {
        match serde_json::to_string(change) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize change record"),
        }
        return;
    }

    let old = change
        .old_status
        .as_ref()
        .map(|status| colorize_status(status).to_string())
        .unwrap_or_else(|| "new".dimmed().to_string());

    println!(
        "  {} {} {} {} {}",
        change.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        short_id(&change.job_id.to_string()).cyan(),
        old,
        "→".dimmed(),
        colorize_status(&change.new_status)
    );
}

/// Colorize a job status for display
fn colorize_status(status: &JobStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        JobStatus::Queued => text.yellow(),
        JobStatus::Accepted => text.blue(),
        JobStatus::InProgress { .. } => text.cyan(),
        JobStatus::Complete { .. } => text.green(),
        JobStatus::Failed { .. } => text.red(),
        JobStatus::Cancelled => text.dimmed(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
