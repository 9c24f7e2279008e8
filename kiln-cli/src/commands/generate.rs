//! Generate command handler
//!
//! Submits one job and follows it from a frame loop until it reaches a
//! terminal state.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use kiln_client::TcpConnection;
use kiln_core::{GenerationParams, JobId, JobRecord, JobRequest, JobStatus, Resolution, Style};
use kiln_engine::JobDispatcher;
use kiln_engine::scheduler::FrameTicker;
use tracing::warn;

use super::{colorize_status, print_change};
use crate::config::Config;

#[derive(Args)]
pub struct GenerateArgs {
    /// What to draw
    pub prompt: String,

    /// pixel_art, 16bit, 8bit, retro or game_sprite
    #[arg(long, default_value = "pixel_art")]
    pub style: Style,

    /// WIDTHxHEIGHT: 512x512, 1024x1024 or 2048x2048
    #[arg(long, default_value = "1024x1024")]
    pub resolution: Resolution,

    #[arg(long, default_value_t = 30)]
    pub steps: u32,

    #[arg(long, default_value_t = 7.5)]
    pub cfg_scale: f32,

    /// Optional LoRA model name
    #[arg(long)]
    pub lora: Option<String>,

    /// Frame budget of the polling loop
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Give up and cancel after this many seconds
    #[arg(long, default_value_t = 300)]
    pub max_wait_secs: u64,

    /// Print change records as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl GenerateArgs {
    fn request(&self) -> JobRequest {
        JobRequest::new(self.prompt.clone()).with_params(GenerationParams {
            style: self.style,
            resolution: self.resolution,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            lora: self.lora.clone(),
        })
    }
}

pub async fn run(args: GenerateArgs, config: &Config) -> Result<()> {
    let request = args.request();
    request.validate()?;

    let (mut dispatcher, handle) = kiln_engine::connect(config.engine.clone())?;
    if !handle.wait_connected(Duration::from_secs(3)).await {
        println!(
            "{}",
            format!(
                "Backend {} not reachable yet, the job stays queued while reconnecting",
                config.engine.backend_addr
            )
            .yellow()
        );
    }

    let job_id = dispatcher.submit(request)?;
    if !args.json {
        println!("{} {}", "Submitted job".bold(), job_id.to_string().cyan());
    }

    let frame = Duration::from_millis(args.frame_ms.max(1));
    let max_wait = Duration::from_secs(args.max_wait_secs);
    let json = args.json;
    let record = tokio::task::spawn_blocking(move || follow(dispatcher, job_id, frame, max_wait, json))
        .await
        .context("Frame loop panicked")?;
    handle.shutdown();

    if !json {
        print_outcome(&record);
    }
    match record.status {
        JobStatus::Complete { .. } => Ok(()),
        status => anyhow::bail!("job {job_id} ended {status}"),
    }
}

/// Polls once per frame until the job is terminal
fn follow(
    mut dispatcher: JobDispatcher<TcpConnection>,
    job_id: JobId,
    frame: Duration,
    max_wait: Duration,
    json: bool,
) -> JobRecord {
    let started = Instant::now();
    let mut ticker = FrameTicker::new(frame);
    let mut cancelled = false;

    loop {
        ticker.wait();
        for change in dispatcher.poll_tick() {
            print_change(&change, json);
        }

        let snapshot = dispatcher.snapshot();
        let record = &snapshot[&job_id];
        if record.status.is_terminal() {
            if ticker.overruns() > 0 {
                warn!(overruns = ticker.overruns(), frames = ticker.frames(), "Frame budget exceeded");
            }
            return record.clone();
        }

        if !cancelled && started.elapsed() > max_wait {
            warn!(job_id = %job_id, "Waited too long, cancelling");
            cancelled = true;
            if let Err(e) = dispatcher.cancel(job_id) {
                warn!(job_id = %job_id, error = %e, "Cancel failed");
            }
        }
    }
}

fn print_outcome(record: &JobRecord) {
    println!();
    println!("  Status:    {}", colorize_status(&record.status));
    if let Some(stage) = record.stage {
        println!("  Stage:     {}", format!("{stage:?}").dimmed());
    }
    if let (Some(step), Some(total)) = (record.detail.step, record.detail.total_steps) {
        println!("  Steps:     {step}/{total}");
    }
    println!("  Attempts:  {}", record.attempt_count);
    println!(
        "  Elapsed:   {:.1}s",
        (record.last_updated_at - record.submitted_at).num_milliseconds() as f64 / 1000.0
    );
    if let JobStatus::Complete { output_path, .. } = &record.status {
        println!("  Output:    {}", output_path.green());
    }
}
