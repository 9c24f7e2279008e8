//! Batch command handler
//!
//! Submits a file of requests as one batch and redraws the aggregate counts
//! from the frame loop until nothing is pending. Jobs still pending when
//! the wait runs out are cancelled.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use colored::*;
use kiln_client::BackendConnection;
use kiln_core::{BatchCounts, BatchId, JobRequest, JobStatus};
use kiln_engine::JobDispatcher;
use kiln_engine::scheduler::FrameTicker;
use tracing::warn;

use super::colorize_status;
use crate::config::Config;

/// Pacing of the follow loop
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub frame: Duration,
    pub max_wait: Duration,
}

pub async fn run(file: &Path, name: Option<String>, timing: Timing, config: &Config) -> Result<()> {
    let requests = load_requests(file)?;
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch".to_string())
    });

    let (mut dispatcher, handle) = kiln_engine::connect(config.engine.clone())?;
    if !handle.wait_connected(Duration::from_secs(3)).await {
        println!(
            "{}",
            "Backend not reachable yet, jobs stay queued while reconnecting".yellow()
        );
    }

    let count = requests.len();
    let batch_id = dispatcher.submit_batch(name.clone(), requests)?;
    println!(
        "{} {} ({} job(s)) as {}",
        "Submitted batch".bold(),
        name,
        count,
        batch_id.to_string().cyan()
    );

    let counts = tokio::task::spawn_blocking(move || follow(dispatcher, batch_id, timing))
        .await
        .context("Frame loop panicked")?;
    handle.shutdown();

    if counts.failed > 0 {
        anyhow::bail!("{} of {} job(s) did not complete", counts.failed, counts.total());
    }
    Ok(())
}

/// Cancels every job of the batch that has not finished yet
fn cancel_pending<C: BackendConnection>(dispatcher: &mut JobDispatcher<C>, batch_id: &BatchId) -> usize {
    let pending: Vec<_> = dispatcher
        .snapshot()
        .batch_jobs(batch_id)
        .iter()
        .filter(|job| job.status.is_pending())
        .map(|job| job.id)
        .collect();

    warn!(batch_id = %batch_id, jobs = pending.len(), "Waited too long, cancelling");
    pending
        .into_iter()
        .filter(|id| match dispatcher.cancel(*id) {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Cancel failed");
                false
            }
        })
        .count()
}

/// Reads a JSON array of requests
fn load_requests(file: &Path) -> Result<Vec<JobRequest>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", file.display()))
}

/// Polls once per frame and prints the counts whenever they change
fn follow<C: BackendConnection>(
    mut dispatcher: JobDispatcher<C>,
    batch_id: BatchId,
    timing: Timing,
) -> BatchCounts {
    let started = Instant::now();
    let mut ticker = FrameTicker::new(timing.frame);
    let mut last: Option<BatchCounts> = None;
    let mut expired = false;

    loop {
        ticker.wait();
        let mut changed = !dispatcher.poll_tick().is_empty();

        if !expired && started.elapsed() > timing.max_wait {
            expired = true;
            changed |= cancel_pending(&mut dispatcher, &batch_id) > 0;
        }

        if !changed && last.is_some() {
            continue;
        }

        let snapshot = dispatcher.snapshot();
        let Some(counts) = snapshot.batch_counts(&batch_id) else {
            return BatchCounts::default();
        };
        if last != Some(counts) {
            println!("  {counts}");
            last = Some(counts);
        }

        if counts.is_settled() {
            println!();
            for (index, job) in snapshot.batch_jobs(&batch_id).iter().enumerate() {
                let output = match &job.status {
                    JobStatus::Complete { output_path, .. } => output_path.green().to_string(),
                    _ => String::new(),
                };
                println!(
                    "  {:>2}. {:<40} {} {}",
                    index + 1,
                    job.request.prompt,
                    colorize_status(&job.status),
                    output
                );
            }
            return counts;
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_client::LoopbackConnection;
    use kiln_core::wire::Response;

    use super::*;

    #[test]
    fn test_follow_cancels_what_is_still_pending() {
        let (connection, backend) = LoopbackConnection::pair();
        let mut dispatcher = JobDispatcher::new(kiln_engine::Config::default(), connection);
        let batch_id = dispatcher
            .submit_batch(
                "torches",
                vec![JobRequest::new("wall torch"), JobRequest::new("standing torch")],
            )
            .unwrap();

        let ids = dispatcher.snapshot().batch(&batch_id).unwrap().job_ids.clone();
        backend.push_responses([
            Response::accepted(ids[0]),
            Response::complete(ids[0], "outputs/wall.png", 2.0),
            Response::accepted(ids[1]),
        ]);

        let timing = Timing {
            frame: Duration::from_millis(1),
            max_wait: Duration::from_millis(20),
        };
        let counts = follow(dispatcher, batch_id, timing);

        assert!(counts.is_settled());
        assert_eq!(counts.successful, 1);
        assert_eq!(counts.failed, 1);
    }
}
