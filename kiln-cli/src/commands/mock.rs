//! Mock backend
//!
//! A simulated generation worker speaking the wire protocol. Every job is
//! acknowledged, walks through the generation stages one step at a time and
//! completes with `outputs/<job_id>.png`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use kiln_core::wire::{self, JobAccepted, JobProgress, Request, Response};
use kiln_core::{GenerationStage, JobId, ProgressDetail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STAGES: [GenerationStage; 6] = [
    GenerationStage::Initializing,
    GenerationStage::LoadingModels,
    GenerationStage::Encoding,
    GenerationStage::Sampling,
    GenerationStage::Decoding,
    GenerationStage::PostProcessing,
];

#[derive(Debug, Clone, Copy)]
struct Settings {
    step: Duration,
    fail_every: Option<u64>,
}

/// Jobs known to the backend, shared by every connection
///
/// A finished job is forgotten once its final response has been read back
/// through `Status`.
#[derive(Debug, Default)]
struct Worker {
    jobs: Mutex<HashMap<JobId, SimJob>>,
    started: AtomicU64,
}

#[derive(Debug)]
struct SimJob {
    cancel: CancellationToken,
    last: Response,
}

impl Worker {
    fn record(&self, job_id: JobId, response: &Response) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.get_mut(&job_id) {
            job.last = response.clone();
        }
    }

    fn last(&self, job_id: &JobId) -> Option<Response> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(job_id).map(|job| job.last.clone())
    }

    /// Answers a status query, evicting the job if it has finished
    fn status(&self, job_id: &JobId) -> Option<Response> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let last = jobs.get(job_id)?.last.clone();
        if is_final(&last) {
            jobs.remove(job_id);
            debug!(job_id = %job_id, "Finished job evicted");
        }
        Some(last)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Registers a job, returning its cancel token and ordinal, or `None` if
    /// the id is already known
    fn register(&self, job_id: JobId) -> Option<(CancellationToken, u64)> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        jobs.insert(
            job_id,
            SimJob {
                cancel: cancel.clone(),
                last: Response::accepted(job_id),
            },
        );
        Some((cancel, self.started.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn cancel(&self, job_id: &JobId) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(job_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

pub async fn run(listen: &str, step_ms: u64, fail_every: Option<u64>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    let settings = Settings {
        step: Duration::from_millis(step_ms),
        fail_every: fail_every.filter(|n| *n > 0),
    };
    let worker = Arc::new(Worker::default());

    info!(listen, step_ms, ?fail_every, "Mock backend ready");

    loop {
        let (socket, peer) = listener.accept().await.context("Accept failed")?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }
        info!(%peer, "Client connected");

        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            serve(socket, worker, settings).await;
            info!(%peer, "Client disconnected");
        });
    }
}

/// Serves one client session until it disconnects
async fn serve<S>(stream: S, worker: Arc<Worker>, settings: Settings)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let payload = match wire::encode(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode response");
                    continue;
                }
            };
            if sink.send(Bytes::from(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Read failed");
                break;
            }
        };

        match wire::decode::<Request>(&frame) {
            Ok(request) => handle_request(request, &worker, settings, &tx),
            Err(e) => {
                warn!(error = %e, "Undecodable request");
                let _ = tx.send(Response::error(e.to_string()));
            }
        }
    }

    drop(tx);
    writer.abort();
}

fn handle_request(
    request: Request,
    worker: &Arc<Worker>,
    settings: Settings,
    tx: &mpsc::UnboundedSender<Response>,
) {
    debug!(kind = request.kind(), "Request received");
    match request {
        Request::Generate(generate) => start_job(generate.job_id, worker, settings, tx),
        Request::GenerateBatch(batch) => {
            info!(batch_id = %batch.batch_id, jobs = batch.entries.len(), name = %batch.name, "Batch received");
            for entry in batch.entries {
                start_job(entry.job_id, worker, settings, tx);
            }
        }
        Request::Cancel(job) => {
            if !worker.cancel(&job.job_id) {
                let _ = tx.send(Response::error(format!("unknown job {}", job.job_id)));
            }
        }
        Request::Status(job) => {
            let response = worker
                .status(&job.job_id)
                .unwrap_or_else(|| Response::error(format!("unknown job {}", job.job_id)));
            let _ = tx.send(response);
        }
        Request::Ping => {
            let _ = tx.send(Response::Pong);
        }
    }
}

fn is_final(response: &Response) -> bool {
    matches!(
        response,
        Response::Complete(_) | Response::Failed(_) | Response::Cancelled(_)
    )
}

fn start_job(
    job_id: JobId,
    worker: &Arc<Worker>,
    settings: Settings,
    tx: &mpsc::UnboundedSender<Response>,
) {
    let Some((cancel, ordinal)) = worker.register(job_id) else {
        // resubmission of a job already running: restate where it is
        if let Some(last) = worker.last(&job_id) {
            let _ = tx.send(last);
        }
        return;
    };

    info!(job_id = %job_id, ordinal, "Job started");
    let worker = Arc::clone(worker);
    let tx = tx.clone();
    tokio::spawn(async move {
        simulate(job_id, ordinal, settings, cancel, &worker, &tx).await;
    });
}

async fn simulate(
    job_id: JobId,
    ordinal: u64,
    settings: Settings,
    cancel: CancellationToken,
    worker: &Worker,
    tx: &mpsc::UnboundedSender<Response>,
) {
    let emit = |response: Response| {
        worker.record(job_id, &response);
        let _ = tx.send(response);
    };

    let started = Instant::now();
    let estimate = settings.step.as_secs_f32() * STAGES.len() as f32;
    emit(Response::Accepted(JobAccepted {
        job_id,
        estimated_seconds: Some(estimate),
    }));

    for (index, stage) in STAGES.iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(job_id = %job_id, "Job cancelled");
                emit(Response::cancelled(job_id));
                return;
            }
            _ = tokio::time::sleep(settings.step) => {}
        }

        let step = index as u32 + 1;
        let total_steps = STAGES.len() as u32;
        let preview_path = (*stage == GenerationStage::Decoding)
            .then(|| format!("previews/{job_id}_{step}.png"));
        emit(Response::Progress(JobProgress {
            job_id,
            fraction: step as f32 / (total_steps + 1) as f32,
            stage: Some(*stage),
            detail: ProgressDetail {
                step: Some(step),
                total_steps: Some(total_steps),
                eta_seconds: Some(settings.step.as_secs_f32() * (total_steps - step) as f32),
                preview_path,
            },
        }));
    }

    if settings.fail_every.is_some_and(|n| ordinal % n == 0) {
        info!(job_id = %job_id, "Job failed (simulated)");
        emit(Response::failed(job_id, "simulated worker failure"));
    } else {
        let output = format!("outputs/{job_id}.png");
        info!(job_id = %job_id, output = %output, "Job complete");
        emit(Response::complete(
            job_id,
            output,
            started.elapsed().as_secs_f64(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::JobRequest;
    use kiln_core::wire::GenerateRequest;
    use tokio::io::DuplexStream;

    use super::*;

    type Client = Framed<DuplexStream, LengthDelimitedCodec>;

    fn start(fail_every: Option<u64>) -> Client {
        start_with_worker(fail_every).0
    }

    fn start_with_worker(fail_every: Option<u64>) -> (Client, Arc<Worker>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let settings = Settings {
            step: Duration::from_millis(1),
            fail_every,
        };
        let worker = Arc::new(Worker::default());
        tokio::spawn(serve(server, Arc::clone(&worker), settings));
        (Framed::new(client, LengthDelimitedCodec::new()), worker)
    }

    async fn send(client: &mut Client, request: &Request) {
        client
            .send(Bytes::from(wire::encode(request).unwrap()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> Response {
        let frame = client.next().await.unwrap().unwrap();
        wire::decode(&frame).unwrap()
    }

    fn generate(job_id: JobId) -> Request {
        Request::Generate(GenerateRequest::new(job_id, &JobRequest::new("torch")))
    }

    #[tokio::test]
    async fn test_ping() {
        let mut client = start(None);
        send(&mut client, &Request::Ping).await;
        assert_eq!(recv(&mut client).await, Response::Pong);
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let (mut client, worker) = start_with_worker(None);
        let id = JobId::new();
        send(&mut client, &generate(id)).await;

        assert!(matches!(recv(&mut client).await, Response::Accepted(a) if a.job_id == id));
        let mut steps = Vec::new();
        for _ in 0..STAGES.len() {
            match recv(&mut client).await {
                Response::Progress(progress) => steps.push(progress.detail.step),
                other => panic!("expected progress, got {other:?}"),
            }
        }
        assert_eq!(steps, (1..=6).map(Some).collect::<Vec<_>>());
        match recv(&mut client).await {
            Response::Complete(done) => assert_eq!(done.output_path, format!("outputs/{id}.png")),
            other => panic!("expected completion, got {other:?}"),
        }

        // the final status is served once, then the job is forgotten
        send(&mut client, &Request::status(id)).await;
        assert!(matches!(recv(&mut client).await, Response::Complete(_)));
        assert_eq!(worker.len(), 0);
        send(&mut client, &Request::status(id)).await;
        assert!(matches!(recv(&mut client).await, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_running_job_is_kept_on_status() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let settings = Settings {
            step: Duration::from_secs(60),
            fail_every: None,
        };
        let worker = Arc::new(Worker::default());
        tokio::spawn(serve(server, Arc::clone(&worker), settings));
        let mut client = Framed::new(client, LengthDelimitedCodec::new());

        let id = JobId::new();
        send(&mut client, &generate(id)).await;
        assert!(matches!(recv(&mut client).await, Response::Accepted(_)));

        send(&mut client, &Request::status(id)).await;
        assert!(matches!(recv(&mut client).await, Response::Accepted(_)));
        assert_eq!(worker.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_every() {
        let mut client = start(Some(1));
        let id = JobId::new();
        send(&mut client, &generate(id)).await;

        loop {
            match recv(&mut client).await {
                Response::Failed(failed) => {
                    assert_eq!(failed.job_id, id);
                    break;
                }
                Response::Complete(_) => panic!("job should have failed"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_job_status_is_an_error() {
        let mut client = start(None);
        send(&mut client, &Request::status(JobId::new())).await;
        assert!(matches!(recv(&mut client).await, Response::Error(_)));
    }
}
