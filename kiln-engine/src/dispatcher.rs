//! Job dispatcher
//!
//! The facade the front end talks to. Every method returns without waiting
//! on the backend; `send` may wait briefly for local queue room and nothing
//! else.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kiln_client::{BackendConnection, ConnectionState};
use kiln_core::wire::{BatchEntry, GenerateBatchRequest, GenerateRequest, Request};
use kiln_core::{Batch, BatchId, ChangeRecord, JobId, JobRecord, JobRequest, JobStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DispatchError;
use crate::lifecycle::{JobEvent, LifecycleEngine};
use crate::retry::{AckTracker, RetryDecision};
use crate::scheduler::PollAdapter;
use crate::table::{CorrelationTable, SnapshotReader, TableSnapshot};

/// Running counters of everything the dispatcher applied or refused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Status transitions applied
    pub applied: u64,
    /// Responses for terminal jobs
    pub stale: u64,
    /// Responses restating the current status
    pub duplicate: u64,
    /// Progress at or below the current fraction
    pub clamped: u64,
    /// Responses that would move a job backwards
    pub illegal: u64,
    pub unknown_job: u64,
    pub malformed: u64,
    /// `Error` responses from the backend
    pub protocol_errors: u64,
    /// Backend outcomes recorded for locally cancelled jobs
    pub audited: u64,
    pub resubmitted: u64,
    /// Jobs failed with "no-ack"
    pub timed_out: u64,
}

/// Submits jobs, tracks them, and reconciles backend responses once per tick
///
/// Sends made from `poll_tick` never wait for queue room: a full queue
/// fails the attempt and the job is retried by a later tick.
pub struct JobDispatcher<C: BackendConnection> {
    config: Config,
    connection: C,
    table: CorrelationTable,
    engine: LifecycleEngine,
    acks: AckTracker,
    poller: PollAdapter,
    changes: Vec<ChangeRecord>,
    last_state: ConnectionState,
    /// Status requests owed after a reconnect, sent as queue room allows
    resync_queue: VecDeque<JobId>,
}

impl<C: BackendConnection> JobDispatcher<C> {
    pub fn new(config: Config, connection: C) -> Self {
        let last_state = connection.state();
        let poller = PollAdapter::new(config.drain_cap);
        Self {
            config,
            connection,
            table: CorrelationTable::new(),
            engine: LifecycleEngine::new(),
            acks: AckTracker::new(),
            poller,
            changes: Vec::new(),
            last_state,
            resync_queue: VecDeque::new(),
        }
    }

    /// Validates and submits one request
    ///
    /// The job is tracked as `Queued` even if the backend is unreachable;
    /// the ack timeout takes care of it from there.
    pub fn submit(&mut self, request: JobRequest) -> Result<JobId, DispatchError> {
        request.validate()?;

        let job_id = JobId::new();
        let now = Utc::now();
        self.table.insert(JobRecord::new(job_id, request, None, now));
        self.changes.push(ChangeRecord::created(job_id, now));

        self.dispatch_one(job_id, Instant::now());
        self.table.publish();

        info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Validates and submits a named batch of requests
    ///
    /// Either every request becomes a job or none does. Requests sharing
    /// identical parameters travel as one `GenerateBatch` message.
    pub fn submit_batch(
        &mut self,
        name: impl Into<String>,
        requests: Vec<JobRequest>,
    ) -> Result<BatchId, DispatchError> {
        if requests.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        if requests.len() > self.config.max_batch_size {
            return Err(DispatchError::BatchTooLarge {
                count: requests.len(),
                max: self.config.max_batch_size,
            });
        }
        for (index, request) in requests.iter().enumerate() {
            request
                .validate()
                .map_err(|source| DispatchError::InvalidBatchEntry { index, source })?;
        }

        let batch_id = BatchId::new();
        let now = Utc::now();
        let records: Vec<JobRecord> = requests
            .into_iter()
            .map(|request| JobRecord::new(JobId::new(), request, Some(batch_id), now))
            .collect();
        let job_ids: Vec<JobId> = records.iter().map(|record| record.id).collect();
        let batch = Batch {
            id: batch_id,
            name: name.into(),
            job_ids: job_ids.clone(),
            created_at: now,
        };

        self.table.insert_batch(batch, records);
        self.changes
            .extend(job_ids.iter().map(|id| ChangeRecord::created(*id, now)));

        self.dispatch_batch(batch_id, &job_ids, Instant::now());
        self.table.publish();

        info!(batch_id = %batch_id, jobs = job_ids.len(), "Batch submitted");
        Ok(batch_id)
    }

    /// Cancels a job
    ///
    /// The local record turns `Cancelled` immediately and a best-effort
    /// `Cancel` goes to the backend. Returns `false` if the job had already
    /// reached a terminal state.
    pub fn cancel(&mut self, job_id: JobId) -> Result<bool, DispatchError> {
        let record = self
            .table
            .get(&job_id)
            .ok_or(DispatchError::UnknownJob(job_id))?;
        if record.status.is_terminal() {
            debug!(job_id = %job_id, status = record.status.label(), "Cancel of finished job ignored");
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(change) =
            self.engine
                .apply_event(&mut self.table, job_id, JobEvent::CancelRequested, now)
        {
            self.changes.push(change);
        }

        if let Err(e) = self.connection.send(Request::cancel(job_id)) {
            warn!(job_id = %job_id, error = %e, "Cancel request not delivered");
        }
        self.table.publish();

        info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Asks the backend to re-report a job's status
    pub fn request_status(&self, job_id: JobId) -> Result<(), DispatchError> {
        if !self.table.contains(&job_id) {
            return Err(DispatchError::UnknownJob(job_id));
        }
        self.connection.send(Request::status(job_id))?;
        Ok(())
    }

    /// Runs one tick at the current instant
    pub fn poll_tick(&mut self) -> Vec<ChangeRecord> {
        self.poll_tick_at(Instant::now())
    }

    /// Runs one tick as if the clock read `now`
    ///
    /// Drains at most `drain_cap` responses, expires ack deadlines, and
    /// returns every change record produced since the previous tick.
    pub fn poll_tick_at(&mut self, now: Instant) -> Vec<ChangeRecord> {
        let at = Utc::now();
        self.observe_connection();

        let engine = &mut self.engine;
        let table = &mut self.table;
        let changes = &mut self.changes;
        let drained = self.poller.drain(&mut self.connection, |response| {
            if let Some(change) = engine.apply_response(table, response, at) {
                changes.push(change);
            }
        });

        self.expire_acks(now);
        self.flush_resync();

        if self.table.is_dirty() {
            self.table.publish();
        }

        let changes = std::mem::take(&mut self.changes);
        if drained > 0 || !changes.is_empty() {
            debug!(drained, changes = changes.len(), "Tick processed");
        }
        changes
    }

    /// Latest published view of every job
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.table.snapshot()
    }

    /// Snapshot access for other threads
    pub fn reader(&self) -> SnapshotReader {
        self.table.reader()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.engine.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Sends `Generate` for one tracked job and arms its ack deadline
    fn dispatch_one(&mut self, job_id: JobId, now: Instant) {
        if let Some(request) = self.generate(job_id, now) {
            self.send_logged(job_id, request);
        }
    }

    /// Counts an attempt and builds the `Generate` request for it
    fn generate(&mut self, job_id: JobId, now: Instant) -> Option<Request> {
        let request = self.prepare(job_id, now)?;
        Some(Request::Generate(GenerateRequest::new(job_id, &request)))
    }

    fn dispatch_batch(&mut self, batch_id: BatchId, job_ids: &[JobId], now: Instant) {
        let requests: Vec<(JobId, JobRequest)> = job_ids
            .iter()
            .filter_map(|id| self.prepare(*id, now).map(|request| (*id, request)))
            .collect();

        let shared_params = requests
            .windows(2)
            .all(|pair| pair[0].1.params == pair[1].1.params);

        match requests.first() {
            Some((_, first)) if shared_params => {
                let message = Request::GenerateBatch(GenerateBatchRequest {
                    batch_id,
                    name: self
                        .table
                        .batch(&batch_id)
                        .map(|batch| batch.name.clone())
                        .unwrap_or_default(),
                    params: first.params.clone(),
                    entries: requests
                        .iter()
                        .map(|(job_id, request)| BatchEntry {
                            job_id: *job_id,
                            prompt: request.prompt.clone(),
                        })
                        .collect(),
                });
                if let Err(e) = self.connection.send(message) {
                    warn!(batch_id = %batch_id, error = %e, "Batch request not delivered");
                }
            }
            Some(_) => {
                debug!(batch_id = %batch_id, "Mixed parameters, sending jobs individually");
                for (job_id, request) in &requests {
                    let message = Request::Generate(GenerateRequest::new(*job_id, request));
                    self.send_logged(*job_id, message);
                }
            }
            None => {}
        }
    }

    /// Counts a dispatch attempt and arms the ack deadline
    ///
    /// The attempt counts whether or not the send that follows succeeds.
    fn prepare(&mut self, job_id: JobId, now: Instant) -> Option<JobRequest> {
        let request = self.table.update(&job_id, |record| {
            record.attempt_count += 1;
            record.request.clone()
        })?;
        self.acks.arm(job_id, now + self.config.submit_timeout);
        Some(request)
    }

    fn send_logged(&self, job_id: JobId, request: Request) {
        let kind = request.kind();
        if let Err(e) = self.connection.send(request) {
            warn!(job_id = %job_id, kind, error = %e, "Request not delivered");
        }
    }

    /// Tick-path send: never waits for queue room
    fn offer(&self, job_id: JobId, request: Request) -> bool {
        let kind = request.kind();
        match self.connection.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                debug!(job_id = %job_id, kind, error = %e, "Request not queued");
                false
            }
        }
    }

    fn expire_acks(&mut self, now: Instant) {
        let at = Utc::now();
        for job_id in self.acks.expired(now) {
            let Some(record) = self.table.get(&job_id) else {
                continue;
            };
            if record.status != JobStatus::Queued {
                continue;
            }

            match RetryDecision::for_attempt(record.attempt_count, self.config.max_attempts) {
                RetryDecision::Resubmit => {
                    info!(job_id = %job_id, attempt = record.attempt_count + 1, "No ack yet, resubmitting");
                    self.engine.stats_mut().resubmitted += 1;
                    // a full queue spends the attempt; the re-armed deadline retries it
                    if let Some(request) = self.generate(job_id, now) {
                        self.offer(job_id, request);
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(job_id = %job_id, attempts = record.attempt_count, "No ack received, giving up");
                    self.engine.stats_mut().timed_out += 1;
                    if let Some(change) =
                        self.engine
                            .apply_event(&mut self.table, job_id, JobEvent::AckTimeout, at)
                    {
                        self.changes.push(change);
                    }
                }
            }
        }
    }

    /// Tracks connection state and resynchronises after a reconnect
    fn observe_connection(&mut self) {
        let state = self.connection.state();
        if state == self.last_state {
            return;
        }

        info!(from = %self.last_state, to = %state, "Backend connection state changed");
        let recovered = state.is_connected() && self.last_state == ConnectionState::Disconnected;
        self.last_state = state;

        if recovered {
            self.resync();
        }
    }

    /// Queues a status request for every acknowledged, unfinished job
    fn resync(&mut self) {
        let ids = self.table.ids_where(|status| {
            matches!(status, JobStatus::Accepted | JobStatus::InProgress { .. })
        });
        if !ids.is_empty() {
            info!(jobs = ids.len(), "Requesting status after reconnect");
        }
        self.resync_queue = ids.into();
    }

    /// Sends owed status requests until the queue refuses one
    fn flush_resync(&mut self) {
        if !self.connection.state().is_connected() {
            return;
        }
        while let Some(job_id) = self.resync_queue.front().copied() {
            let still_active = self
                .table
                .get(&job_id)
                .is_some_and(|record| !record.status.is_terminal());
            if still_active && !self.offer(job_id, Request::status(job_id)) {
                return;
            }
            self.resync_queue.pop_front();
        }
    }
}
