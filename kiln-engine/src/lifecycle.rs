//! Job lifecycle state machine
//!
//! ```text
//! Queued ──Accepted──▶ Accepted ──Progress──▶ InProgress(f) ──Progress f'>f──▶ InProgress(f')
//!    │                    │                        │
//!    └────────────────────┴── Complete / Failed / Cancel ──▶ terminal
//! ```
//!
//! [`advance`] is the pure rule set. [`LifecycleEngine`] applies it to the
//! correlation table, turning every applied transition into a
//! [`ChangeRecord`] and counting everything it refuses.

use chrono::{DateTime, Utc};
use kiln_core::wire::{ProtocolError, Response};
use kiln_core::{BackendOutcome, ChangeRecord, GenerationStage, JobId, JobStatus, ProgressDetail};
use tracing::{debug, info, warn};

use crate::dispatcher::DispatcherStats;
use crate::error::LifecycleError;
use crate::table::CorrelationTable;

/// Something that happened to a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Accepted {
        estimated_seconds: Option<f32>,
    },
    Progress {
        fraction: f32,
        stage: Option<GenerationStage>,
        detail: ProgressDetail,
    },
    Completed {
        output_path: String,
        duration_seconds: f64,
    },
    Failed {
        reason: String,
    },
    /// The backend reports the job cancelled
    CancelledByBackend,
    /// The front end asked for cancellation
    CancelRequested,
    /// No acknowledgement arrived and the resubmit budget is spent
    AckTimeout,
}

impl JobEvent {
    /// Splits a job-scoped response into its id and event
    ///
    /// Returns `None` for `Pong` and `Error`, which concern no job.
    pub fn from_response(response: Response) -> Option<(JobId, JobEvent)> {
        let pair = match response {
            Response::Accepted(r) => (
                r.job_id,
                JobEvent::Accepted {
                    estimated_seconds: r.estimated_seconds,
                },
            ),
            Response::Progress(r) => (
                r.job_id,
                JobEvent::Progress {
                    fraction: r.fraction,
                    stage: r.stage,
                    detail: r.detail,
                },
            ),
            Response::Complete(r) => (
                r.job_id,
                JobEvent::Completed {
                    output_path: r.output_path,
                    duration_seconds: r.duration_seconds,
                },
            ),
            Response::Failed(r) => (r.job_id, JobEvent::Failed { reason: r.reason }),
            Response::Cancelled(r) => (r.job_id, JobEvent::CancelledByBackend),
            Response::Pong | Response::Error(_) => return None,
        };
        Some(pair)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::CancelledByBackend => "cancelled_by_backend",
            Self::CancelRequested => "cancel_requested",
            Self::AckTimeout => "ack_timeout",
        }
    }

    /// The backend's final word on a job, if this event is one
    fn backend_outcome(&self) -> Option<BackendOutcome> {
        match self {
            Self::Completed {
                output_path,
                duration_seconds,
            } => Some(BackendOutcome::Completed {
                output_path: output_path.clone(),
                duration_seconds: *duration_seconds,
            }),
            Self::Failed { reason } => Some(BackendOutcome::Failed {
                reason: reason.clone(),
            }),
            Self::CancelledByBackend => Some(BackendOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Verdict of [`advance`]
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Status moves forward to the contained value
    Advance(JobStatus),
    /// Event restates the current status
    Duplicate,
    /// Progress at or below the current fraction
    Clamped,
    /// Job is terminal; event discarded
    Stale,
    /// Backend disposition for a job the front end already cancelled
    Audit(BackendOutcome),
    Illegal(LifecycleError),
}

/// Decides what `event` does to a job currently in `current`
///
/// Never returns a status of lower rank than `current`.
pub fn advance(current: &JobStatus, event: &JobEvent) -> Transition {
    if current.is_terminal() {
        return match (current, event.backend_outcome()) {
            (JobStatus::Cancelled, Some(outcome)) => Transition::Audit(outcome),
            _ => Transition::Stale,
        };
    }

    match event {
        JobEvent::Accepted { .. } => match current {
            JobStatus::Queued => Transition::Advance(JobStatus::Accepted),
            JobStatus::Accepted => Transition::Duplicate,
            _ => Transition::Illegal(LifecycleError::IllegalTransition {
                from: current.label(),
                to: JobStatus::Accepted.label(),
            }),
        },
        JobEvent::Progress { fraction, .. } if !fraction.is_finite() => {
            Transition::Illegal(LifecycleError::NonFiniteProgress)
        }
        JobEvent::Progress { fraction, .. } => {
            let fraction = fraction.clamp(0.0, 1.0);
            match current {
                JobStatus::InProgress { progress } if fraction <= *progress => Transition::Clamped,
                _ => Transition::Advance(JobStatus::InProgress { progress: fraction }),
            }
        }
        JobEvent::Completed {
            output_path,
            duration_seconds,
        } => Transition::Advance(JobStatus::Complete {
            output_path: output_path.clone(),
            duration_seconds: *duration_seconds,
        }),
        JobEvent::Failed { reason } => Transition::Advance(JobStatus::Failed {
            reason: reason.clone(),
        }),
        JobEvent::CancelledByBackend | JobEvent::CancelRequested => {
            Transition::Advance(JobStatus::Cancelled)
        }
        JobEvent::AckTimeout => match current {
            JobStatus::Queued => Transition::Advance(JobStatus::no_ack()),
            _ => Transition::Stale,
        },
    }
}

/// Applies events to the correlation table
#[derive(Debug, Default)]
pub struct LifecycleEngine {
    stats: DispatcherStats,
}

impl LifecycleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut DispatcherStats {
        &mut self.stats
    }

    /// Routes one backend response
    ///
    /// Returns the change record if the response moved a job forward.
    pub fn apply_response(
        &mut self,
        table: &mut CorrelationTable,
        response: Response,
        now: DateTime<Utc>,
    ) -> Option<ChangeRecord> {
        let kind = response.kind();

        if let Response::Error(error) = &response {
            self.stats.protocol_errors += 1;
            warn!(reason = %error.reason, "Backend reported an error");
            return None;
        }

        let Some((job_id, event)) = JobEvent::from_response(response) else {
            debug!(kind, "Ignoring response that concerns no job");
            return None;
        };

        if matches!(event, JobEvent::Progress { fraction, .. } if !fraction.is_finite()) {
            self.stats.malformed += 1;
            let error = ProtocolError::malformed("progress fraction is not a finite number");
            warn!(job_id = %job_id, error = %error, "Dropping response");
            return None;
        }

        if !table.contains(&job_id) {
            self.stats.unknown_job += 1;
            let error = ProtocolError::malformed(format!("{kind} for unknown job"));
            warn!(job_id = %job_id, error = %error, "Dropping response");
            return None;
        }

        self.apply_event(table, job_id, event, now)
    }

    /// Applies one event to a tracked job
    pub fn apply_event(
        &mut self,
        table: &mut CorrelationTable,
        job_id: JobId,
        event: JobEvent,
        now: DateTime<Utc>,
    ) -> Option<ChangeRecord> {
        let Some(record) = table.get(&job_id) else {
            self.stats.unknown_job += 1;
            warn!(job_id = %job_id, event = event.label(), "Event for unknown job");
            return None;
        };

        match advance(&record.status, &event) {
            Transition::Advance(new_status) => {
                let (old_status, new_status) = table.update(&job_id, |record| {
                    match &event {
                        JobEvent::Accepted { estimated_seconds } => {
                            record.estimated_seconds = *estimated_seconds;
                        }
                        JobEvent::Progress { stage, detail, .. } => {
                            if stage.is_some() {
                                record.stage = *stage;
                            }
                            record.detail.absorb(detail);
                        }
                        _ => {}
                    }
                    record.last_updated_at = now;
                    let old = std::mem::replace(&mut record.status, new_status);
                    (old, record.status.clone())
                })?;

                self.stats.applied += 1;
                debug!(
                    job_id = %job_id,
                    from = old_status.label(),
                    to = new_status.label(),
                    "Job status changed"
                );
                Some(ChangeRecord::transition(job_id, old_status, new_status, now))
            }
            Transition::Duplicate => {
                self.stats.duplicate += 1;
                debug!(job_id = %job_id, event = event.label(), "Duplicate event ignored");
                None
            }
            Transition::Clamped => {
                self.stats.clamped += 1;
                let restated = match (&record.status, &event) {
                    (JobStatus::InProgress { progress }, JobEvent::Progress { fraction, .. }) => {
                        fraction.clamp(0.0, 1.0) == *progress
                    }
                    _ => false,
                };
                if !restated {
                    debug!(job_id = %job_id, "Regressing progress clamped");
                    return None;
                }

                // same fraction, possibly newer step detail
                if let JobEvent::Progress { stage, detail, .. } = &event {
                    table.update(&job_id, |record| {
                        let stage_changed = stage.is_some() && record.stage != *stage;
                        if stage_changed {
                            record.stage = *stage;
                        }
                        if record.detail.absorb(detail) || stage_changed {
                            record.last_updated_at = now;
                        }
                    });
                }
                None
            }
            Transition::Stale => {
                self.stats.stale += 1;
                debug!(
                    job_id = %job_id,
                    status = record.status.label(),
                    event = event.label(),
                    "Stale event discarded"
                );
                None
            }
            Transition::Audit(outcome) => {
                if record.backend_outcome.is_some() {
                    self.stats.stale += 1;
                    debug!(job_id = %job_id, "Backend outcome already recorded");
                    return None;
                }
                info!(
                    job_id = %job_id,
                    outcome = ?outcome,
                    "Recorded backend outcome for cancelled job"
                );
                table.update(&job_id, |record| {
                    record.backend_outcome = Some(outcome);
                    record.last_updated_at = now;
                });
                self.stats.audited += 1;
                None
            }
            Transition::Illegal(error) => {
                self.stats.illegal += 1;
                warn!(job_id = %job_id, error = %error, "Rejected transition");
                None
            }
        }
    }
}
