//! Job domain types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::batch::BatchId;
use super::request::JobRequest;

/// Opaque, globally unique job identifier
///
/// Minted by the client at submission time and sent to the backend, so the
/// backend never has to be the id authority. Travels as hyphenated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    /// Mints a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.hyphenated())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a job
///
/// `Complete`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Accepted,
    InProgress {
        progress: f32,
    },
    Complete {
        output_path: String,
        duration_seconds: f64,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl JobStatus {
    /// Reason recorded when the backend never acknowledged a job
    pub const NO_ACK: &'static str = "no-ack";

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }

    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in the lifecycle graph
    ///
    /// Applied transitions never decrease the rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Accepted => 1,
            Self::InProgress { .. } => 2,
            Self::Complete { .. } | Self::Failed { .. } | Self::Cancelled => 3,
        }
    }

    /// Short lowercase label for display and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Accepted => "accepted",
            Self::InProgress { .. } => "in_progress",
            Self::Complete { .. } => "complete",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn no_ack() -> Self {
        Self::Failed {
            reason: Self::NO_ACK.to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress { progress } => write!(f, "in_progress ({:.0}%)", progress * 100.0),
            Self::Complete {
                output_path,
                duration_seconds,
            } => write!(f, "complete ({output_path}, {duration_seconds:.1}s)"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Stage of the backend generation pipeline reported with progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Initializing,
    LoadingModels,
    Encoding,
    Sampling,
    Decoding,
    PostProcessing,
}

/// Step-level detail reported alongside progress
///
/// Every field is optional on the wire; a backend that reports only a
/// fraction leaves them all unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    /// Remaining time estimate at this step
    #[serde(default)]
    pub eta_seconds: Option<f32>,
    /// Intermediate image written by the backend
    #[serde(default)]
    pub preview_path: Option<String>,
}

impl ProgressDetail {
    pub fn is_empty(&self) -> bool {
        self.step.is_none()
            && self.total_steps.is_none()
            && self.eta_seconds.is_none()
            && self.preview_path.is_none()
    }

    /// Folds a newer report into this one
    ///
    /// Fields the newer report leaves unset keep their value. A report whose
    /// step is behind the recorded step is ignored entirely. Returns whether
    /// anything changed.
    pub fn absorb(&mut self, newer: &ProgressDetail) -> bool {
        let behind = match (self.step, newer.step) {
            (Some(current), Some(step)) => step < current,
            _ => false,
        };
        if behind {
            return false;
        }

        let before = self.clone();
        if newer.step.is_some() {
            self.step = newer.step;
        }
        if newer.total_steps.is_some() {
            self.total_steps = newer.total_steps;
        }
        if let Some(eta) = newer.eta_seconds.filter(|eta| eta.is_finite()) {
            self.eta_seconds = Some(eta);
        }
        if newer.preview_path.is_some() {
            self.preview_path = newer.preview_path.clone();
        }
        *self != before
    }
}

/// Final disposition reported by the backend for a job that was already
/// cancelled locally. Kept for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackendOutcome {
    Completed {
        output_path: String,
        duration_seconds: f64,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// One tracked job
///
/// Owned exclusively by the engine's correlation table; everyone else sees
/// immutable snapshots of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub request: JobRequest,
    pub status: JobStatus,
    pub stage: Option<GenerationStage>,
    pub estimated_seconds: Option<f32>,
    /// Latest step detail, never moving backwards
    #[serde(default)]
    pub detail: ProgressDetail,
    pub backend_outcome: Option<BackendOutcome>,
    pub submitted_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl JobRecord {
    /// Creates a freshly submitted, `Queued` record with no attempts yet
    pub fn new(
        id: JobId,
        request: JobRequest,
        batch_id: Option<BatchId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            batch_id,
            request,
            status: JobStatus::Queued,
            stage: None,
            estimated_seconds: None,
            detail: ProgressDetail::default(),
            backend_outcome: None,
            submitted_at: now,
            last_updated_at: now,
            attempt_count: 0,
        }
    }
}

/// One applied status transition
///
/// `old_status` is `None` for the record created by a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub job_id: JobId,
    pub old_status: Option<JobStatus>,
    pub new_status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn created(job_id: JobId, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id,
            old_status: None,
            new_status: JobStatus::Queued,
            timestamp,
        }
    }

    pub fn transition(
        job_id: JobId,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            old_status: Some(old_status),
            new_status,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_text_form() {
        let id = JobId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<JobId>().unwrap(), id);
        assert!("not-a-job".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let ids: std::collections::HashSet<JobId> = (0..1000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Accepted.is_terminal());
        assert!(!JobStatus::InProgress { progress: 0.9 }.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::no_ack().is_terminal());
        assert!(
            JobStatus::Complete {
                output_path: "a.png".to_string(),
                duration_seconds: 1.0
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_rank_follows_lifecycle() {
        assert!(JobStatus::Queued.rank() < JobStatus::Accepted.rank());
        assert!(JobStatus::Accepted.rank() < JobStatus::InProgress { progress: 0.0 }.rank());
        assert!(JobStatus::InProgress { progress: 1.0 }.rank() < JobStatus::Cancelled.rank());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::InProgress { progress: 0.5 }.to_string(), "in_progress (50%)");
        assert_eq!(JobStatus::no_ack().to_string(), "failed (no-ack)");
        assert_eq!(JobStatus::Queued.to_string(), "queued");
    }

    #[test]
    fn test_progress_detail_never_moves_back() {
        let mut detail = ProgressDetail::default();
        assert!(detail.is_empty());

        assert!(detail.absorb(&ProgressDetail {
            step: Some(10),
            total_steps: Some(30),
            eta_seconds: Some(8.0),
            preview_path: None,
        }));

        // an older step is dropped as a whole
        assert!(!detail.absorb(&ProgressDetail {
            step: Some(4),
            eta_seconds: Some(20.0),
            ..Default::default()
        }));
        assert_eq!(detail.step, Some(10));
        assert_eq!(detail.eta_seconds, Some(8.0));

        // unset fields keep what was there
        assert!(detail.absorb(&ProgressDetail {
            step: Some(12),
            preview_path: Some("previews/12.png".to_string()),
            ..Default::default()
        }));
        assert_eq!(detail.total_steps, Some(30));
        assert_eq!(detail.preview_path.as_deref(), Some("previews/12.png"));

        let same = detail.clone();
        assert!(!detail.absorb(&same));
    }
}
