//! Batch domain types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobId, JobStatus};

/// Hard upper bound on the number of requests in one batch
pub const MAX_BATCH_SIZE: usize = 20;

/// Identifier of a client-side batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(JobId);

impl BatchId {
    pub fn new() -> Self {
        Self(JobId::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|uuid| Self(JobId::from(uuid)))
    }
}

/// A named group of jobs submitted together
///
/// Stores only the ordered job ids; status is always read from the
/// correlation table so the batch never holds a stale copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub job_ids: Vec<JobId>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }
}

/// Aggregate counts for a batch, derived live from job statuses
///
/// `Cancelled` jobs count as failed, so the three counts always add up to
/// the batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
}

impl BatchCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> Self {
        statuses
            .into_iter()
            .fold(Self::default(), |mut counts, status| {
                match status {
                    JobStatus::Complete { .. } => counts.successful += 1,
                    JobStatus::Failed { .. } | JobStatus::Cancelled => counts.failed += 1,
                    _ => counts.pending += 1,
                }
                counts
            })
    }

    pub fn total(&self) -> usize {
        self.successful + self.failed + self.pending
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }
}

impl fmt::Display for BatchCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok / {} failed / {} pending",
            self.successful, self.failed, self.pending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_covers_every_status() {
        let statuses = [
            JobStatus::Queued,
            JobStatus::Accepted,
            JobStatus::InProgress { progress: 0.3 },
            JobStatus::Complete {
                output_path: "a.png".to_string(),
                duration_seconds: 2.0,
            },
            JobStatus::no_ack(),
            JobStatus::Cancelled,
        ];

        let counts = BatchCounts::tally(&statuses);
        assert_eq!(counts.successful, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.total(), statuses.len());
        assert!(!counts.is_settled());
    }

    #[test]
    fn test_batch_id_text_form() {
        let id = BatchId::new();
        assert_eq!(id.to_string().parse::<BatchId>().unwrap(), id);
    }
}
