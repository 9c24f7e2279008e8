//! Submission-ack deadlines
//!
//! Every dispatch arms a deadline. Deadlines are never removed eagerly:
//! when one expires the dispatcher checks whether the job is still `Queued`
//! and ignores it otherwise.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use kiln_core::JobId;

/// What to do with a job whose ack deadline passed while still queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again under the same id
    Resubmit,
    /// Attempts exhausted; fail the job
    GiveUp,
}

impl RetryDecision {
    pub fn for_attempt(attempt_count: u32, max_attempts: u32) -> Self {
        if attempt_count < max_attempts {
            Self::Resubmit
        } else {
            Self::GiveUp
        }
    }
}

/// Min-heap of pending ack deadlines
#[derive(Debug, Default)]
pub struct AckTracker {
    deadlines: BinaryHeap<Reverse<(Instant, JobId)>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, job_id: JobId, deadline: Instant) {
        self.deadlines.push(Reverse((deadline, job_id)));
    }

    /// Removes and returns every job whose deadline is at or before `now`,
    /// earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<JobId> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, job_id))) = self.deadlines.pop() {
                expired.push(job_id);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_decision() {
        assert_eq!(RetryDecision::for_attempt(1, 2), RetryDecision::Resubmit);
        assert_eq!(RetryDecision::for_attempt(2, 2), RetryDecision::GiveUp);
        assert_eq!(RetryDecision::for_attempt(1, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let start = Instant::now();
        let mut tracker = AckTracker::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());

        tracker.arm(a, start + Duration::from_secs(3));
        tracker.arm(b, start + Duration::from_secs(1));
        tracker.arm(c, start + Duration::from_secs(10));

        assert!(tracker.expired(start).is_empty());
        assert_eq!(tracker.expired(start + Duration::from_secs(5)), vec![b, a]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.expired(start + Duration::from_secs(10)), vec![c]);
        assert!(tracker.is_empty());
    }
}
