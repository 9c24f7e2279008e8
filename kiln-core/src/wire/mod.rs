//! Wire protocol
//!
//! Two disjoint message families travel between the front end and the
//! generation backend:
//! - [`Request`]: front end → backend
//! - [`Response`]: backend → front end
//!
//! Every message that creates or affects a job carries the client-minted
//! [`JobId`]. Encoding lives in [`codec`].

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::domain::batch::BatchId;
use crate::domain::job::{GenerationStage, JobId, ProgressDetail};
use crate::domain::request::{GenerationParams, JobRequest};

pub use codec::{ProtocolError, WireMessage, decode, encode};

/// Current protocol version, written as the first byte of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Default backend endpoint
pub const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:5555";

// =============================================================================
// Requests (front end → backend)
// =============================================================================

/// Request message sent to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Generate(GenerateRequest),
    GenerateBatch(GenerateBatchRequest),
    Cancel(JobRef),
    Status(JobRef),
    Ping,
}

impl Request {
    pub fn cancel(job_id: JobId) -> Self {
        Self::Cancel(JobRef { job_id })
    }

    pub fn status(job_id: JobId) -> Self {
        Self::Status(JobRef { job_id })
    }

    /// Short name of the variant for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generate(_) => "generate",
            Self::GenerateBatch(_) => "generate_batch",
            Self::Cancel(_) => "cancel",
            Self::Status(_) => "status",
            Self::Ping => "ping",
        }
    }
}

/// Generate a single image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerateRequest {
    pub fn new(job_id: JobId, request: &JobRequest) -> Self {
        Self {
            job_id,
            prompt: request.prompt.clone(),
            params: request.params.clone(),
        }
    }
}

/// Generate several images sharing the same parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateBatchRequest {
    pub batch_id: BatchId,
    pub name: String,
    pub params: GenerationParams,
    pub entries: Vec<BatchEntry>,
}

/// One prompt of a batch, with the id the client minted for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub job_id: JobId,
    pub prompt: String,
}

/// Reference to an existing job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: JobId,
}

// =============================================================================
// Responses (backend → front end)
// =============================================================================

/// Response message received from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Accepted(JobAccepted),
    Progress(JobProgress),
    Complete(JobComplete),
    Failed(JobFailed),
    Cancelled(JobRef),
    Pong,
    /// Protocol-level error, not tied to a job
    Error(BackendError),
}

impl Response {
    pub fn accepted(job_id: JobId) -> Self {
        Self::Accepted(JobAccepted {
            job_id,
            estimated_seconds: None,
        })
    }

    pub fn progress(job_id: JobId, fraction: f32) -> Self {
        Self::Progress(JobProgress {
            job_id,
            fraction,
            stage: None,
            detail: ProgressDetail::default(),
        })
    }

    pub fn complete(job_id: JobId, output_path: impl Into<String>, duration_seconds: f64) -> Self {
        Self::Complete(JobComplete {
            job_id,
            output_path: output_path.into(),
            duration_seconds,
        })
    }

    pub fn failed(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::Failed(JobFailed {
            job_id,
            reason: reason.into(),
        })
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::Cancelled(JobRef { job_id })
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(BackendError {
            reason: reason.into(),
        })
    }

    /// The job this response refers to, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Accepted(r) => Some(r.job_id),
            Self::Progress(r) => Some(r.job_id),
            Self::Complete(r) => Some(r.job_id),
            Self::Failed(r) => Some(r.job_id),
            Self::Cancelled(r) => Some(r.job_id),
            Self::Pong | Self::Error(_) => None,
        }
    }

    /// Short name of the variant for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Failed(_) => "failed",
            Self::Cancelled(_) => "cancelled",
            Self::Pong => "pong",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    #[serde(default)]
    pub estimated_seconds: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub fraction: f32,
    #[serde(default)]
    pub stage: Option<GenerationStage>,
    #[serde(default)]
    pub detail: ProgressDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobComplete {
    pub job_id: JobId,
    pub output_path: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: JobId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendError {
    pub reason: String,
}
