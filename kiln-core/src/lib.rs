//! Kiln Core
//!
//! Core types and the wire contract for the Kiln job dispatch system.
//!
//! This crate contains:
//! - Domain types: jobs, generation requests, batches and change records
//! - Wire: request/response messages and their versioned binary encoding
//!
//! Note: I/O lives in `kiln-client`, state tracking in `kiln-engine`.

pub mod domain;
pub mod wire;

pub use domain::batch::{Batch, BatchCounts, BatchId, MAX_BATCH_SIZE};
pub use domain::job::{
    BackendOutcome, ChangeRecord, GenerationStage, JobId, JobRecord, JobStatus, ProgressDetail,
};
pub use domain::request::{GenerationParams, JobRequest, Resolution, Style, ValidationError};
