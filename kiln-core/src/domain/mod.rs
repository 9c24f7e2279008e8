//! Core domain types
//!
//! These types describe a generation job from submission to its terminal
//! outcome. They are shared between the engine (which owns and mutates
//! records) and the front end (which reads snapshots of them).

pub mod batch;
pub mod job;
pub mod request;
