//! Kiln Engine
//!
//! Tracks generation jobs from submission to a terminal outcome without ever
//! blocking the caller's frame loop.
//!
//! Layers:
//! - [`table`]: the correlation table, sole owner of every [`JobRecord`]
//! - [`lifecycle`]: the per-job state machine applied to backend responses
//! - [`retry`]: submission-ack deadlines and the resubmit budget
//! - [`scheduler`]: the per-tick drain and the fixed-cadence frame ticker
//! - [`dispatcher`]: the [`JobDispatcher`] facade the front end talks to
//!
//! [`JobRecord`]: kiln_core::JobRecord

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;
pub mod table;

use anyhow::Context;
use kiln_client::{ConnectionHandle, TcpConnection};

pub use config::Config;
pub use dispatcher::{DispatcherStats, JobDispatcher};
pub use error::{DispatchError, ErrorKind, LifecycleError};
pub use lifecycle::{JobEvent, LifecycleEngine, Transition};
pub use table::{CorrelationTable, SnapshotReader, TableSnapshot};

/// Starts a TCP session to `config.backend_addr` and wraps it in a dispatcher
///
/// Must be called from within a Tokio runtime; the returned handle drives
/// health checks and shutdown from async code.
pub fn connect(config: Config) -> anyhow::Result<(JobDispatcher<TcpConnection>, ConnectionHandle)> {
    config.validate()?;

    let (connection, handle) = TcpConnection::start(config.connection_config())
        .context("Failed to start backend connection")?;

    Ok((JobDispatcher::new(config, connection), handle))
}
