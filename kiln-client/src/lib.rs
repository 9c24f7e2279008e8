//! Kiln Backend Connection
//!
//! Owns the session to the generation backend and hides every network wait
//! from the caller. The front end only ever sees two non-blocking calls:
//! [`BackendConnection::send`] and [`BackendConnection::try_recv`].
//!
//! Implementations:
//! - [`TcpConnection`]: length-prefixed frames over TCP, driven by a Tokio
//!   I/O task that reconnects with capped exponential backoff
//! - [`LoopbackConnection`]: in-memory double for tests and simulations
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::{BackendConnection, ConnectionConfig, TcpConnection};
//! use kiln_core::wire::Request;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut connection, handle) = TcpConnection::start(ConnectionConfig::new("127.0.0.1:5555"))?;
//!
//!     if handle.wait_connected(Duration::from_secs(2)).await {
//!         connection.send(Request::Ping)?;
//!     }
//!
//!     while let Some(response) = connection.try_recv() {
//!         println!("{response:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod connection;
pub mod error;
mod loopback;
pub mod reconnect;
mod tcp;

pub use connection::{BackendConnection, ConnectionState};
pub use error::{ConnectionError, Result};
pub use loopback::{LoopbackBackend, LoopbackConnection};
pub use reconnect::{Connector, ReconnectConfig, TcpConnector};
pub use tcp::{ConnectionConfig, ConnectionHandle, TcpConnection};
