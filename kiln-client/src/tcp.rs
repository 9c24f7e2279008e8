//! TCP transport for the backend session
//!
//! A background Tokio task owns the socket. The front end talks to it through
//! two bounded queues, so [`TcpConnection::send`] and
//! [`TcpConnection::try_recv`] never touch the network themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use kiln_core::wire::{self, ProtocolError, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::connection::{BackendConnection, ConnectionState};
use crate::error::{ConnectionError, Result};
use crate::reconnect::{Connector, ReconnectConfig, TcpConnector, reconnect_loop};

/// How long `send` sleeps between attempts while the outbound queue is full
const FULL_QUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// Transport settings for a [`TcpConnection`]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Backend endpoint, `host:port`
    pub addr: String,
    /// Longest `send` may wait for room in the outbound queue
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    /// A frame that cannot be written within this window drops the session
    pub write_timeout: Duration,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub max_frame_len: usize,
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            send_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            outbound_capacity: 256,
            inbound_capacity: 4096,
            max_frame_len: 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// State shared between the I/O task, the connection and its handles
#[derive(Debug)]
struct Shared {
    state: watch::Sender<ConnectionState>,
    pongs: watch::Sender<u64>,
    malformed: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Connecting),
            pongs: watch::Sender::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
    }
}

/// Front-end side of a TCP backend session
///
/// Dropping it stops the I/O task.
#[derive(Debug)]
pub struct TcpConnection {
    outbound: mpsc::Sender<Request>,
    inbound: mpsc::Receiver<Response>,
    state: watch::Receiver<ConnectionState>,
    send_timeout: Duration,
    cancel: CancellationToken,
}

/// Async-side control of a running session: health checks and shutdown
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Request>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TcpConnection {
    /// Starts a session to `config.addr` on the current Tokio runtime
    pub fn start(config: ConnectionConfig) -> Result<(Self, ConnectionHandle)> {
        let connector = TcpConnector::new(config.addr.clone(), config.connect_timeout);
        Self::start_with(connector, config)
    }

    /// Starts a session over streams produced by `connector`
    pub fn start_with<C: Connector>(
        connector: C,
        config: ConnectionConfig,
    ) -> Result<(Self, ConnectionHandle)> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();

        let connection = Self {
            outbound: outbound_tx.clone(),
            inbound: inbound_rx,
            state: shared.state.subscribe(),
            send_timeout: config.send_timeout,
            cancel: cancel.clone(),
        };
        let handle = ConnectionHandle {
            outbound: outbound_tx,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };

        let io = IoTask {
            config,
            outbound: outbound_rx,
            inbound: inbound_tx,
            shared,
            cancel,
        };
        runtime.spawn(io.run(connector));

        Ok((connection, handle))
    }
}

impl TcpConnection {
    fn ensure_connected(&self) -> Result<()> {
        let state = *self.state.borrow();
        if state.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::unavailable(format!("session is {state}")))
        }
    }
}

impl BackendConnection for TcpConnection {
    fn send(&self, request: Request) -> Result<()> {
        self.ensure_connected()?;

        let deadline = Instant::now() + self.send_timeout;
        let mut request = request;
        loop {
            match self.outbound.try_send(request) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => {
                    return Err(ConnectionError::unavailable("connection task stopped"));
                }
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        return Err(ConnectionError::unavailable("outbound queue full"));
                    }
                    request = returned;
                    std::thread::sleep(FULL_QUEUE_BACKOFF);
                }
            }
        }
    }

    fn try_send(&self, request: Request) -> Result<()> {
        self.ensure_connected()?;

        self.outbound.try_send(request).map_err(|e| match e {
            TrySendError::Closed(_) => ConnectionError::unavailable("connection task stopped"),
            TrySendError::Full(_) => ConnectionError::unavailable("outbound queue full"),
        })
    }

    fn try_recv(&mut self) -> Option<Response> {
        if !self.state.borrow().is_connected() {
            return None;
        }
        self.inbound.try_recv().ok()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Number of inbound frames dropped because they could not be decoded
    pub fn malformed_frames(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Waits until the session is connected, up to `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| s.is_connected() || *s == ConnectionState::Closed),
        )
        .await;

        matches!(reached, Ok(Ok(s)) if s.is_connected())
    }

    /// Sends a ping and waits for the matching pong
    ///
    /// Returns `false` if the session is down or no pong arrives in time.
    pub async fn ping(&self, timeout: Duration) -> bool {
        if !self.state().is_connected() {
            return false;
        }

        let mut pongs = self.shared.pongs.subscribe();
        pongs.borrow_and_update();

        if self.outbound.try_send(Request::Ping).is_err() {
            return false;
        }

        matches!(tokio::time::timeout(timeout, pongs.changed()).await, Ok(Ok(())))
    }

    /// Stops the I/O task and closes the session
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Why a session ended
enum SessionEnd {
    /// The socket failed or the backend closed it
    Lost,
    /// Cancellation fired or the front end went away
    Shutdown,
}

struct IoTask {
    config: ConnectionConfig,
    outbound: mpsc::Receiver<Request>,
    inbound: mpsc::Sender<Response>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl IoTask {
    async fn run<C: Connector>(mut self, connector: C) {
        loop {
            let Some(stream) =
                reconnect_loop(&connector, &self.config.reconnect, &self.cancel).await
            else {
                break;
            };

            // requests queued against the previous session are not replayed
            let mut dropped = 0usize;
            while self.outbound.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(dropped, "Discarded requests queued before reconnect");
            }

            self.shared.set_state(ConnectionState::Connected);

            match self.session(stream).await {
                SessionEnd::Lost => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    tracing::warn!(
                        endpoint = connector.endpoint(),
                        "Backend session lost, reconnecting"
                    );
                }
                SessionEnd::Shutdown => break,
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        tracing::debug!(endpoint = connector.endpoint(), "Connection task stopped");
    }

    async fn session<S>(&mut self, stream: S) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_len)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Shutdown,

                request = self.outbound.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Shutdown;
                    };
                    let kind = request.kind();
                    let payload = match wire::encode(&request) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(kind, error = %e, "Dropping request that failed to encode");
                            continue;
                        }
                    };

                    let write = framed.send(Bytes::from(payload));
                    match tokio::time::timeout(self.config.write_timeout, write).await {
                        Ok(Ok(())) => tracing::trace!(kind, "Request sent"),
                        Ok(Err(e)) => {
                            tracing::warn!(kind, error = %e, "Write failed");
                            return SessionEnd::Lost;
                        }
                        Err(_) => {
                            tracing::warn!(kind, "Write timed out");
                            return SessionEnd::Lost;
                        }
                    }
                }

                frame = framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => {
                            if !self.handle_frame(&bytes).await {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Read failed");
                            return SessionEnd::Lost;
                        }
                        None => {
                            tracing::info!("Backend closed the connection");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Decodes one frame and routes it. Returns `false` once nobody is left
    /// to read responses.
    async fn handle_frame(&self, payload: &[u8]) -> bool {
        let response = match wire::decode::<Response>(payload) {
            Ok(Response::Pong) => {
                self.shared.pongs.send_modify(|count| *count += 1);
                return true;
            }
            Ok(response) => response,
            Err(ProtocolError::UnknownTag(tag)) => {
                tracing::warn!(tag, "Received message with unknown tag");
                Response::error(format!("unknown message tag 0x{tag:02x}"))
            }
            Err(e) => {
                self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, len = payload.len(), "Dropping malformed frame");
                return true;
            }
        };

        self.inbound.send(response).await.is_ok()
    }
}
