//! Session behaviour of `TcpConnection` over in-memory duplex streams

use std::io;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use kiln_client::{
    BackendConnection, ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionState,
    Connector, ReconnectConfig, TcpConnection,
};
use kiln_core::JobId;
use kiln_core::wire::{PROTOCOL_VERSION, Request, Response, decode, encode};
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Server = Framed<DuplexStream, LengthDelimitedCodec>;

/// Hands out the streams pushed by the test, one per connect
struct DuplexConnector {
    streams: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.streams
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::other("no more streams"))
    }

    fn endpoint(&self) -> &str {
        "duplex"
    }
}

struct Harness {
    connection: TcpConnection,
    handle: ConnectionHandle,
    streams: mpsc::UnboundedSender<DuplexStream>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(adjust: impl FnOnce(&mut ConnectionConfig)) -> Self {
        let (streams, rx) = mpsc::unbounded_channel();
        let connector = DuplexConnector {
            streams: Mutex::new(rx),
        };
        let mut config = ConnectionConfig::new("duplex");
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        };
        adjust(&mut config);

        let (connection, handle) = TcpConnection::start_with(connector, config).unwrap();
        Self {
            connection,
            handle,
            streams,
        }
    }

    /// Offers a fresh stream to the connector and returns the backend side
    async fn accept(&self) -> Server {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.streams.send(client).unwrap();
        assert!(self.handle.wait_connected(Duration::from_secs(2)).await);
        Framed::new(server, LengthDelimitedCodec::new())
    }

    async fn recv(&mut self) -> Response {
        for _ in 0..400 {
            if let Some(response) = self.connection.try_recv() {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no response within two seconds");
    }

    async fn wait_for_state(&self, expected: ConnectionState) {
        for _ in 0..400 {
            if self.handle.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never became {expected}");
    }
}

async fn reply(server: &mut Server, response: &Response) {
    server
        .send(Bytes::from(encode(response).unwrap()))
        .await
        .unwrap();
}

async fn next_request(server: &mut Server) -> Request {
    let frame = server.next().await.unwrap().unwrap();
    decode(&frame).unwrap()
}

#[tokio::test]
async fn test_requests_and_responses_cross_the_socket() {
    let mut harness = Harness::start();
    let mut server = harness.accept().await;
    let id = JobId::new();

    harness.connection.send(Request::status(id)).unwrap();
    assert_eq!(next_request(&mut server).await, Request::status(id));

    reply(&mut server, &Response::accepted(id)).await;
    reply(&mut server, &Response::progress(id, 0.4)).await;

    assert_eq!(harness.recv().await, Response::accepted(id));
    assert_eq!(harness.recv().await, Response::progress(id, 0.4));
    assert_eq!(harness.connection.try_recv(), None);
}

#[tokio::test]
async fn test_ping_is_answered_without_surfacing_pong() {
    let mut harness = Harness::start();
    let mut server = harness.accept().await;

    let backend = tokio::spawn(async move {
        let request = next_request(&mut server).await;
        assert_eq!(request, Request::Ping);
        reply(&mut server, &Response::Pong).await;
        server
    });

    assert!(harness.handle.ping(Duration::from_secs(2)).await);
    let _server = backend.await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connection.try_recv(), None);
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_and_counted() {
    let mut harness = Harness::start();
    let mut server = harness.accept().await;
    let id = JobId::new();

    server
        .send(Bytes::from_static(&[PROTOCOL_VERSION, 0x83, 0xc1]))
        .await
        .unwrap();
    reply(&mut server, &Response::cancelled(id)).await;

    assert_eq!(harness.recv().await, Response::cancelled(id));
    assert_eq!(harness.handle.malformed_frames(), 1);
    assert!(harness.connection.state().is_connected());
}

#[tokio::test]
async fn test_unknown_tag_surfaces_as_error_response() {
    let mut harness = Harness::start();
    let mut server = harness.accept().await;

    server
        .send(Bytes::from_static(&[PROTOCOL_VERSION, 0x7f]))
        .await
        .unwrap();

    assert_matches!(harness.recv().await, Response::Error(_));
    assert_eq!(harness.handle.malformed_frames(), 0);
}

#[tokio::test]
async fn test_lost_session_fails_fast_then_recovers() {
    let mut harness = Harness::start();
    let server = harness.accept().await;

    drop(server);
    harness.wait_for_state(ConnectionState::Disconnected).await;

    assert_matches!(
        harness.connection.send(Request::Ping),
        Err(ConnectionError::Unavailable(_))
    );
    assert_eq!(harness.connection.try_recv(), None);
    assert!(!harness.handle.ping(Duration::from_millis(50)).await);

    let mut server = harness.accept().await;
    let id = JobId::new();
    harness.connection.send(Request::cancel(id)).unwrap();
    assert_eq!(next_request(&mut server).await, Request::cancel(id));
}

#[tokio::test]
async fn test_shutdown_closes_the_session() {
    let harness = Harness::start();
    let _server = harness.accept().await;

    harness.handle.shutdown();
    harness.wait_for_state(ConnectionState::Closed).await;
    assert!(!harness.handle.wait_connected(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_full_queue_bounds_the_send_wait() {
    let send_timeout = Duration::from_millis(50);
    let harness = Harness::start_with(|config| {
        config.outbound_capacity = 1;
        config.send_timeout = send_timeout;
    });
    // the backend never reads
    let _server = harness.accept().await;

    // nothing below yields, so the I/O task cannot drain the queue
    harness.connection.send(Request::Ping).unwrap();

    let started = Instant::now();
    let result = harness.connection.send(Request::Ping);
    let waited = started.elapsed();
    assert_matches!(result, Err(ConnectionError::Unavailable(_)));
    assert!(waited >= send_timeout, "gave up after {waited:?}");
    assert!(waited < send_timeout * 2, "waited {waited:?}");

    let started = Instant::now();
    let result = harness.connection.try_send(Request::Ping);
    assert_matches!(result, Err(ConnectionError::Unavailable(_)));
    assert!(started.elapsed() < Duration::from_millis(5));
}

#[test]
fn test_start_requires_a_runtime() {
    let result = TcpConnection::start(ConnectionConfig::new("127.0.0.1:5555"));
    assert_matches!(result, Err(ConnectionError::NoRuntime));
}
