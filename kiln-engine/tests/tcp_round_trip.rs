//! End-to-end run over a real TCP socket against a scripted backend

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use kiln_client::{ConnectionConfig, TcpConnection};
use kiln_core::wire::{Request, Response, decode, encode};
use kiln_core::{JobRequest, JobStatus};
use kiln_engine::{Config, JobDispatcher};
use tokio::net::TcpListener;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[tokio::test]
async fn test_job_completes_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let backend = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

        let frame = framed.next().await.unwrap().unwrap();
        let Request::Generate(generate) = decode::<Request>(&frame).unwrap() else {
            panic!("expected a generate request");
        };
        let id = generate.job_id;

        for response in [
            Response::accepted(id),
            Response::progress(id, 0.5),
            Response::complete(id, "outputs/sprite.png", 3.5),
        ] {
            framed
                .send(Bytes::from(encode(&response).unwrap()))
                .await
                .unwrap();
        }

        // keep the session open until the client hangs up
        while framed.next().await.is_some() {}
    });

    let config = Config::new(addr.to_string());
    let (mut dispatcher, handle) = kiln_engine::connect(config).unwrap();
    assert!(handle.wait_connected(Duration::from_secs(5)).await);

    let id = dispatcher.submit(JobRequest::new("wizard hat")).unwrap();

    let mut seen = Vec::new();
    for _ in 0..500 {
        seen.extend(dispatcher.poll_tick().into_iter().map(|c| c.new_status));
        if dispatcher.snapshot()[&id].status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        dispatcher.snapshot()[&id].status,
        JobStatus::Complete {
            output_path: "outputs/sprite.png".to_string(),
            duration_seconds: 3.5,
        }
    );
    assert_eq!(seen.first(), Some(&JobStatus::Queued));
    assert_eq!(seen.len(), 4);

    handle.shutdown();
    drop(dispatcher);
    backend.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_backend_keeps_ticking() {
    // bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (mut dispatcher, handle) = kiln_engine::connect(Config::new(addr.to_string())).unwrap();
    let id = dispatcher.submit(JobRequest::new("stone golem")).unwrap();

    for _ in 0..5 {
        dispatcher.poll_tick();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(dispatcher.snapshot()[&id].status, JobStatus::Queued);
    assert!(!handle.ping(Duration::from_millis(50)).await);
    assert!(!dispatcher.connection_state().is_connected());
}

#[tokio::test]
async fn test_tick_never_waits_on_a_full_queue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accepts, then never reads
    let backend = tokio::spawn(async move { listener.accept().await.unwrap() });

    let send_timeout = Duration::from_millis(50);
    let mut connection_config = ConnectionConfig::new(addr.to_string());
    connection_config.outbound_capacity = 1;
    connection_config.send_timeout = send_timeout;
    let (connection, handle) = TcpConnection::start(connection_config).unwrap();
    assert!(handle.wait_connected(Duration::from_secs(5)).await);
    let _socket = backend.await.unwrap();

    // from here on nothing yields, so the I/O task never drains the queue
    let mut dispatcher = JobDispatcher::new(Config::new(addr.to_string()), connection);
    let start = Instant::now();
    for index in 0..10 {
        dispatcher.submit(JobRequest::new(format!("crate {index}"))).unwrap();
    }

    let tick_started = Instant::now();
    dispatcher.poll_tick_at(start + Duration::from_secs(6));
    let tick = tick_started.elapsed();

    assert!(tick < send_timeout, "tick took {tick:?}");
    assert_eq!(dispatcher.stats().resubmitted, 10);
    assert!(dispatcher.snapshot().iter().all(|job| job.attempt_count == 2));

    handle.shutdown();
}
