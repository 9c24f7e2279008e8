//! Ping command handler

use std::time::{Duration, Instant};

use anyhow::Result;
use colored::*;
use kiln_client::TcpConnection;

use crate::config::Config;

/// Connects, pings once, and reports the round trip
pub async fn run(config: &Config, timeout_ms: u64) -> Result<()> {
    let timeout = Duration::from_millis(timeout_ms);
    let addr = &config.engine.backend_addr;
    let (_connection, handle) = TcpConnection::start(config.engine.connection_config())?;

    if !handle.wait_connected(timeout).await {
        handle.shutdown();
        println!("{} {} is not reachable", "✗".red(), addr);
        anyhow::bail!("backend {addr} did not accept a connection within {timeout_ms} ms");
    }

    let started = Instant::now();
    let alive = handle.ping(timeout).await;
    let elapsed = started.elapsed();
    handle.shutdown();

    if !alive {
        println!("{} {} connected but did not answer", "✗".red(), addr);
        anyhow::bail!("no pong from {addr} within {timeout_ms} ms");
    }

    println!(
        "{} {} answered in {:.1} ms",
        "✓".green(),
        addr,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}
