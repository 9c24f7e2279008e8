//! Exponential-backoff reconnection to the backend
//!
//! When the session drops, the I/O task calls [`reconnect_loop`] to keep
//! retrying with increasing delays until either a stream is established or
//! the [`CancellationToken`] fires. None of this runs on the tick path.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Establishes the byte stream a session runs over
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new stream to the backend
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human readable endpoint for logs
    fn endpoint(&self) -> &str;
}

/// Plain TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}

/// Tunable parameters for the exponential-backoff strategy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Attempt to (re)connect with exponential backoff.
///
/// Returns `Some(stream)` once a connection succeeds, or `None` if `cancel`
/// fires first.
pub async fn reconnect_loop<C: Connector>(
    connector: &C,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<C::Stream> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(endpoint = connector.endpoint(), "Reconnect cancelled");
                return None;
            }
            result = connector.connect() => {
                match result {
                    Ok(stream) => {
                        tracing::info!(
                            endpoint = connector.endpoint(),
                            attempt,
                            "Connected to backend",
                        );
                        return Some(stream);
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = connector.endpoint(),
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Connect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::io::DuplexStream;

    use super::*;

    /// Refuses the first `failures` attempts, then hands out a duplex stream
    struct FlakyConnector {
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> io::Result<DuplexStream> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, _server) = tokio::io::duplex(64);
            Ok(client)
        }

        fn endpoint(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_millis(250), &config);
        assert_eq!(d, Duration::from_millis(500));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
        assert_eq!(next_delay(Duration::from_secs(10), &config), Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [250, 500, 1000, 2000, 4000, 8000, 10_000, 10_000];

        for &expected_ms in &expected {
            assert_eq!(delay.as_millis() as u64, expected_ms);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn reconnect_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            failures: 3,
            attempts: Arc::clone(&attempts),
        };
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        };
        let cancel = CancellationToken::new();

        let stream = reconnect_loop(&connector, &config, &cancel).await;
        assert!(stream.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let connector = TcpConnector::new("127.0.0.1:9", Duration::from_millis(100));
        let result = reconnect_loop(&connector, &ReconnectConfig::default(), &cancel).await;
        assert!(result.is_none());
    }
}
