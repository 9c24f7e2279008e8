//! Poll adapter
//!
//! Drains the backend connection up to a fixed count per tick. Whatever is
//! left stays queued in the connection for the next tick.

use kiln_client::BackendConnection;
use kiln_core::wire::Response;
use tracing::trace;

/// Bounded, non-blocking drain of a [`BackendConnection`]
#[derive(Debug, Clone, Copy)]
pub struct PollAdapter {
    drain_cap: usize,
}

impl PollAdapter {
    pub fn new(drain_cap: usize) -> Self {
        Self {
            drain_cap: drain_cap.max(1),
        }
    }

    pub fn drain_cap(&self) -> usize {
        self.drain_cap
    }

    /// Hands up to `drain_cap` queued responses to `route`, in delivery
    /// order, and returns how many were drained
    pub fn drain<C: BackendConnection>(
        &self,
        connection: &mut C,
        mut route: impl FnMut(Response),
    ) -> usize {
        let mut drained = 0;
        while drained < self.drain_cap {
            let Some(response) = connection.try_recv() else {
                break;
            };
            route(response);
            drained += 1;
        }

        if drained == self.drain_cap {
            trace!(drained, "Drain cap reached, leaving the rest for the next tick");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use kiln_client::LoopbackConnection;
    use kiln_core::JobId;

    use super::*;

    #[test]
    fn test_drain_respects_cap_and_order() {
        let (mut conn, backend) = LoopbackConnection::pair();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        backend.push_responses(ids.iter().map(|id| Response::accepted(*id)));

        let adapter = PollAdapter::new(3);
        let mut seen = Vec::new();
        let drained = adapter.drain(&mut conn, |r| seen.extend(r.job_id()));

        assert_eq!(drained, 3);
        assert_eq!(seen, ids[..3]);
        assert_eq!(backend.pending_responses(), 2);

        let drained = adapter.drain(&mut conn, |r| seen.extend(r.job_id()));
        assert_eq!(drained, 2);
        assert_eq!(seen, ids);
    }

    #[test]
    fn test_empty_connection_returns_immediately() {
        let (mut conn, _backend) = LoopbackConnection::pair();
        assert_eq!(PollAdapter::new(64).drain(&mut conn, |_| {}), 0);
    }
}
