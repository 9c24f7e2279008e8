//! In-memory backend connection
//!
//! [`LoopbackConnection`] is the front-end half and [`LoopbackBackend`] the
//! scripted backend half. They share one queue pair, so tests and
//! simulations can feed responses in any order and inspect what was sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_core::wire::{Request, Response};

use crate::connection::{BackendConnection, ConnectionState};
use crate::error::{ConnectionError, Result};

#[derive(Debug)]
struct LoopbackState {
    connected: bool,
    /// Most requests `sent` may hold before sends are refused
    capacity: Option<usize>,
    sent: Vec<Request>,
    inbound: VecDeque<Response>,
}

type SharedState = Arc<Mutex<LoopbackState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Front-end half of an in-memory session
#[derive(Debug)]
pub struct LoopbackConnection {
    state: SharedState,
}

/// Backend half of an in-memory session
#[derive(Debug, Clone)]
pub struct LoopbackBackend {
    state: SharedState,
}

impl LoopbackConnection {
    /// Creates a connected pair
    pub fn pair() -> (LoopbackConnection, LoopbackBackend) {
        let state = Arc::new(Mutex::new(LoopbackState {
            connected: true,
            capacity: None,
            sent: Vec::new(),
            inbound: VecDeque::new(),
        }));

        (
            LoopbackConnection {
                state: Arc::clone(&state),
            },
            LoopbackBackend { state },
        )
    }
}

impl BackendConnection for LoopbackConnection {
    fn send(&self, request: Request) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(ConnectionError::unavailable("loopback disconnected"));
        }
        if state.capacity.is_some_and(|capacity| state.sent.len() >= capacity) {
            return Err(ConnectionError::unavailable("loopback queue full"));
        }
        state.sent.push(request);
        Ok(())
    }

    fn try_send(&self, request: Request) -> Result<()> {
        self.send(request)
    }

    fn try_recv(&mut self) -> Option<Response> {
        let mut state = lock(&self.state);
        if !state.connected {
            return None;
        }
        state.inbound.pop_front()
    }

    fn state(&self) -> ConnectionState {
        if lock(&self.state).connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl LoopbackBackend {
    /// Queues a response for the front end
    pub fn push_response(&self, response: Response) {
        lock(&self.state).inbound.push_back(response);
    }

    pub fn push_responses(&self, responses: impl IntoIterator<Item = Response>) {
        lock(&self.state).inbound.extend(responses);
    }

    /// Drains every request the front end has sent so far
    pub fn take_sent(&self) -> Vec<Request> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    /// Responses not yet read by the front end
    pub fn pending_responses(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Bounds the requests held until the next `take_sent`; `None` lifts
    /// the bound
    pub fn set_capacity(&self, capacity: Option<usize>) {
        lock(&self.state).capacity = capacity;
    }

    /// Simulates the session dropping or coming back
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}
