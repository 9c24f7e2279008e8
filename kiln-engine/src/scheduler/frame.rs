//! Fixed-cadence frame ticker
//!
//! Stands in for a render loop: call [`FrameTicker::wait`] once per frame
//! and poll the dispatcher right after it.

use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
pub struct FrameTicker {
    frame: Duration,
    next: Instant,
    frames: u64,
    overruns: u64,
}

impl FrameTicker {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            next: Instant::now() + frame,
            frames: 0,
            overruns: 0,
        }
    }

    /// Sleeps the current thread until the next frame boundary and returns
    /// its instant
    ///
    /// A frame that ran past its boundary is counted as an overrun and the
    /// schedule restarts from now instead of bursting to catch up.
    pub fn wait(&mut self) -> Instant {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        } else {
            self.overruns += 1;
            debug!(
                late_ms = (now - self.next).as_millis() as u64,
                "Frame overran its budget"
            );
            self.next = now;
        }

        let tick = self.next;
        self.next += self.frame;
        self.frames += 1;
        tick
    }

    pub fn frame(&self) -> Duration {
        self.frame
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_are_spaced_by_frame() {
        let mut ticker = FrameTicker::new(Duration::from_millis(5));
        let first = ticker.wait();
        let second = ticker.wait();

        assert!(second - first >= Duration::from_millis(5));
        assert_eq!(ticker.frames(), 2);
    }

    #[test]
    fn test_late_frame_counts_overrun() {
        let mut ticker = FrameTicker::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        ticker.wait();
        assert_eq!(ticker.overruns(), 1);
    }
}
