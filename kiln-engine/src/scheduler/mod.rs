//! Scheduler layer for the engine
//!
//! The poll adapter drains the connection once per tick; the frame ticker
//! gives hosts without their own render loop a fixed cadence to call it on.

pub mod frame;
pub mod poller;

pub use frame::FrameTicker;
pub use poller::PollAdapter;
