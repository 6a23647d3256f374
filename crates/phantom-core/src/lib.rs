//! Core types shared by the water phantom drivers and coordinator.
//!
//! - [`error`]: the [`PhantomError`] enum used across every crate
//! - [`capabilities`]: the [`Axis`] trait both actuator drivers implement
//! - [`polling`]: bounded poll loops with backoff
//! - [`serial`], [`mock_serial`], [`port_resolver`]: serial plumbing
//! - [`limits`]: default timeouts and serial settings

pub mod capabilities;
pub mod error;
pub mod limits;
pub mod mock_serial;
pub mod polling;
pub mod port_resolver;
pub mod serial;

pub use capabilities::{Axis, AxisId, ReachState, TravelRange};
pub use error::{PhantomError, PhantomResult};
pub use polling::{poll_until, PollPolicy};
pub use serial::DynSerial;
