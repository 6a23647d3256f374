//! # Water Phantom Motion Control
//!
//! Positions the water phantom used for radiation dosimetry: two stepper
//! carriages (x on top, y at the bottom) on a Trinamic TMCM module and an
//! electric cylinder (z) behind an Arduino, driven as one coordinate space in
//! centimeters.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered Figment configuration (`PhantomConfig`)
//! - **`coordinator`**: the `WaterPhantom` three-axis coordinator
//! - **`logging`**: `tracing-subscriber` setup for the binary
//!
//! Device drivers live in their own crates: `phantom_core` (errors, the
//! `Axis` trait, serial helpers), `phantom_driver_cylinder` and
//! `phantom_driver_trinamic`.

pub mod config;
pub mod coordinator;
pub mod logging;

pub use config::PhantomConfig;
pub use coordinator::{MotionState, WaterPhantom};
pub use phantom_core::{Axis, AxisId, PhantomError, PhantomResult, ReachState};
