//! Trinamic TMCM stepper driver for the water phantom's horizontal axes.
//!
//! Layers, bottom up:
//! - [`tmcl`]: 9-byte frame codec and the [`TmclBus`](tmcl::TmclBus) transport
//! - [`module`]: parameter, move, stop and reference search commands
//! - [`stepper`]: the two phantom motors in cm, homing, reached flags
//! - [`sim`]: in-memory module for tests

pub mod module;
pub mod params;
pub mod sim;
pub mod stepper;
pub mod tmcl;

pub use params::MotorSettings;
pub use stepper::{Motor, RotaryAxis, StepperConfig, StepperDriver};
