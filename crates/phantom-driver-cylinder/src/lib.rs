//! Electric cylinder driver for the water phantom's vertical (z) axis.
//!
//! - [`CylinderDriver`]: line protocol client implementing [`phantom_core::Axis`]
//! - [`sim::SimulatedCylinder`]: in-process firmware for tests

pub mod cylinder;
pub mod sim;

pub use cylinder::{
    cm_to_percent, percent_to_cm, CylinderConfig, CylinderDriver, PositionUnit,
};
