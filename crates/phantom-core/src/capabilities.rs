//! Axis capability
//!
//! The phantom mixes two very different actuators: stepper motors behind a
//! register-style controller and an electric cylinder behind a line-based
//! serial firmware. Both are reduced to the [`Axis`] trait so the coordinator
//! is written once against it.
//!
//! # Contract
//! - Positions are in centimeters in the phantom coordinate frame
//! - `check_target` validates without touching the device
//! - `move_to_cm` initiates motion and returns before completion
//! - `reach_state` is a single poll, never a wait
//!
//! # Example
//!
//! ```rust,ignore
//! async fn settle(axes: &[Box<dyn Axis>]) -> PhantomResult<bool> {
//!     for axis in axes {
//!         if !axis.is_reached().await? {
//!             return Ok(false);
//!         }
//!     }
//!     Ok(true)
//! }
//! ```

use crate::error::{PhantomError, PhantomResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One independently controllable degree of motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisId {
    /// Top stepper motor (horizontal)
    X,
    /// Bottom stepper motor (horizontal)
    Y,
    /// Electric cylinder (vertical)
    Z,
}

impl AxisId {
    /// All axes in dispatch order.
    pub const ALL: [AxisId; 3] = [AxisId::X, AxisId::Y, AxisId::Z];

    /// Label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            AxisId::X => "x (top)",
            AxisId::Y => "y (bottom)",
            AxisId::Z => "z (cylinder)",
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a single "has the last move finished?" poll.
///
/// `NoResponse` is kept apart from `Moving`: a query the device has not
/// answered yet says nothing about where the axis is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachState {
    /// The device confirmed the target is attained
    Reached,
    /// The device confirmed it is still travelling
    Moving,
    /// The device has not answered the status query yet
    NoResponse,
}

impl ReachState {
    /// True only for [`ReachState::Reached`].
    pub fn is_reached(&self) -> bool {
        matches!(self, ReachState::Reached)
    }
}

/// Closed interval of valid positions for an axis, in one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelRange {
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (inclusive)
    pub max: f64,
}

impl TravelRange {
    /// Create a range. `min` must not exceed `max`.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Whether `value` lies inside the bounds. NaN is never inside.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Return `value` unchanged or a [`PhantomError::Range`] for `axis`.
    pub fn check(&self, axis: AxisId, value: f64, unit: &'static str) -> PhantomResult<f64> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(PhantomError::Range {
                axis,
                value,
                min: self.min,
                max: self.max,
                unit,
            })
        }
    }
}

/// Capability: point-to-point motion along one axis.
///
/// # Thread Safety
/// Methods take `&self`; implementations guard their channel with an async
/// mutex. Drivers are still not meant to be driven from two tasks at once.
#[async_trait]
pub trait Axis: Send + Sync {
    /// Which phantom axis this is.
    fn id(&self) -> AxisId;

    /// Validate a target without any device I/O.
    ///
    /// # Returns
    /// - Ok(()) if `move_to_cm(position_cm)` would be accepted
    /// - Err([`PhantomError::Range`]) otherwise
    fn check_target(&self, position_cm: f64) -> PhantomResult<()>;

    /// Start moving to an absolute position. Returns once the command is sent.
    async fn move_to_cm(&self, position_cm: f64) -> PhantomResult<()>;

    /// Current position as reported by the device.
    async fn position_cm(&self) -> PhantomResult<f64>;

    /// Poll the device once for its reached flag.
    async fn reach_state(&self) -> PhantomResult<ReachState>;

    /// Shorthand for `reach_state() == Reached`.
    async fn is_reached(&self) -> PhantomResult<bool> {
        Ok(self.reach_state().await?.is_reached())
    }

    /// Halt motion in progress.
    ///
    /// # Default Implementation
    /// Returns [`PhantomError::Unsupported`].
    async fn stop(&self) -> PhantomResult<()> {
        Err(PhantomError::Unsupported {
            device: self.id().to_string(),
            operation: "stop",
        })
    }
}
