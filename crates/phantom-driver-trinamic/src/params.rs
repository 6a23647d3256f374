//! TMCM axis/global parameter numbers and the phantom's motor profile.

use phantom_core::error::{PhantomError, PhantomResult};
use serde::{Deserialize, Serialize};

/// Axis parameters (SAP/GAP type byte) used by the phantom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AxisParameter {
    /// Target position (microsteps)
    TargetPosition = 0,
    /// Actual position (microsteps)
    ActualPosition = 1,
    /// Maximum positioning speed
    MaxVelocity = 4,
    /// Maximum acceleration
    MaxAcceleration = 5,
    /// Run current (0..255)
    MaxCurrent = 6,
    /// Standstill current (0..255)
    StandbyCurrent = 7,
    /// 1 when actual == target
    PositionReached = 8,
    /// Right stop switch state
    RightEndstop = 10,
    /// Left stop switch state
    LeftEndstop = 11,
    /// 1 disables the right stop switch
    RightLimitSwitchDisable = 12,
    /// 1 disables the left stop switch
    LeftLimitSwitchDisable = 13,
    /// Microstep resolution as log2 of microsteps per full step
    MicrostepResolution = 140,
    /// Reference search mode
    ReferenceSearchMode = 193,
    /// Speed while searching the switch
    ReferenceSearchSpeed = 194,
    /// Speed while leaving the switch
    ReferenceSwitchSpeed = 195,
    /// Current during acceleration
    BoostCurrent = 200,
}

impl AxisParameter {
    /// Type byte on the wire.
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Global parameters (SGP/GGP) used by the phantom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalParameter {
    /// Polarity of the stop switches, bank 0
    EndSwitchPolarity,
}

impl GlobalParameter {
    /// Parameter index on the wire.
    pub fn number(self) -> u8 {
        match self {
            GlobalParameter::EndSwitchPolarity => 79,
        }
    }

    /// Bank the parameter lives in.
    pub fn bank(self) -> u8 {
        match self {
            GlobalParameter::EndSwitchPolarity => 0,
        }
    }
}

/// Drive profile applied to both phantom motors at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Run current
    pub max_current: i32,
    /// Standstill current
    pub standby_current: i32,
    /// Acceleration boost current
    pub boost_current: i32,
    /// Positioning speed, also the reference search speed
    pub max_velocity: i32,
    /// Acceleration
    pub max_acceleration: i32,
    /// Microsteps per full step (power of two up to 256)
    pub microsteps: u32,
    /// Reference search mode
    pub reference_search_mode: i32,
    /// Speed while leaving the reference switch
    pub reference_switch_speed: i32,
    /// Disable the left (home) switch
    pub left_limit_switch_disable: bool,
    /// Disable the right switch
    pub right_limit_switch_disable: bool,
    /// Global stop switch polarity
    pub end_switch_polarity: i32,
}

impl Default for MotorSettings {
    fn default() -> Self {
        let max_velocity = 500;
        Self {
            max_current: 250,
            standby_current: 0,
            boost_current: 0,
            max_velocity,
            max_acceleration: 1000,
            microsteps: 64,
            reference_search_mode: 1,
            reference_switch_speed: max_velocity / 5,
            left_limit_switch_disable: false,
            right_limit_switch_disable: true,
            end_switch_polarity: 1,
        }
    }
}

impl MotorSettings {
    /// Value of the microstep resolution parameter (log2 of `microsteps`).
    pub fn microstep_resolution(&self) -> PhantomResult<i32> {
        if self.microsteps.is_power_of_two() && self.microsteps <= 256 {
            Ok(self.microsteps.trailing_zeros() as i32)
        } else {
            Err(PhantomError::Configuration(format!(
                "microsteps must be a power of two up to 256, got {}",
                self.microsteps
            )))
        }
    }

    /// Axis parameters to write, in order.
    pub fn profile(&self) -> PhantomResult<Vec<(AxisParameter, i32)>> {
        use AxisParameter::*;
        Ok(vec![
            (MaxCurrent, self.max_current),
            (MaxVelocity, self.max_velocity),
            (StandbyCurrent, self.standby_current),
            (BoostCurrent, self.boost_current),
            (MicrostepResolution, self.microstep_resolution()?),
            (MaxAcceleration, self.max_acceleration),
            (LeftLimitSwitchDisable, i32::from(self.left_limit_switch_disable)),
            (RightLimitSwitchDisable, i32::from(self.right_limit_switch_disable)),
            (ReferenceSearchMode, self.reference_search_mode),
            (ReferenceSearchSpeed, self.max_velocity),
            (ReferenceSwitchSpeed, self.reference_switch_speed),
        ])
    }
}
