//! Configuration loading using Figment
//!
//! Configuration is layered, later sources win:
//! 1. Built-in defaults
//! 2. `config/water_phantom.toml` (or the file given on the command line)
//! 3. Environment variables prefixed with `WATER_PHANTOM_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use water_phantom::config::PhantomConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // WATER_PHANTOM_CYLINDER__ENABLED=false disables the z axis
//! let config = PhantomConfig::load()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use phantom_core::error::{PhantomError, PhantomResult};
use phantom_core::limits;
use phantom_core::polling::PollPolicy;
use phantom_driver_cylinder::CylinderConfig;
use phantom_driver_trinamic::StepperConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/water_phantom.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WATER_PHANTOM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhantomConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Electric cylinder (z axis)
    pub cylinder: CylinderSection,
    /// Stepper module (x and y axes)
    pub stepper: StepperConfig,
    /// Convergence polling
    pub motion: MotionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: OutputFormat,
    /// Log span open/close events
    pub log_span_events: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Water Phantom".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
            log_span_events: false,
        }
    }
}

/// Cylinder settings plus the switch that removes the z axis entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CylinderSection {
    /// Whether the cylinder is fitted
    pub enabled: bool,
    /// Driver settings
    #[serde(flatten)]
    pub driver: CylinderConfig,
}

impl Default for CylinderSection {
    fn default() -> Self {
        Self {
            enabled: true,
            driver: CylinderConfig::default(),
        }
    }
}

/// How multi-axis moves are waited on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// First delay between reached polls (ms)
    pub poll_interval_ms: u64,
    /// Longest delay between reached polls (ms)
    pub max_poll_interval_ms: u64,
    /// Growth factor of the poll delay
    pub backoff_factor: f64,
    /// Budget for a blocking move to converge (ms)
    pub move_timeout_ms: u64,
    /// Budget for all axes to settle after homing (ms)
    pub startup_timeout_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: limits::POLL_INTERVAL.as_millis() as u64,
            max_poll_interval_ms: limits::MAX_POLL_INTERVAL.as_millis() as u64,
            backoff_factor: 1.5,
            move_timeout_ms: limits::MOVE_TIMEOUT.as_millis() as u64,
            startup_timeout_ms: limits::MOVE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl MotionConfig {
    fn policy(&self, timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.max_poll_interval_ms),
            backoff_factor: self.backoff_factor,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Poll policy for blocking moves.
    pub fn move_policy(&self) -> PollPolicy {
        self.policy(self.move_timeout_ms)
    }

    /// Poll policy for the post-homing settle.
    pub fn startup_policy(&self) -> PollPolicy {
        self.policy(self.startup_timeout_ms)
    }
}

impl PhantomConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider stack, for callers that want to merge more sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(PhantomConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PhantomResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, travel) in [
            ("stepper.max_travel_top_cm", self.stepper.max_travel_top_cm),
            ("stepper.max_travel_bottom_cm", self.stepper.max_travel_bottom_cm),
        ] {
            if !(travel.is_finite() && travel > 0.0) {
                return Err(invalid(format!("{name} must be positive, got {travel}")));
            }
        }

        self.stepper.motor.microstep_resolution()?;

        if !(self.motion.backoff_factor.is_finite() && self.motion.backoff_factor >= 1.0) {
            return Err(invalid(format!(
                "motion.backoff_factor must be finite and at least 1.0, got {}",
                self.motion.backoff_factor
            )));
        }

        let durations = [
            ("motion.poll_interval_ms", self.motion.poll_interval_ms),
            ("motion.move_timeout_ms", self.motion.move_timeout_ms),
            ("motion.startup_timeout_ms", self.motion.startup_timeout_ms),
            ("stepper.response_timeout_ms", self.stepper.response_timeout_ms),
            ("stepper.homing_timeout_ms", self.stepper.homing_timeout_ms),
            ("cylinder.response_timeout_ms", self.cylinder.driver.response_timeout_ms),
            ("cylinder.move_timeout_ms", self.cylinder.driver.move_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }

        if self.motion.max_poll_interval_ms < self.motion.poll_interval_ms {
            return Err(invalid(
                "motion.max_poll_interval_ms must not be below motion.poll_interval_ms".to_string(),
            ));
        }

        Ok(())
    }
}

fn invalid(message: String) -> PhantomError {
    PhantomError::Configuration(message)
}
