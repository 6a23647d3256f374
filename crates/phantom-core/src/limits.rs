//! Shared defaults for serial settings and wait budgets.
//!
//! Driver configs start from these values; every one of them can be
//! overridden in the configuration file.

use std::time::Duration;

// =============================================================================
// Serial
// =============================================================================

/// Baud rate of the cylinder controller firmware.
pub const CYLINDER_BAUD_RATE: u32 = 9600;

/// Baud rate of the TMCM stepper module.
pub const STEPPER_BAUD_RATE: u32 = 9600;

/// Longest ASCII line accepted from a device before it is treated as garbage.
pub const MAX_LINE_LEN: usize = 256;

// =============================================================================
// Timeouts
// =============================================================================

/// Time allowed for a single request/response exchange.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after opening the cylinder port. The controller resets on open.
pub const CONNECT_SETTLE: Duration = Duration::from_secs(2);

/// How long a reached poll waits for the cylinder to answer before reporting
/// no response.
pub const REPLY_WINDOW: Duration = Duration::from_millis(50);

/// Quiet period that ends the drain of stale cylinder lines before a
/// waiting move.
pub const STALE_LINE_WINDOW: Duration = Duration::from_millis(5);

/// Budget for a single point-to-point move to converge.
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for the reference search of both stepper motors.
pub const HOMING_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between homing completion and zeroing the position counters.
pub const HOME_SETTLE: Duration = Duration::from_secs(1);

// =============================================================================
// Polling
// =============================================================================

/// First delay between two status polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Largest delay between two status polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);
