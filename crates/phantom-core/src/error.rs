//! Error type shared by every phantom crate.
//!
//! `PhantomError` separates the failure classes the motion stack has to tell
//! apart:
//!
//! - **`Connection` / `NotConnected`**: the device channel is missing or could not
//!   be opened. Fatal at construction time.
//! - **`Range`**: a requested position lies outside an axis travel bound. Always
//!   raised before any byte reaches the device, so the caller can simply retry with
//!   a valid value.
//! - **`Protocol` / `Timeout` / `Rejected`**: the device answered with garbage, did
//!   not answer in time, or refused the command.
//! - **`PartialMove`**: a multi-axis wait expired; the error names the axes that
//!   arrived and the ones that did not.
//!
//! Nothing in the library retries on its own. Retrying is a caller decision.

use crate::capabilities::AxisId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the phantom error type.
pub type PhantomResult<T> = std::result::Result<T, PhantomError>;

/// Primary error type for the water phantom motion stack.
#[derive(Error, Debug)]
pub enum PhantomError {
    /// The device channel could not be established.
    ///
    /// Covers missing ports, permission problems and ports that refuse to open.
    #[error("{device} connection failed: {message}")]
    Connection {
        /// Human-readable device name
        device: String,
        /// Underlying cause
        message: String,
    },

    /// An operation was attempted after the driver released its channel.
    #[error("{device} is not connected")]
    NotConnected {
        /// Human-readable device name
        device: String,
    },

    /// A target position is outside the calibrated or physical travel range.
    ///
    /// **Error Type**: Recoverable - no command was sent to the device.
    #[error("{axis} target {value} {unit} is outside travel range [{min}, {max}] {unit}")]
    Range {
        /// Axis the target was meant for
        axis: AxisId,
        /// Requested value in `unit`
        value: f64,
        /// Lower travel bound in `unit`
        min: f64,
        /// Upper travel bound in `unit`
        max: f64,
        /// Unit of `value`, `min` and `max`
        unit: &'static str,
    },

    /// The device sent a malformed, truncated or unexpected response.
    #[error("{device} protocol error: {message}")]
    Protocol {
        /// Human-readable device name
        device: String,
        /// What was wrong with the response
        message: String,
    },

    /// The device did not answer within the allotted time.
    #[error("{device} did not complete {operation} within {timeout:?}")]
    Timeout {
        /// Human-readable device name
        device: String,
        /// Operation that was waiting
        operation: String,
        /// Time budget that expired
        timeout: Duration,
    },

    /// The controller answered with an error status.
    #[error("{device} rejected {command}: {status}")]
    Rejected {
        /// Human-readable device name
        device: String,
        /// Command that was refused
        command: String,
        /// Status reported by the device
        status: String,
    },

    /// A multi-axis move did not converge before the deadline.
    #[error("move did not converge within {timeout:?}: pending {pending:?}, reached {reached:?}")]
    PartialMove {
        /// Axes that reported their target reached
        reached: Vec<AxisId>,
        /// Axes that had not reported their target reached
        pending: Vec<AxisId>,
        /// Time budget that expired
        timeout: Duration,
    },

    /// The device does not offer the requested capability.
    #[error("{device} does not support {operation}")]
    Unsupported {
        /// Human-readable device name
        device: String,
        /// Operation that was requested
        operation: &'static str,
    },

    /// Configuration values are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhantomError {
    /// Build a [`PhantomError::Protocol`].
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`PhantomError::Connection`].
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`PhantomError::Timeout`].
    pub fn timeout(device: impl Into<String>, operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            device: device.into(),
            operation: operation.into(),
            timeout,
        }
    }

    /// True when the failure left the hardware untouched and the caller may retry
    /// with different arguments.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Range { .. } | Self::Unsupported { .. })
    }
}
