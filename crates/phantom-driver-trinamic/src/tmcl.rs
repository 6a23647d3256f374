//! TMCL binary framing and transport.
//!
//! Protocol Overview:
//! - Fixed 9-byte frames in both directions, values big-endian
//! - Request: `[address, command, type, motor, value(4), checksum]`
//! - Reply:   `[reply address, module address, status, command, value(4), checksum]`
//! - Checksum: wrapping sum of the first eight bytes
//! - Status 100 means success, 101 "loaded into EEPROM", 1..=6 are errors

use async_trait::async_trait;
use phantom_core::error::{PhantomError, PhantomResult};
use phantom_core::serial::{drain_serial_buffer, open_serial_async, DynSerial};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub(crate) const DEVICE: &str = "tmcm";

/// Length of every TMCL frame.
pub const FRAME_LEN: usize = 9;

/// TMCL instructions used by the phantom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmclCommand {
    /// Rotate right at a velocity
    Ror = 1,
    /// Rotate left at a velocity
    Rol = 2,
    /// Motor stop
    Mst = 3,
    /// Move to position
    Mvp = 4,
    /// Set axis parameter
    Sap = 5,
    /// Get axis parameter
    Gap = 6,
    /// Set global parameter
    Sgp = 9,
    /// Get global parameter
    Ggp = 10,
    /// Reference search
    Rfs = 13,
    /// Firmware version
    FirmwareVersion = 136,
}

impl TmclCommand {
    /// Instruction number on the wire.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Look up a known instruction number.
    pub fn from_number(number: u8) -> Option<Self> {
        Some(match number {
            1 => Self::Ror,
            2 => Self::Rol,
            3 => Self::Mst,
            4 => Self::Mvp,
            5 => Self::Sap,
            6 => Self::Gap,
            9 => Self::Sgp,
            10 => Self::Ggp,
            13 => Self::Rfs,
            136 => Self::FirmwareVersion,
            _ => return None,
        })
    }
}

/// Type byte of MVP.
pub mod move_mode {
    /// Absolute target
    pub const ABSOLUTE: u8 = 0;
    /// Relative to the current target
    pub const RELATIVE: u8 = 1;
}

/// Type byte of RFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RfsMode {
    /// Start the reference search
    Start = 0,
    /// Abort the reference search
    Stop = 1,
    /// Query whether a search is running
    Status = 2,
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// One TMCL request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmclRequest {
    /// Module address
    pub address: u8,
    /// Instruction number
    pub command: u8,
    /// Type byte (parameter index, move mode, ...)
    pub kind: u8,
    /// Motor or bank number
    pub motor: u8,
    /// Value
    pub value: i32,
}

impl TmclRequest {
    /// Serialize to the 9-byte wire format.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let v = self.value.to_be_bytes();
        let mut frame = [
            self.address,
            self.command,
            self.kind,
            self.motor,
            v[0],
            v[1],
            v[2],
            v[3],
            0,
        ];
        frame[8] = checksum(&frame[..8]);
        frame
    }

    /// Parse a request frame. Used by simulators.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        verify_checksum(frame)?;
        Ok(Self {
            address: frame[0],
            command: frame[1],
            kind: frame[2],
            motor: frame[3],
            value: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        })
    }

    /// Short description for logs and errors, e.g. `GAP 8 motor 1`.
    pub fn describe(&self) -> String {
        match TmclCommand::from_number(self.command) {
            Some(cmd) => format!("{cmd:?} {} motor {}", self.kind, self.motor).to_uppercase(),
            None => format!("instruction {} type {} motor {}", self.command, self.kind, self.motor),
        }
    }
}

/// Status byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmclStatus {
    /// 100: success
    Ok,
    /// 101: command loaded into EEPROM
    LoadedIntoEeprom,
    /// 1: wrong checksum
    WrongChecksum,
    /// 2: invalid command
    InvalidCommand,
    /// 3: wrong type
    WrongType,
    /// 4: invalid value
    InvalidValue,
    /// 5: configuration EEPROM locked
    EepromLocked,
    /// 6: command not available
    CommandNotAvailable,
    /// Any other code
    Unknown(u8),
}

impl TmclStatus {
    /// Decode a status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            100 => Self::Ok,
            101 => Self::LoadedIntoEeprom,
            1 => Self::WrongChecksum,
            2 => Self::InvalidCommand,
            3 => Self::WrongType,
            4 => Self::InvalidValue,
            5 => Self::EepromLocked,
            6 => Self::CommandNotAvailable,
            other => Self::Unknown(other),
        }
    }

    /// Status byte on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 100,
            Self::LoadedIntoEeprom => 101,
            Self::WrongChecksum => 1,
            Self::InvalidCommand => 2,
            Self::WrongType => 3,
            Self::InvalidValue => 4,
            Self::EepromLocked => 5,
            Self::CommandNotAvailable => 6,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the command was executed.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::LoadedIntoEeprom)
    }
}

impl fmt::Display for TmclStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::LoadedIntoEeprom => "loaded into EEPROM",
            Self::WrongChecksum => "wrong checksum",
            Self::InvalidCommand => "invalid command",
            Self::WrongType => "wrong type",
            Self::InvalidValue => "invalid value",
            Self::EepromLocked => "configuration EEPROM locked",
            Self::CommandNotAvailable => "command not available",
            Self::Unknown(code) => return write!(f, "unknown status {code}"),
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// One TMCL reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmclReply {
    /// Host address the module answered to
    pub reply_address: u8,
    /// Address of the answering module
    pub module_address: u8,
    /// Execution status
    pub status: TmclStatus,
    /// Instruction being answered
    pub command: u8,
    /// Returned value
    pub value: i32,
}

impl TmclReply {
    /// Parse and checksum-verify a reply frame.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        verify_checksum(frame)?;
        Ok(Self {
            reply_address: frame[0],
            module_address: frame[1],
            status: TmclStatus::from_code(frame[2]),
            command: frame[3],
            value: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        })
    }

    /// Serialize to the 9-byte wire format. Used by simulators.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let v = self.value.to_be_bytes();
        let mut frame = [
            self.reply_address,
            self.module_address,
            self.status.code(),
            self.command,
            v[0],
            v[1],
            v[2],
            v[3],
            0,
        ];
        frame[8] = checksum(&frame[..8]);
        frame
    }
}

fn verify_checksum(frame: &[u8; FRAME_LEN]) -> Result<(), FrameError> {
    let expected = checksum(&frame[..8]);
    if expected == frame[8] {
        Ok(())
    } else {
        Err(FrameError::Checksum {
            expected,
            actual: frame[8],
        })
    }
}

/// Framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Checksum byte does not match the frame content.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Computed checksum
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },

    /// The reply answers a different instruction than was sent.
    #[error("reply to instruction {actual} while waiting for {expected}")]
    CommandMismatch {
        /// Instruction sent
        expected: u8,
        /// Instruction answered
        actual: u8,
    },
}

impl From<FrameError> for PhantomError {
    fn from(e: FrameError) -> Self {
        PhantomError::protocol(DEVICE, e.to_string())
    }
}

/// Request/reply transport to a TMCL module.
///
/// One request is in flight at a time; the caller holds `&mut self` for the
/// whole exchange.
#[async_trait]
pub trait TmclBus: Send {
    /// Send `request` and return the module's reply.
    async fn transact(&mut self, request: TmclRequest) -> PhantomResult<TmclReply>;
}

/// TMCL over a (USB virtual) serial port.
pub struct SerialTmclBus {
    port: DynSerial,
    timeout: Duration,
}

impl SerialTmclBus {
    /// Open `path` at `baud_rate`.
    pub async fn open(path: &str, baud_rate: u32, timeout: Duration) -> PhantomResult<Self> {
        let port = open_serial_async(path, baud_rate, DEVICE).await?;
        tracing::info!(port = path, baud = baud_rate, "TMCM module connected");
        Ok(Self::new(Box::new(port), timeout))
    }

    /// Wrap an already open channel.
    pub fn new(port: DynSerial, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl TmclBus for SerialTmclBus {
    async fn transact(&mut self, request: TmclRequest) -> PhantomResult<TmclReply> {
        let frame = request.encode();
        tracing::trace!(request = %request.describe(), ?frame, "tmcm <-");
        self.port.write_all(&frame).await?;
        self.port.flush().await?;

        let mut buf = [0u8; FRAME_LEN];
        match tokio::time::timeout(self.timeout, self.port.read_exact(&mut buf)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                // a partial frame may be sitting in the buffer; resync
                drain_serial_buffer(&mut self.port, 50).await;
                return Err(PhantomError::timeout(DEVICE, request.describe(), self.timeout));
            }
        }

        let reply = TmclReply::decode(&buf)?;
        tracing::trace!(status = %reply.status, value = reply.value, "tmcm ->");
        if reply.command != request.command {
            return Err(FrameError::CommandMismatch {
                expected: request.command,
                actual: reply.command,
            }
            .into());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_core::mock_serial;

    #[test]
    fn encode_mvp_absolute() {
        let req = TmclRequest {
            address: 1,
            command: TmclCommand::Mvp.number(),
            kind: move_mode::ABSOLUTE,
            motor: 0,
            value: 1_280_000,
        };
        // 1_280_000 = 0x00138800
        assert_eq!(req.encode(), [1, 4, 0, 0, 0x00, 0x13, 0x88, 0x00, 0xA0]);
    }

    #[test]
    fn negative_values_are_twos_complement() {
        let req = TmclRequest {
            address: 1,
            command: TmclCommand::Sap.number(),
            kind: 1,
            motor: 1,
            value: -1,
        };
        let frame = req.encode();
        assert_eq!(&frame[4..8], &[0xFF; 4]);
        assert_eq!(TmclRequest::decode(&frame).unwrap(), req);
    }

    #[test]
    fn decode_reply_checks_checksum() {
        let mut frame = [2, 1, 100, 6, 0, 0, 0, 1, 0];
        frame[8] = checksum(&frame[..8]);
        let reply = TmclReply::decode(&frame).unwrap();
        assert_eq!(reply.status, TmclStatus::Ok);
        assert_eq!(reply.value, 1);

        frame[8] = frame[8].wrapping_add(1);
        assert!(matches!(
            TmclReply::decode(&frame),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn status_codes() {
        assert!(TmclStatus::from_code(100).is_ok());
        assert!(TmclStatus::from_code(101).is_ok());
        assert_eq!(TmclStatus::from_code(4), TmclStatus::InvalidValue);
        assert!(!TmclStatus::InvalidValue.is_ok());
        assert_eq!(TmclStatus::from_code(42), TmclStatus::Unknown(42));
        assert_eq!(TmclStatus::InvalidValue.to_string(), "invalid value (4)");
    }

    #[test]
    fn describe_names_known_commands() {
        let req = TmclRequest {
            address: 1,
            command: 6,
            kind: 8,
            motor: 1,
            value: 0,
        };
        assert_eq!(req.describe(), "GAP 8 MOTOR 1");
    }

    #[tokio::test]
    async fn serial_bus_round_trip() {
        let (port, mut harness) = mock_serial::new();
        let mut bus = SerialTmclBus::new(Box::new(port), Duration::from_secs(1));

        let device = tokio::spawn(async move {
            let frame = harness.next_frame(FRAME_LEN).await.unwrap();
            let mut raw = [0u8; FRAME_LEN];
            raw.copy_from_slice(&frame);
            let req = TmclRequest::decode(&raw).unwrap();
            let reply = TmclReply {
                reply_address: 2,
                module_address: req.address,
                status: TmclStatus::Ok,
                command: req.command,
                value: 1234,
            };
            harness.send_response(&reply.encode()).unwrap();
            (req, harness)
        });

        let req = TmclRequest {
            address: 1,
            command: TmclCommand::Gap.number(),
            kind: 1,
            motor: 0,
            value: 0,
        };
        let reply = bus.transact(req).await.unwrap();
        assert_eq!(reply.value, 1234);

        let (seen, _harness) = device.await.unwrap();
        assert_eq!(seen, req);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_bus_times_out() {
        let (port, _harness) = mock_serial::new();
        let mut bus = SerialTmclBus::new(Box::new(port), Duration::from_millis(100));

        let req = TmclRequest {
            address: 1,
            command: TmclCommand::Mst.number(),
            kind: 0,
            motor: 0,
            value: 0,
        };
        let err = bus.transact(req).await.unwrap_err();
        assert!(matches!(err, PhantomError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn serial_bus_rejects_corrupt_reply() {
        let (port, harness) = mock_serial::new();
        let mut bus = SerialTmclBus::new(Box::new(port), Duration::from_secs(1));
        harness.send_response(&[2, 1, 100, 3, 0, 0, 0, 0, 0]).unwrap();

        let req = TmclRequest {
            address: 1,
            command: TmclCommand::Mst.number(),
            kind: 0,
            motor: 0,
            value: 0,
        };
        let err = bus.transact(req).await.unwrap_err();
        assert!(matches!(err, PhantomError::Protocol { .. }), "{err}");
    }
}
