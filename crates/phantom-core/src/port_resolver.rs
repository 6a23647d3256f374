//! Serial port resolution by USB vendor and product id.
//!
//! Device paths like `/dev/ttyACM0` move around between reboots. The cylinder
//! controller is an Arduino board with a fixed USB id, so it is found by that
//! id instead.
//!
//! # Usage
//!
//! ```rust,ignore
//! use phantom_core::port_resolver::{find_port, UsbId};
//!
//! let id: UsbId = "2341:0043".parse()?;
//! let path = find_port(id)?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during port resolution.
#[derive(Debug, Error)]
pub enum PortResolveError {
    /// No USB serial port carries the requested id.
    #[error("No serial port found with USB id {0}")]
    NoMatch(UsbId),

    /// Several ports carry the requested id.
    #[error("Multiple serial ports match USB id {id}: {ports:?}")]
    AmbiguousMatch {
        /// Requested id
        id: UsbId,
        /// Every matching port path
        ports: Vec<String>,
    },

    /// The operating system refused to enumerate ports.
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(String),

    /// A `vvvv:pppp` string could not be parsed.
    #[error("Invalid USB id {0:?}, expected vvvv:pppp in hex")]
    InvalidUsbId(String),
}

/// USB vendor/product id pair, written `vvvv:pppp` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId {
    /// Vendor id
    pub vid: u16,
    /// Product id
    pub pid: u16,
}

impl UsbId {
    /// Create an id from its two halves.
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

impl FromStr for UsbId {
    type Err = PortResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PortResolveError::InvalidUsbId(s.to_string());
        let (vid, pid) = s.trim().split_once(':').ok_or_else(invalid)?;
        let vid = u16::from_str_radix(vid, 16).map_err(|_| invalid())?;
        let pid = u16::from_str_radix(pid, 16).map_err(|_| invalid())?;
        Ok(Self { vid, pid })
    }
}

impl TryFrom<String> for UsbId {
    type Error = PortResolveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbId> for String {
    fn from(id: UsbId) -> Self {
        id.to_string()
    }
}

/// One enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    /// OS path of the port
    pub path: String,
    /// USB id when the port sits on a USB bridge
    pub usb_id: Option<UsbId>,
    /// USB product string if reported
    pub product: Option<String>,
}

/// Enumerate every serial port the OS reports.
pub fn list_ports() -> Result<Vec<PortEntry>, PortResolveError> {
    let ports = serialport::available_ports()
        .map_err(|e| PortResolveError::Enumerate(e.to_string()))?;

    Ok(ports
        .into_iter()
        .map(|info| match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortEntry {
                path: info.port_name,
                usb_id: Some(UsbId::new(usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => PortEntry {
                path: info.port_name,
                usb_id: None,
                product: None,
            },
        })
        .collect())
}

/// Find the single serial port carrying `id`.
pub fn find_port(id: UsbId) -> Result<String, PortResolveError> {
    let ports = list_ports()?;
    let path = select_port(&ports, id)?;
    tracing::debug!(usb_id = %id, port = %path, "Resolved serial port");
    Ok(path)
}

/// Pick the port matching `id` out of an enumeration.
pub fn select_port(ports: &[PortEntry], id: UsbId) -> Result<String, PortResolveError> {
    let mut matches: Vec<String> = ports
        .iter()
        .filter(|p| p.usb_id == Some(id))
        .map(|p| p.path.clone())
        .collect();

    match matches.len() {
        0 => Err(PortResolveError::NoMatch(id)),
        1 => Ok(matches.remove(0)),
        _ => Err(PortResolveError::AmbiguousMatch { id, ports: matches }),
    }
}
