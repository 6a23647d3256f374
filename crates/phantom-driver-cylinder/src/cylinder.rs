//! Electric cylinder driver (vertical axis)
//!
//! The cylinder sits behind an Arduino with a motor shield. The firmware
//! speaks a line protocol over USB serial:
//!
//! | Request      | Reply            | Meaning                          |
//! |--------------|------------------|----------------------------------|
//! | `Z=<pct>\n`  | `DONE` on arrival| move to percent of travel        |
//! | `GET\n`      | `<pct>`          | current position in percent      |
//! | `REACHED\n`  | `True` / `False` | whether the last move finished   |
//!
//! Replies end with `\r\n`. Baud 9600, 8N1. The board resets when the port
//! opens, so the driver waits a couple of seconds before the first command.
//!
//! The firmware only knows percent of travel. Centimeters map onto it with
//! an affine calibration: 0 % is 2.3 cm, 100 % is 32.1 cm.

use async_trait::async_trait;
use phantom_core::capabilities::{Axis, AxisId, ReachState, TravelRange};
use phantom_core::error::{PhantomError, PhantomResult};
use phantom_core::limits;
use phantom_core::port_resolver::{self, UsbId};
use phantom_core::serial::{drain_serial_buffer, open_serial_async, DynSerial};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

const DEVICE: &str = "cylinder";

/// Position of the cylinder at 0 % travel, in cm.
pub const CYLINDER_OFFSET_CM: f64 = 2.3;

/// Length of the full cylinder stroke, in cm.
pub const CYLINDER_SPAN_CM: f64 = 29.8;

/// Slack accepted at the percent bounds for float noise from the cm transform.
const PERCENT_TOLERANCE: f64 = 1e-9;

/// Travel range of the cylinder in percent.
pub const PERCENT_RANGE: TravelRange = TravelRange::new(0.0, 100.0);

/// Travel range of the cylinder in cm.
pub const CM_RANGE: TravelRange =
    TravelRange::new(CYLINDER_OFFSET_CM, CYLINDER_OFFSET_CM + CYLINDER_SPAN_CM);

/// USB id of the Arduino Uno carrying the cylinder firmware.
pub const DEFAULT_USB_ID: UsbId = UsbId::new(0x2341, 0x0043);

/// Convert a cylinder position in cm to percent of travel.
pub fn cm_to_percent(cm: f64) -> f64 {
    (cm - CYLINDER_OFFSET_CM) / CYLINDER_SPAN_CM * 100.0
}

/// Convert percent of travel to a cylinder position in cm.
pub fn percent_to_cm(percent: f64) -> f64 {
    percent / 100.0 * CYLINDER_SPAN_CM + CYLINDER_OFFSET_CM
}

/// Unit a cylinder position is given in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionUnit {
    /// Centimeters in the phantom frame
    Cm,
    /// Percent of the cylinder stroke
    Percent,
}

impl PositionUnit {
    fn symbol(self) -> &'static str {
        match self {
            PositionUnit::Cm => "cm",
            PositionUnit::Percent => "%",
        }
    }
}

/// Validate `position` and return the percent value to send.
///
/// Values within float noise of a bound are clamped onto it.
pub fn target_percent(position: f64, unit: PositionUnit) -> PhantomResult<f64> {
    let percent = match unit {
        PositionUnit::Cm => cm_to_percent(position),
        PositionUnit::Percent => position,
    };

    let widened = TravelRange::new(
        PERCENT_RANGE.min - PERCENT_TOLERANCE,
        PERCENT_RANGE.max + PERCENT_TOLERANCE,
    );
    if !widened.contains(percent) {
        let range = match unit {
            PositionUnit::Cm => CM_RANGE,
            PositionUnit::Percent => PERCENT_RANGE,
        };
        return Err(PhantomError::Range {
            axis: AxisId::Z,
            value: position,
            min: range.min,
            max: range.max,
            unit: unit.symbol(),
        });
    }

    Ok(percent.clamp(PERCENT_RANGE.min, PERCENT_RANGE.max))
}

/// Configuration for the cylinder controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CylinderConfig {
    /// Serial port path. Found by `usb_id` when unset.
    pub port: Option<String>,
    /// USB id used for port discovery
    pub usb_id: UsbId,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Pause after opening the port (ms)
    pub connect_settle_ms: u64,
    /// How long a reached poll waits for its answer (ms)
    pub reply_window_ms: u64,
    /// Timeout for GET and other request/response exchanges (ms)
    pub response_timeout_ms: u64,
    /// Timeout for a waiting move (ms)
    pub move_timeout_ms: u64,
}

impl Default for CylinderConfig {
    fn default() -> Self {
        Self {
            port: None,
            usb_id: DEFAULT_USB_ID,
            baud_rate: limits::CYLINDER_BAUD_RATE,
            connect_settle_ms: limits::CONNECT_SETTLE.as_millis() as u64,
            reply_window_ms: limits::REPLY_WINDOW.as_millis() as u64,
            response_timeout_ms: limits::RESPONSE_TIMEOUT.as_millis() as u64,
            move_timeout_ms: limits::MOVE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CylinderConfig {
    fn reply_window(&self) -> Duration {
        Duration::from_millis(self.reply_window_ms)
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

/// Open channel plus the line reassembly state that must survive timeouts.
struct Link {
    reader: BufReader<DynSerial>,
    /// Bytes of a line whose terminator has not arrived yet
    partial: Vec<u8>,
    /// A REACHED query was sent and its answer not read yet
    reached_query_pending: bool,
}

impl Link {
    fn new(port: DynSerial) -> Self {
        Self {
            reader: BufReader::new(port),
            partial: Vec::new(),
            reached_query_pending: false,
        }
    }

    async fn send(&mut self, line: &str) -> PhantomResult<()> {
        tracing::trace!(command = line.trim_end(), "cylinder <-");
        let writer = self.reader.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one line, or `None` if none completes within `wait`.
    async fn read_line(&mut self, wait: Duration) -> PhantomResult<Option<String>> {
        let read = tokio::time::timeout(wait, self.reader.read_until(b'\n', &mut self.partial)).await;

        match read {
            Err(_) => {
                if self.partial.len() > limits::MAX_LINE_LEN {
                    self.partial.clear();
                    return Err(PhantomError::protocol(DEVICE, "reply line too long"));
                }
                Ok(None)
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) if self.partial.last() != Some(&b'\n') => {
                self.partial.clear();
                Err(PhantomError::protocol(DEVICE, "connection closed"))
            }
            Ok(Ok(_)) => {
                let raw = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                tracing::trace!(reply = %line, "cylinder ->");
                Ok(Some(line))
            }
        }
    }

    /// Read the next reply that is not a move completion notice.
    async fn read_reply(&mut self, wait: Duration) -> PhantomResult<Option<String>> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_line(remaining).await? {
                Some(line) if line == "DONE" => {
                    tracing::debug!("Skipping move completion notice");
                }
                other => return Ok(other),
            }
        }
    }

    /// Drop every line that arrived before the next command.
    ///
    /// A completion notice of an earlier non-waiting move would otherwise
    /// be taken as completion of the move about to be sent. An outstanding
    /// REACHED answer found here settles that query.
    async fn discard_stale(&mut self) -> PhantomResult<usize> {
        let mut dropped = 0;
        while let Some(line) = self.read_line(limits::STALE_LINE_WINDOW).await? {
            if self.reached_query_pending && parse_reached(&line).is_ok() {
                self.reached_query_pending = false;
            } else if line == "DONE" {
                tracing::debug!("Discarding stale completion notice");
            } else {
                tracing::warn!(line = %line, "Discarding unsolicited cylinder line");
            }
            dropped += 1;
        }
        Ok(dropped)
    }

    /// Consume the answer of an earlier unanswered REACHED query.
    async fn settle_reached_query(&mut self, wait: Duration) -> PhantomResult<()> {
        if !self.reached_query_pending {
            return Ok(());
        }

        match self.read_reply(wait).await? {
            Some(line) => {
                self.reached_query_pending = false;
                parse_reached(&line).map(|_| ())
            }
            None => Err(PhantomError::timeout(DEVICE, "REACHED", wait)),
        }
    }
}

fn parse_reached(line: &str) -> PhantomResult<ReachState> {
    match line {
        "True" => Ok(ReachState::Reached),
        "False" => Ok(ReachState::Moving),
        other => Err(PhantomError::protocol(
            DEVICE,
            format!("unexpected REACHED reply {other:?}"),
        )),
    }
}

/// Driver for the electric cylinder controller.
///
/// The channel is released by [`disconnect`](Self::disconnect) or when the
/// driver is dropped.
pub struct CylinderDriver {
    config: CylinderConfig,
    /// Path to reopen on `connect`; unset for adopted channels
    port_path: Option<String>,
    link: Mutex<Option<Link>>,
}

impl CylinderDriver {
    /// Resolve the port, open it and wait for the controller to come up.
    ///
    /// # Errors
    /// [`PhantomError::Connection`] if no port is found or it fails to open.
    #[instrument(skip(config), fields(port = ?config.port, usb_id = %config.usb_id), err)]
    pub async fn open(config: CylinderConfig) -> PhantomResult<Self> {
        let port_path = match &config.port {
            Some(path) => path.clone(),
            None => port_resolver::find_port(config.usb_id)
                .map_err(|e| PhantomError::connection(DEVICE, e.to_string()))?,
        };

        let driver = Self {
            config,
            port_path: Some(port_path),
            link: Mutex::new(None),
        };
        driver.connect().await?;
        Ok(driver)
    }

    /// Adopt an already open channel. No settle delay is applied.
    pub fn with_port(port: DynSerial, config: CylinderConfig) -> Self {
        Self {
            config,
            port_path: None,
            link: Mutex::new(Some(Link::new(port))),
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &CylinderConfig {
        &self.config
    }

    /// Open the channel if it is not open. Idempotent.
    pub async fn connect(&self) -> PhantomResult<()> {
        let mut guard = self.link.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let path = self.port_path.as_deref().ok_or_else(|| {
            PhantomError::connection(DEVICE, "adopted channel cannot be reopened")
        })?;
        let mut port = open_serial_async(path, self.config.baud_rate, DEVICE).await?;

        tokio::time::sleep(Duration::from_millis(self.config.connect_settle_ms)).await;
        drain_serial_buffer(&mut port, 50).await;

        tracing::info!(port = path, baud = self.config.baud_rate, "Cylinder connected");
        *guard = Some(Link::new(Box::new(port)));
        Ok(())
    }

    /// Close the channel. Idempotent.
    pub async fn disconnect(&self) {
        if self.link.lock().await.take().is_some() {
            tracing::info!("Cylinder disconnected");
        }
    }

    /// Whether the channel is open.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Move to `position`.
    ///
    /// With `wait` any lines already received are discarded first, then the
    /// call reads the next reply and returns whether it is the `DONE`
    /// notice. Without `wait` it returns `false` right after
    /// sending; completion is polled with
    /// [`position_reached`](Self::position_reached).
    ///
    /// # Errors
    /// - [`PhantomError::Range`] before any I/O if the target is outside travel
    /// - [`PhantomError::Timeout`] if `wait` and nothing arrives within the move timeout
    #[instrument(skip(self), err)]
    pub async fn move_to(&self, position: f64, unit: PositionUnit, wait: bool) -> PhantomResult<bool> {
        let percent = target_percent(position, unit)?;

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(not_connected)?;
        if wait {
            let dropped = link.discard_stale().await?;
            if dropped > 0 {
                tracing::debug!(dropped, "Cleared cylinder input before waiting move");
            }
        }
        link.send(&format!("Z={percent:.1}\n")).await?;

        if !wait {
            return Ok(false);
        }

        let timeout = self.config.move_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = link.read_line(remaining).await? else {
                tracing::warn!(?timeout, "Cylinder move did not report back");
                return Err(PhantomError::timeout(DEVICE, "move", timeout));
            };

            if link.reached_query_pending && parse_reached(&line).is_ok() {
                link.reached_query_pending = false;
                continue;
            }
            return Ok(line == "DONE");
        }
    }

    /// Current position in `unit`.
    #[instrument(skip(self), err)]
    pub async fn get_position(&self, unit: PositionUnit) -> PhantomResult<f64> {
        let timeout = self.config.response_timeout();

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(not_connected)?;
        link.settle_reached_query(timeout).await?;
        link.send("GET\n").await?;

        let line = link
            .read_reply(timeout)
            .await?
            .ok_or_else(|| PhantomError::timeout(DEVICE, "GET", timeout))?;
        let percent: f64 = line.parse().map_err(|_| {
            PhantomError::protocol(DEVICE, format!("position reply {line:?} is not a number"))
        })?;

        Ok(match unit {
            PositionUnit::Cm => percent_to_cm(percent),
            PositionUnit::Percent => percent,
        })
    }

    /// Poll the reached flag once.
    ///
    /// Waits at most the reply window for the answer. If the firmware stays
    /// silent the result is [`ReachState::NoResponse`] and the query stays
    /// outstanding; its late answer is read by the next poll instead of
    /// sending another query.
    #[instrument(skip(self), err)]
    pub async fn position_reached(&self) -> PhantomResult<ReachState> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(not_connected)?;

        if !link.reached_query_pending {
            link.send("REACHED\n").await?;
            link.reached_query_pending = true;
        }

        match link.read_reply(self.config.reply_window()).await? {
            None => Ok(ReachState::NoResponse),
            Some(line) => {
                link.reached_query_pending = false;
                parse_reached(&line)
            }
        }
    }
}

fn not_connected() -> PhantomError {
    PhantomError::NotConnected {
        device: DEVICE.to_string(),
    }
}

impl Drop for CylinderDriver {
    fn drop(&mut self) {
        if self.link.get_mut().take().is_some() {
            tracing::debug!("Cylinder channel closed on drop");
        }
    }
}

#[async_trait]
impl Axis for CylinderDriver {
    fn id(&self) -> AxisId {
        AxisId::Z
    }

    fn check_target(&self, position_cm: f64) -> PhantomResult<()> {
        target_percent(position_cm, PositionUnit::Cm).map(|_| ())
    }

    async fn move_to_cm(&self, position_cm: f64) -> PhantomResult<()> {
        self.move_to(position_cm, PositionUnit::Cm, false).await.map(|_| ())
    }

    async fn position_cm(&self) -> PhantomResult<f64> {
        self.get_position(PositionUnit::Cm).await
    }

    async fn reach_state(&self) -> PhantomResult<ReachState> {
        self.position_reached().await
    }
}
