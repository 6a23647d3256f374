//! Stepper driver for the two horizontal phantom axes.
//!
//! Both motors hang off one TMCM-6110 module: motor 0 drives the top carriage
//! (x, 20 cm of travel), motor 1 the bottom carriage (y, 30 cm). Positions are
//! absolute microstep counts from the left reference switch, so [`StepperDriver::home`]
//! has to run once per session before positions mean anything.

use crate::module::TmclModule;
use crate::params::{AxisParameter, GlobalParameter, MotorSettings};
use crate::tmcl::{RfsMode, SerialTmclBus, TmclBus, DEVICE};
use async_trait::async_trait;
use phantom_core::capabilities::{Axis, AxisId, ReachState, TravelRange};
use phantom_core::error::{PhantomError, PhantomResult};
use phantom_core::limits;
use phantom_core::polling::{poll_until, PollPolicy};
use phantom_core::port_resolver::{self, UsbId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Microsteps per cm per microstep-per-full-step.
pub const STEPS_PER_CM_SCALE: f64 = 1000.0;

/// USB id of the TMCM module's virtual COM port.
pub const DEFAULT_USB_ID: UsbId = UsbId::new(0x2a3c, 0x0100);

/// The two phantom motors on the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Motor {
    /// Motor 0, x axis
    Top,
    /// Motor 1, y axis
    Bottom,
}

impl Motor {
    /// Both motors.
    pub const ALL: [Motor; 2] = [Motor::Top, Motor::Bottom];

    /// Motor number on the module.
    pub fn index(self) -> u8 {
        match self {
            Motor::Top => 0,
            Motor::Bottom => 1,
        }
    }

    /// Phantom axis driven by this motor.
    pub fn axis(self) -> AxisId {
        match self {
            Motor::Top => AxisId::X,
            Motor::Bottom => AxisId::Y,
        }
    }

    /// Motor driving `axis`, if it is a stepper axis.
    pub fn for_axis(axis: AxisId) -> Option<Self> {
        match axis {
            AxisId::X => Some(Motor::Top),
            AxisId::Y => Some(Motor::Bottom),
            AxisId::Z => None,
        }
    }
}

/// Configuration for the stepper module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Serial port path. Found by `usb_id` when unset.
    pub port: Option<String>,
    /// USB id used for port discovery
    pub usb_id: UsbId,
    /// Serial baud rate
    pub baud_rate: u32,
    /// TMCL module address
    pub module_address: u8,
    /// Per-request reply timeout (ms)
    pub response_timeout_ms: u64,
    /// Travel of the top carriage (cm)
    pub max_travel_top_cm: f64,
    /// Travel of the bottom carriage (cm)
    pub max_travel_bottom_cm: f64,
    /// Budget for the reference search (ms)
    pub homing_timeout_ms: u64,
    /// Delay between reference switch polls (ms)
    pub homing_poll_interval_ms: u64,
    /// Pause between switch contact and zeroing (ms)
    pub home_settle_ms: u64,
    /// Drive profile for both motors
    pub motor: MotorSettings,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            port: None,
            usb_id: DEFAULT_USB_ID,
            baud_rate: limits::STEPPER_BAUD_RATE,
            module_address: 1,
            response_timeout_ms: limits::RESPONSE_TIMEOUT.as_millis() as u64,
            max_travel_top_cm: 20.0,
            max_travel_bottom_cm: 30.0,
            homing_timeout_ms: limits::HOMING_TIMEOUT.as_millis() as u64,
            homing_poll_interval_ms: limits::POLL_INTERVAL.as_millis() as u64,
            home_settle_ms: limits::HOME_SETTLE.as_millis() as u64,
            motor: MotorSettings::default(),
        }
    }
}

impl StepperConfig {
    /// Travel range of `motor` in cm.
    pub fn travel(&self, motor: Motor) -> TravelRange {
        match motor {
            Motor::Top => TravelRange::new(0.0, self.max_travel_top_cm),
            Motor::Bottom => TravelRange::new(0.0, self.max_travel_bottom_cm),
        }
    }

    fn homing_policy(&self) -> PollPolicy {
        let interval = Duration::from_millis(self.homing_poll_interval_ms);
        PollPolicy {
            initial_interval: interval,
            max_interval: interval,
            backoff_factor: 1.0,
            timeout: Duration::from_millis(self.homing_timeout_ms),
        }
    }
}

/// Convert cm to microsteps at `microsteps` per full step.
pub fn cm_to_microsteps(cm: f64, microsteps: u32) -> i32 {
    (cm * STEPS_PER_CM_SCALE * f64::from(microsteps)).round() as i32
}

/// Convert microsteps back to cm. Exact inverse of [`cm_to_microsteps`] on its image.
pub fn microsteps_to_cm(steps: i32, microsteps: u32) -> f64 {
    f64::from(steps) / (STEPS_PER_CM_SCALE * f64::from(microsteps))
}

/// Driver for the TMCM module carrying both horizontal motors.
pub struct StepperDriver {
    config: StepperConfig,
    module: Mutex<Option<TmclModule>>,
}

impl StepperDriver {
    /// Open the module's serial port and initialise both motors.
    #[instrument(skip(config), fields(port = ?config.port, usb_id = %config.usb_id), err)]
    pub async fn open(config: StepperConfig) -> PhantomResult<Self> {
        let path = match &config.port {
            Some(path) => path.clone(),
            None => port_resolver::find_port(config.usb_id)
                .map_err(|e| PhantomError::connection(DEVICE, e.to_string()))?,
        };
        let bus = SerialTmclBus::open(
            &path,
            config.baud_rate,
            Duration::from_millis(config.response_timeout_ms),
        )
        .await?;
        Self::with_bus(Box::new(bus), config).await
    }

    /// Initialise both motors over an existing bus.
    ///
    /// Sets the switch polarity, stops anything still moving and applies the
    /// drive profile. No move is accepted before this has completed.
    pub async fn with_bus(bus: Box<dyn TmclBus>, config: StepperConfig) -> PhantomResult<Self> {
        let profile = config.motor.profile()?;
        let mut module = TmclModule::new(bus, config.module_address);

        module
            .set_global_parameter(GlobalParameter::EndSwitchPolarity, config.motor.end_switch_polarity)
            .await?;
        for motor in Motor::ALL {
            module.stop(motor.index()).await?;
        }
        for motor in Motor::ALL {
            for (param, value) in &profile {
                module.set_axis_parameter(motor.index(), *param, *value).await?;
            }
        }

        tracing::info!(address = config.module_address, "Stepper module initialised");
        Ok(Self {
            config,
            module: Mutex::new(Some(module)),
        })
    }

    /// Driver configuration.
    pub fn config(&self) -> &StepperConfig {
        &self.config
    }

    /// Convert cm to microsteps using the configured resolution.
    pub fn cm_to_microsteps(&self, cm: f64) -> i32 {
        cm_to_microsteps(cm, self.config.motor.microsteps)
    }

    /// Convert microsteps to cm using the configured resolution.
    pub fn microsteps_to_cm(&self, steps: i32) -> f64 {
        microsteps_to_cm(steps, self.config.motor.microsteps)
    }

    /// Validate a target for `motor` without bus traffic.
    pub fn check_target(&self, dist_cm: f64, motor: Motor) -> PhantomResult<()> {
        self.config
            .travel(motor)
            .check(motor.axis(), dist_cm, "cm")
            .map(|_| ())
    }

    /// Start moving `motor` to `dist_cm` at the configured velocity.
    ///
    /// # Errors
    /// [`PhantomError::Range`] before any bus traffic if `dist_cm` is outside
    /// `[0, max_travel]`.
    #[instrument(skip(self), err)]
    pub async fn move_to_cm(&self, dist_cm: f64, motor: Motor) -> PhantomResult<()> {
        self.check_target(dist_cm, motor)?;
        let steps = self.cm_to_microsteps(dist_cm);

        let mut guard = self.module.lock().await;
        let module = guard.as_mut().ok_or_else(not_connected)?;
        module
            .move_to(motor.index(), steps, self.config.motor.max_velocity)
            .await
    }

    /// Run the reference search on both motors and zero their positions.
    ///
    /// # Errors
    /// [`PhantomError::Timeout`] naming the motors still searching if the
    /// switches are not reached within the homing timeout. Both motors are
    /// stopped before returning.
    #[instrument(skip(self), err)]
    pub async fn home(&self) -> PhantomResult<()> {
        {
            let mut guard = self.module.lock().await;
            let module = guard.as_mut().ok_or_else(not_connected)?;
            for motor in Motor::ALL {
                module.reference_search(motor.index(), RfsMode::Start).await?;
            }
        }
        tracing::info!("Reference search started");

        let policy = self.config.homing_policy();
        if !poll_until(&policy, move || self.all_homed()).await? {
            let mut searching = Vec::new();
            for motor in Motor::ALL {
                if !self.motor_homed(motor).await? {
                    searching.push(format!("{motor:?}"));
                }
            }
            tracing::warn!(?searching, "Reference search timed out, stopping motors");
            self.abort_homing().await?;
            return Err(PhantomError::timeout(
                DEVICE,
                format!("reference search of {}", searching.join(", ")),
                policy.timeout,
            ));
        }

        tokio::time::sleep(Duration::from_millis(self.config.home_settle_ms)).await;

        let mut guard = self.module.lock().await;
        let module = guard.as_mut().ok_or_else(not_connected)?;
        for motor in Motor::ALL {
            module
                .set_axis_parameter(motor.index(), AxisParameter::ActualPosition, 0)
                .await?;
        }
        tracing::info!("Homing complete");
        Ok(())
    }

    async fn abort_homing(&self) -> PhantomResult<()> {
        let mut guard = self.module.lock().await;
        let module = guard.as_mut().ok_or_else(not_connected)?;
        for motor in Motor::ALL {
            module.reference_search(motor.index(), RfsMode::Stop).await?;
            module.stop(motor.index()).await?;
        }
        Ok(())
    }

    /// Whether the left reference switch of `motor` is engaged.
    pub async fn motor_homed(&self, motor: Motor) -> PhantomResult<bool> {
        Ok(self.get(motor, AxisParameter::LeftEndstop).await? >= 1)
    }

    async fn all_homed(&self) -> PhantomResult<bool> {
        for motor in Motor::ALL {
            if !self.motor_homed(motor).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reached flag of one motor.
    pub async fn motor_reached(&self, motor: Motor) -> PhantomResult<bool> {
        Ok(self.get(motor, AxisParameter::PositionReached).await? != 0)
    }

    /// True only if both motors report their target reached.
    pub async fn position_reached(&self) -> PhantomResult<bool> {
        for motor in Motor::ALL {
            if !self.motor_reached(motor).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Actual position of `motor` in cm.
    pub async fn position_cm(&self, motor: Motor) -> PhantomResult<f64> {
        let steps = self.get(motor, AxisParameter::ActualPosition).await?;
        Ok(self.microsteps_to_cm(steps))
    }

    /// Stop `motor`.
    #[instrument(skip(self), err)]
    pub async fn stop(&self, motor: Motor) -> PhantomResult<()> {
        let mut guard = self.module.lock().await;
        guard.as_mut().ok_or_else(not_connected)?.stop(motor.index()).await
    }

    /// Stop both motors.
    pub async fn stop_all(&self) -> PhantomResult<()> {
        for motor in Motor::ALL {
            self.stop(motor).await?;
        }
        Ok(())
    }

    /// Release the bus. Idempotent.
    pub async fn disconnect(&self) {
        if self.module.lock().await.take().is_some() {
            tracing::info!("Stepper module disconnected");
        }
    }

    async fn get(&self, motor: Motor, param: AxisParameter) -> PhantomResult<i32> {
        let mut guard = self.module.lock().await;
        let module = guard.as_mut().ok_or_else(not_connected)?;
        module.get_axis_parameter(motor.index(), param).await
    }
}

fn not_connected() -> PhantomError {
    PhantomError::NotConnected {
        device: DEVICE.to_string(),
    }
}

/// One stepper motor seen as a phantom [`Axis`].
#[derive(Clone)]
pub struct RotaryAxis {
    driver: Arc<StepperDriver>,
    motor: Motor,
}

impl RotaryAxis {
    /// View `motor` of `driver` as an axis.
    pub fn new(driver: Arc<StepperDriver>, motor: Motor) -> Self {
        Self { driver, motor }
    }

    /// Which motor this axis drives.
    pub fn motor(&self) -> Motor {
        self.motor
    }
}

#[async_trait]
impl Axis for RotaryAxis {
    fn id(&self) -> AxisId {
        self.motor.axis()
    }

    fn check_target(&self, position_cm: f64) -> PhantomResult<()> {
        self.driver.check_target(position_cm, self.motor)
    }

    async fn move_to_cm(&self, position_cm: f64) -> PhantomResult<()> {
        self.driver.move_to_cm(position_cm, self.motor).await
    }

    async fn position_cm(&self) -> PhantomResult<f64> {
        self.driver.position_cm(self.motor).await
    }

    async fn reach_state(&self) -> PhantomResult<ReachState> {
        Ok(if self.driver.motor_reached(self.motor).await? {
            ReachState::Reached
        } else {
            ReachState::Moving
        })
    }

    async fn stop(&self) -> PhantomResult<()> {
        self.driver.stop(self.motor).await
    }
}
