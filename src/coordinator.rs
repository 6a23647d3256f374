//! Three-axis coordinator for the water phantom.
//!
//! [`WaterPhantom`] puts the two stepper carriages (x, y) and the optional
//! cylinder (z) into one coordinate space in cm. A move is three independent
//! point-to-point commands; "arrived" means every enabled axis reports its
//! target reached. There is no path blending and no synchronisation beyond
//! that.
//!
//! # State machine
//!
//! ```text
//! connect/from_drivers ──home──► Ready ──move_to_coords──► Moving
//!                                  ▲                          │
//!                                  └──── wait_until_reached ◄─┘
//! ```

use crate::config::{MotionConfig, PhantomConfig};
use phantom_core::capabilities::{Axis, AxisId, ReachState};
use phantom_core::error::{PhantomError, PhantomResult};
use phantom_core::polling::PollPolicy;
use phantom_driver_cylinder::{CylinderDriver, PositionUnit};
use phantom_driver_trinamic::{Motor, RotaryAxis, StepperDriver};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::instrument;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// All axes reported their last target reached
    Ready,
    /// Moves were dispatched and convergence not yet observed
    Moving,
}

/// The water phantom as one three-axis positioner.
pub struct WaterPhantom {
    stepper: Arc<StepperDriver>,
    cylinder: Option<Arc<CylinderDriver>>,
    axes: Vec<Arc<dyn Axis>>,
    motion: MotionConfig,
    state: MotionState,
}

impl WaterPhantom {
    /// Open every configured device and run the startup sequence.
    ///
    /// # Errors
    /// Connection errors of either device, and any error of
    /// [`from_drivers`](Self::from_drivers).
    #[instrument(skip(config), fields(cylinder = config.cylinder.enabled), err)]
    pub async fn connect(config: &PhantomConfig) -> PhantomResult<Self> {
        let cylinder = if config.cylinder.enabled {
            Some(CylinderDriver::open(config.cylinder.driver.clone()).await?)
        } else {
            tracing::info!("Cylinder disabled, z coordinates are ignored");
            None
        };
        let stepper = StepperDriver::open(config.stepper.clone()).await?;

        Self::from_drivers(stepper, cylinder, config.motion.clone()).await
    }

    /// Take ownership of connected drivers and run the startup sequence.
    ///
    /// The cylinder is sent to 0 % without waiting, both steppers are homed,
    /// then every axis must report reached within the startup timeout.
    pub async fn from_drivers(
        stepper: StepperDriver,
        cylinder: Option<CylinderDriver>,
        motion: MotionConfig,
    ) -> PhantomResult<Self> {
        let stepper = Arc::new(stepper);
        let cylinder = cylinder.map(Arc::new);

        let mut axes: Vec<Arc<dyn Axis>> = Motor::ALL
            .into_iter()
            .map(|motor| Arc::new(RotaryAxis::new(stepper.clone(), motor)) as Arc<dyn Axis>)
            .collect();
        if let Some(cylinder) = &cylinder {
            axes.push(cylinder.clone());
        }

        let mut phantom = Self {
            stepper,
            cylinder,
            axes,
            motion,
            state: MotionState::Moving,
        };

        if let Some(cylinder) = &phantom.cylinder {
            cylinder.move_to(0.0, PositionUnit::Percent, false).await?;
        }
        phantom.stepper.home().await?;

        let policy = phantom.motion.startup_policy();
        phantom.wait_with(&policy).await?;
        tracing::info!(axes = phantom.axes.len(), "Water phantom ready");
        Ok(phantom)
    }

    /// Current coordinator state.
    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Whether the z axis is fitted.
    pub fn has_cylinder(&self) -> bool {
        self.cylinder.is_some()
    }

    /// Enabled axes in dispatch order.
    pub fn axis_ids(&self) -> Vec<AxisId> {
        self.axes.iter().map(|a| a.id()).collect()
    }

    /// Move to `(x, y, z)` in cm.
    ///
    /// `x` goes to the top carriage, `y` to the bottom carriage and `|z|` to
    /// the cylinder if it is enabled. Every target is validated before the
    /// first command is sent, so a [`PhantomError::Range`] leaves the rig
    /// untouched. With `block` the call returns once all axes report reached;
    /// otherwise it returns right after dispatch.
    #[instrument(skip(self), err)]
    pub async fn move_to_coords(&mut self, x: f64, y: f64, z: f64, block: bool) -> PhantomResult<()> {
        let targets: Vec<(Arc<dyn Axis>, f64)> = self
            .axes
            .iter()
            .map(|axis| {
                let target = match axis.id() {
                    AxisId::X => x,
                    AxisId::Y => y,
                    AxisId::Z => z.abs(),
                };
                (axis.clone(), target)
            })
            .collect();

        for (axis, target) in &targets {
            axis.check_target(*target)?;
        }

        self.state = MotionState::Moving;
        for (axis, target) in &targets {
            tracing::debug!(axis = %axis.id(), target, "Dispatching move");
            axis.move_to_cm(*target).await?;
        }

        if block {
            self.wait_until_reached().await?;
        }
        Ok(())
    }

    /// Poll until every enabled axis reports reached.
    ///
    /// # Errors
    /// [`PhantomError::PartialMove`] naming the axes that did and did not
    /// arrive if the move timeout expires.
    pub async fn wait_until_reached(&mut self) -> PhantomResult<()> {
        let policy = self.motion.move_policy();
        self.wait_with(&policy).await
    }

    async fn wait_with(&mut self, policy: &PollPolicy) -> PhantomResult<()> {
        let deadline = Instant::now() + policy.timeout;
        let mut backoff = policy.backoff();

        loop {
            let states = self.axis_states().await?;
            if states.iter().all(|(_, s)| s.is_reached()) {
                self.state = MotionState::Ready;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let reached: Vec<AxisId> = states
                    .iter()
                    .filter(|(_, s)| s.is_reached())
                    .map(|(id, _)| *id)
                    .collect();
                let pending: Vec<AxisId> = states
                    .iter()
                    .filter(|(_, s)| !s.is_reached())
                    .map(|(id, _)| *id)
                    .collect();
                tracing::warn!(?reached, ?pending, timeout = ?policy.timeout, "Move did not converge");
                return Err(PhantomError::PartialMove {
                    reached,
                    pending,
                    timeout: policy.timeout,
                });
            }

            sleep(backoff.next_delay().min(deadline - now)).await;
        }
    }

    /// True iff every enabled axis reports reached.
    pub async fn position_reached(&self) -> PhantomResult<bool> {
        for axis in &self.axes {
            if !axis.is_reached().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One reached poll per enabled axis.
    pub async fn axis_states(&self) -> PhantomResult<Vec<(AxisId, ReachState)>> {
        let mut states = Vec::with_capacity(self.axes.len());
        for axis in &self.axes {
            states.push((axis.id(), axis.reach_state().await?));
        }
        Ok(states)
    }

    /// Reported position of every enabled axis in cm.
    pub async fn positions(&self) -> PhantomResult<Vec<(AxisId, f64)>> {
        let mut positions = Vec::with_capacity(self.axes.len());
        for axis in &self.axes {
            positions.push((axis.id(), axis.position_cm().await?));
        }
        Ok(positions)
    }

    /// Stop every axis that can be stopped. Axes without a stop command keep
    /// running to their target.
    #[instrument(skip(self), err)]
    pub async fn stop(&mut self) -> PhantomResult<()> {
        for axis in &self.axes {
            match axis.stop().await {
                Ok(()) => {}
                Err(PhantomError::Unsupported { .. }) => {
                    tracing::debug!(axis = %axis.id(), "Axis cannot be stopped, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        self.state = MotionState::Ready;
        Ok(())
    }

    /// Stop the motors and release both channels.
    ///
    /// Channels are released even if stopping fails; the stop error is
    /// returned afterwards.
    pub async fn shutdown(self) -> PhantomResult<()> {
        let stopped = self.stepper.stop_all().await;
        if let Err(e) = &stopped {
            tracing::warn!(error = %e, "Failed to stop stepper motors during shutdown");
        }

        self.close_channels().await;
        tracing::info!("Water phantom shut down");
        stopped
    }

    /// Release both channels without stopping anything. Moves already
    /// dispatched keep running on the controllers.
    pub async fn release(self) {
        self.close_channels().await;
        tracing::info!(state = ?self.state, "Water phantom released, motors left running");
    }

    /// End a session after `outcome`.
    ///
    /// A successful non-blocking dispatch leaves the axes travelling, so the
    /// channels are only released. Anything else is a full
    /// [`shutdown`](Self::shutdown). A failed `outcome` takes precedence over
    /// a failed shutdown.
    pub async fn finish(self, outcome: PhantomResult<()>) -> PhantomResult<()> {
        if outcome.is_ok() && self.state == MotionState::Moving {
            self.release().await;
            return Ok(());
        }

        let stopped = self.shutdown().await;
        match outcome {
            Err(e) => {
                if let Err(stop_err) = stopped {
                    tracing::warn!(error = %stop_err, "Shutdown after failed operation also failed");
                }
                Err(e)
            }
            Ok(()) => stopped,
        }
    }

    async fn close_channels(&self) {
        self.stepper.disconnect().await;
        if let Some(cylinder) = &self.cylinder {
            cylinder.disconnect().await;
        }
    }
}
