//! Simulated TMCM module.
//!
//! Implements [`TmclBus`] in memory. Motion is modelled in bus transactions
//! rather than time: every request advances all motors by one tick, a move
//! finishes after `move_ticks` ticks and a reference search after
//! `homing_ticks`. This keeps tests deterministic under any scheduler.

use crate::params::AxisParameter;
use crate::tmcl::{RfsMode, TmclBus, TmclCommand, TmclReply, TmclRequest, TmclStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use phantom_core::error::PhantomResult;
use std::collections::HashMap;
use std::sync::Arc;

/// Firmware version reported by the simulator.
pub const SIM_FIRMWARE_VERSION: i32 = 6110;

/// Actual position a motor reports when its reference search ends. The
/// module does not zero the counter itself.
pub const SIM_SWITCH_POSITION: i32 = -1_234;

/// Behaviour knobs of the simulated module.
#[derive(Debug, Clone)]
pub struct SimulatedTmcmOptions {
    /// Ticks from MVP to arrival
    pub move_ticks: u32,
    /// Ticks from RFS start to the left switch engaging
    pub homing_ticks: u32,
    /// Reference search never finds the switch
    pub fail_homing: bool,
    /// Moves never arrive
    pub stall: bool,
    /// Actual position each motor reports before homing
    pub initial_position: i32,
    /// Answer MST with "command not available"
    pub reject_stop: bool,
}

impl Default for SimulatedTmcmOptions {
    fn default() -> Self {
        Self {
            move_ticks: 3,
            homing_ticks: 5,
            fail_homing: false,
            stall: false,
            initial_position: 12_345,
            reject_stop: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SimMotor {
    actual: i32,
    target: i32,
    moving_ticks: Option<u32>,
    homing_ticks: Option<u32>,
    left_endstop: bool,
}

impl SimMotor {
    fn tick(&mut self) {
        if let Some(left) = self.moving_ticks {
            if left <= 1 {
                self.actual = self.target;
                self.moving_ticks = None;
            } else {
                self.moving_ticks = Some(left - 1);
            }
        }

        if let Some(left) = self.homing_ticks {
            if left <= 1 {
                self.left_endstop = true;
                self.actual = SIM_SWITCH_POSITION;
                self.target = SIM_SWITCH_POSITION;
                self.homing_ticks = None;
            } else {
                self.homing_ticks = Some(left - 1);
            }
        }
    }

    fn reached(&self) -> bool {
        self.moving_ticks.is_none() && self.homing_ticks.is_none()
    }
}

#[derive(Debug)]
struct SimState {
    options: SimulatedTmcmOptions,
    motors: HashMap<u8, SimMotor>,
    axis_params: HashMap<(u8, u8), i32>,
    global_params: HashMap<(u8, u8), i32>,
    requests: Vec<TmclRequest>,
}

impl SimState {
    fn motor(&mut self, motor: u8) -> &mut SimMotor {
        let initial = self.options.initial_position;
        self.motors.entry(motor).or_insert_with(|| SimMotor {
            actual: initial,
            target: initial,
            ..SimMotor::default()
        })
    }

    fn handle(&mut self, req: &TmclRequest) -> Result<i32, TmclStatus> {
        let Some(command) = TmclCommand::from_number(req.command) else {
            return Err(TmclStatus::InvalidCommand);
        };
        let stall = self.options.stall;
        let move_ticks = self.options.move_ticks;
        let homing_ticks = (!self.options.fail_homing).then_some(self.options.homing_ticks);

        match command {
            TmclCommand::Mvp => {
                let m = self.motor(req.motor);
                m.target = req.value;
                m.left_endstop = false;
                m.moving_ticks = if stall { Some(u32::MAX) } else { Some(move_ticks.max(1)) };
                Ok(0)
            }
            TmclCommand::Mst if self.options.reject_stop => Err(TmclStatus::CommandNotAvailable),
            TmclCommand::Mst => {
                let m = self.motor(req.motor);
                m.target = m.actual;
                m.moving_ticks = None;
                m.homing_ticks = None;
                Ok(0)
            }
            TmclCommand::Ror | TmclCommand::Rol => Ok(0),
            TmclCommand::Sap => {
                if req.kind == AxisParameter::ActualPosition.number() {
                    self.motor(req.motor).actual = req.value;
                } else if req.kind == AxisParameter::PositionReached.number() {
                    return Err(TmclStatus::WrongType);
                }
                self.axis_params.insert((req.motor, req.kind), req.value);
                Ok(0)
            }
            TmclCommand::Gap => {
                let kind = req.kind;
                let stored = self.axis_params.get(&(req.motor, kind)).copied();
                let m = self.motor(req.motor);
                Ok(match kind {
                    k if k == AxisParameter::TargetPosition.number() => m.target,
                    k if k == AxisParameter::ActualPosition.number() => m.actual,
                    k if k == AxisParameter::PositionReached.number() => i32::from(m.reached()),
                    k if k == AxisParameter::LeftEndstop.number() => i32::from(m.left_endstop),
                    k if k == AxisParameter::RightEndstop.number() => 0,
                    _ => stored.unwrap_or(0),
                })
            }
            TmclCommand::Sgp => {
                self.global_params.insert((req.kind, req.motor), req.value);
                Ok(0)
            }
            TmclCommand::Ggp => Ok(self
                .global_params
                .get(&(req.kind, req.motor))
                .copied()
                .unwrap_or(0)),
            TmclCommand::Rfs => {
                let m = self.motor(req.motor);
                match req.kind {
                    k if k == RfsMode::Start as u8 => {
                        m.left_endstop = false;
                        m.moving_ticks = None;
                        m.homing_ticks = Some(homing_ticks.map_or(u32::MAX, |t| t.max(1)));
                        Ok(0)
                    }
                    k if k == RfsMode::Stop as u8 => {
                        m.homing_ticks = None;
                        Ok(0)
                    }
                    k if k == RfsMode::Status as u8 => Ok(i32::from(m.homing_ticks.is_some())),
                    _ => Err(TmclStatus::WrongType),
                }
            }
            TmclCommand::FirmwareVersion => Ok(SIM_FIRMWARE_VERSION),
        }
    }
}

/// In-memory TMCM module. Hand it to a driver as its bus.
pub struct SimulatedTmcm {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedTmcm`].
#[derive(Clone)]
pub struct SimulatedTmcmHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTmcm {
    /// Create a module and a handle onto its state.
    pub fn new(options: SimulatedTmcmOptions) -> (Self, SimulatedTmcmHandle) {
        let state = Arc::new(Mutex::new(SimState {
            options,
            motors: HashMap::new(),
            axis_params: HashMap::new(),
            global_params: HashMap::new(),
            requests: Vec::new(),
        }));
        (
            Self {
                state: state.clone(),
            },
            SimulatedTmcmHandle { state },
        )
    }
}

#[async_trait]
impl TmclBus for SimulatedTmcm {
    async fn transact(&mut self, request: TmclRequest) -> PhantomResult<TmclReply> {
        let mut state = self.state.lock();
        state.requests.push(request);
        for motor in state.motors.values_mut() {
            motor.tick();
        }

        let (status, value) = match state.handle(&request) {
            Ok(value) => (TmclStatus::Ok, value),
            Err(status) => (status, 0),
        };

        Ok(TmclReply {
            reply_address: 2,
            module_address: request.address,
            status,
            command: request.command,
            value,
        })
    }
}

impl SimulatedTmcmHandle {
    /// Every request received so far.
    pub fn requests(&self) -> Vec<TmclRequest> {
        self.state.lock().requests.clone()
    }

    /// Forget the request log.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Last value written to an axis parameter.
    pub fn axis_parameter(&self, motor: u8, param: AxisParameter) -> Option<i32> {
        self.state.lock().axis_params.get(&(motor, param.number())).copied()
    }

    /// Actual position of `motor` in microsteps.
    pub fn actual_position(&self, motor: u8) -> i32 {
        self.state.lock().motor(motor).actual
    }

    /// Target position of `motor` in microsteps.
    pub fn target_position(&self, motor: u8) -> i32 {
        self.state.lock().motor(motor).target
    }

    /// Whether `motor` is moving or searching.
    pub fn is_busy(&self, motor: u8) -> bool {
        !self.state.lock().motor(motor).reached()
    }

    /// Make subsequent moves never arrive.
    pub fn set_stall(&self, stall: bool) {
        self.state.lock().options.stall = stall;
    }

    /// Make subsequent reference searches never finish.
    pub fn set_fail_homing(&self, fail: bool) {
        self.state.lock().options.fail_homing = fail;
    }

    /// Make the module refuse motor stop commands.
    pub fn set_reject_stop(&self, reject: bool) {
        self.state.lock().options.reject_stop = reject;
    }

    /// Change the number of ticks subsequent moves take.
    pub fn set_move_ticks(&self, ticks: u32) {
        self.state.lock().options.move_ticks = ticks;
    }
}
