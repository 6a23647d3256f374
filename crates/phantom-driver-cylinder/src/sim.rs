//! Simulated cylinder firmware.
//!
//! Runs the line protocol of the Arduino controller on a tokio task behind a
//! mock serial port, so the driver and the coordinator can be exercised
//! without hardware. Travel takes a fixed `move_time` regardless of distance.

use parking_lot::Mutex;
use phantom_core::mock_serial::{self, MockDeviceHarness};
use phantom_core::serial::DynSerial;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Behaviour knobs of the simulated firmware.
#[derive(Debug, Clone)]
pub struct SimulatedCylinderOptions {
    /// Time from `Z=` to arrival
    pub move_time: Duration,
    /// Send `DONE` on arrival
    pub notify_done: bool,
    /// Leave REACHED queries unanswered
    pub mute_reached: bool,
    /// Starting position in percent
    pub initial_percent: f64,
}

impl Default for SimulatedCylinderOptions {
    fn default() -> Self {
        Self {
            move_time: Duration::from_millis(200),
            notify_done: true,
            mute_reached: false,
            initial_percent: 0.0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    options: SimulatedCylinderOptions,
    position: f64,
    target: f64,
    arrive_at: Option<Instant>,
    commands: Vec<String>,
}

/// Test-side handle to a running simulated cylinder.
#[derive(Debug, Clone)]
pub struct SimulatedCylinder {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCylinder {
    /// Start the firmware task. Returns the driver-side port and a handle.
    ///
    /// The task ends when the port is dropped.
    pub fn spawn(options: SimulatedCylinderOptions) -> (DynSerial, Self) {
        let (port, harness) = mock_serial::new();
        let state = Arc::new(Mutex::new(SimState {
            position: options.initial_percent,
            target: options.initial_percent,
            options,
            arrive_at: None,
            commands: Vec::new(),
        }));

        tokio::spawn(run(harness, state.clone()));
        (Box::new(port), Self { state })
    }

    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Current position in percent.
    pub fn position_percent(&self) -> f64 {
        self.state.lock().position
    }

    /// Whether a move is in progress.
    pub fn is_moving(&self) -> bool {
        self.state.lock().arrive_at.is_some()
    }

    /// Toggle answering REACHED queries.
    pub fn set_mute_reached(&self, mute: bool) {
        self.state.lock().options.mute_reached = mute;
    }

    /// Change the travel time of subsequent moves.
    pub fn set_move_time(&self, move_time: Duration) {
        self.state.lock().options.move_time = move_time;
    }
}

async fn run(mut harness: MockDeviceHarness, state: Arc<Mutex<SimState>>) {
    loop {
        let arrive_at = state.lock().arrive_at;

        tokio::select! {
            line = harness.next_line() => {
                let Some(line) = line else { break };
                let reply = handle_command(&state, line.trim());
                if let Some(reply) = reply {
                    if harness.send_response(reply.as_bytes()).is_err() {
                        break;
                    }
                }
            }
            _ = sleep_until(arrive_at.unwrap_or_else(Instant::now)), if arrive_at.is_some() => {
                if let Some(notice) = arrive(&state) {
                    if harness.send_response(notice.as_bytes()).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn handle_command(state: &Mutex<SimState>, line: &str) -> Option<String> {
    let mut s = state.lock();
    s.commands.push(line.to_string());

    if let Some(value) = line.strip_prefix("Z=") {
        let target: f64 = value.parse().ok()?;
        s.target = target.clamp(0.0, 100.0);
        s.arrive_at = Some(Instant::now() + s.options.move_time);
        return None;
    }

    match line {
        "GET" => Some(format!("{:.1}\r\n", s.position)),
        "REACHED" if s.options.mute_reached => None,
        "REACHED" => Some(if s.arrive_at.is_none() { "True\r\n" } else { "False\r\n" }.to_string()),
        _ => None,
    }
}

fn arrive(state: &Mutex<SimState>) -> Option<String> {
    let mut s = state.lock();
    s.position = s.target;
    s.arrive_at = None;
    s.options.notify_done.then(|| "DONE\r\n".to_string())
}
