//! In-process GCS controller simulation.
//!
//! Answers the command subset the driver uses over a `tokio::io::duplex`
//! pair, with enough fidelity to exercise the busy contract, the homing
//! interlock and error propagation without hardware:
//!
//! - `MOV`/`MVR` before `FRF` are rejected with [`codes::NOT_REFERENCED`]
//! - after an accepted move, the next `busy_polls` position queries answer
//!   with the travel limit in the direction of motion
//! - `FRF` returns at once; `FRF?` reports the axis referenced only after
//!   `reference_delay`, and the axis counts as moving until then
//! - multi-axis forms (`MOV 1 5 2 6`, `POS? 1 2`, `SPA? 1 0xE 2 0xE`) are
//!   answered one line per axis
//! - `RBT` drops every reference; a configured startup macro then shows in
//!   `RMC?` for a number of polls
//! - errors are latched and reported (then cleared) by `ERR?`
//!
//! Used by integration tests and by the `--simulate` mode of the demo binary.

use crate::axis::{AxisId, TravelLimits};
use crate::codec::{self, params, Command, ParamValue};
use parking_lot::Mutex;
use stage_core::serial::{SerialTransport, Transport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::Instant;

/// Controller error numbers produced by the simulation.
pub mod codes {
    pub const UNKNOWN_COMMAND: i32 = 2;
    pub const NOT_REFERENCED: i32 = 5;
    pub const OUT_OF_LIMITS: i32 = 7;
    pub const INVALID_AXIS: i32 = 15;
    pub const VALUE_OUT_OF_RANGE: i32 = 17;
    pub const ILLEGAL_PARAMETER: i32 = 56;
}

/// Parameter values every simulated axis starts with.
const DEFAULT_PARAMS: &[(u32, f64)] = &[
    (params::COUNTS_PER_UNIT_DENOMINATOR, 1.0),
    (params::MAX_VELOCITY, 200.0),
    (params::MAX_ACCELERATION, 5000.0),
    (params::MAX_DECELERATION, 5000.0),
    (params::SETTLING_TIME, 0.05),
    (params::WINDOW_ENTER, 9.0),
    (params::WINDOW_EXIT, 10.0),
    (params::WINDOW_EXIT_LIMIT, 100.0),
];

#[derive(Debug, Clone)]
struct SimAxis {
    limits: TravelLimits,
    position: f64,
    target: f64,
    busy_remaining: u32,
    referenced: bool,
    /// Set while a reference move runs
    reference_done_at: Option<Instant>,
    servo: bool,
    joystick: bool,
    velocity: f64,
    acceleration: f64,
    deceleration: f64,
    params: BTreeMap<u32, f64>,
}

impl SimAxis {
    fn new(limits: TravelLimits, referenced: bool, counts_per_mm: u32) -> Self {
        let start = 0.0_f64.clamp(limits.min_mm, limits.max_mm);
        let mut params: BTreeMap<u32, f64> = DEFAULT_PARAMS.iter().copied().collect();
        params.insert(params::COUNTS_PER_UNIT_NUMERATOR, f64::from(counts_per_mm));
        Self {
            limits,
            position: start,
            target: start,
            busy_remaining: 0,
            referenced,
            reference_done_at: None,
            servo: false,
            joystick: false,
            velocity: 10.0,
            acceleration: 1000.0,
            deceleration: 1000.0,
            params,
        }
    }

    fn is_moving(&self) -> bool {
        self.busy_remaining > 0 || self.reference_done_at.is_some()
    }

    /// Limit reported while moving: the one the stage is travelling toward.
    fn busy_limit(&self) -> f64 {
        if self.target >= self.position {
            self.limits.max_mm
        } else {
            self.limits.min_mm
        }
    }

    fn park_at_reference(&mut self) {
        self.position = 0.0_f64.clamp(self.limits.min_mm, self.limits.max_mm);
        self.target = self.position;
        self.busy_remaining = 0;
    }
}

#[derive(Debug)]
struct SimState {
    identity: String,
    unit: String,
    axes: BTreeMap<AxisId, SimAxis>,
    /// Axis order for the motion status bitmask
    order: Vec<AxisId>,
    busy_polls: u32,
    reference_delay: Duration,
    /// `RMC?` polls the startup macro stays visible for after `RBT`
    startup_polls: u32,
    startup_references: bool,
    startup_remaining: u32,
    last_error: i32,
    forced_error: Option<i32>,
    silent: bool,
    received: Vec<String>,
}

fn line(text: impl Into<String>) -> Option<String> {
    let mut text = text.into();
    text.push('\n');
    Some(text)
}

impl SimState {
    fn fail(&mut self, code: i32) {
        if self.last_error == 0 {
            self.last_error = code;
        }
    }

    /// Finish reference moves whose time is up.
    fn settle_references(&mut self) {
        let now = Instant::now();
        for a in self.axes.values_mut() {
            if a.reference_done_at.is_some_and(|at| at <= now) {
                a.reference_done_at = None;
                a.referenced = true;
                a.park_at_reference();
            }
        }
    }

    fn handle(&mut self, request: &[u8]) -> Option<String> {
        let command = codec::parse_command(request)?;
        self.received.push(command.to_string());
        self.settle_references();

        if !matches!(command, Command::ErrorQuery | Command::MotionStatus) {
            if let Some(code) = self.forced_error.take() {
                self.fail(code);
                return None;
            }
        }
        self.execute(command)
    }

    fn execute(&mut self, command: Command) -> Option<String> {
        match command {
            Command::ErrorQuery => line(std::mem::take(&mut self.last_error).to_string()),
            Command::Identify => line(self.identity.clone()),
            Command::Move(axis, target) => {
                self.start_move(&axis, |_| target);
                None
            }
            Command::MoveRelative(axis, delta) => {
                self.start_move(&axis, |a| a.target + delta);
                None
            }
            Command::Query(axis) => match self.axes.get_mut(&axis) {
                Some(a) if a.busy_remaining > 0 => {
                    a.busy_remaining -= 1;
                    let reported = a.busy_limit();
                    if a.busy_remaining == 0 {
                        a.position = a.target;
                    }
                    line(format!("{}={:.9}", axis, reported))
                }
                Some(a) => line(format!("{}={:.9}", axis, a.position)),
                None => {
                    self.fail(codes::INVALID_AXIS);
                    None
                }
            },
            Command::Home(axis) => {
                let done_at = Instant::now() + self.reference_delay;
                match self.axes.get_mut(&axis) {
                    Some(a) => {
                        a.referenced = false;
                        a.busy_remaining = 0;
                        a.reference_done_at = Some(done_at);
                    }
                    None => self.fail(codes::INVALID_AXIS),
                }
                self.settle_references();
                None
            }
            Command::QueryReferenced(axis) => match self.axes.get(&axis) {
                Some(a) => line(format!("{}={}", axis, u8::from(a.referenced))),
                None => {
                    self.fail(codes::INVALID_AXIS);
                    None
                }
            },
            Command::QueryMinLimit(axis) => self.axis_reply(&axis, |a| a.limits.min_mm),
            Command::QueryMaxLimit(axis) => self.axis_reply(&axis, |a| a.limits.max_mm),
            Command::QueryVelocity(axis) => self.axis_reply(&axis, |a| a.velocity),
            Command::QueryAcceleration(axis) => self.axis_reply(&axis, |a| a.acceleration),
            Command::QueryDeceleration(axis) => self.axis_reply(&axis, |a| a.deceleration),
            Command::QueryParameter(axis, param) => {
                let Some(a) = self.axes.get(&axis) else {
                    self.fail(codes::INVALID_AXIS);
                    return None;
                };
                let value = match param {
                    params::UNIT => self.unit.clone(),
                    id => match a.params.get(&id) {
                        Some(value) => value.to_string(),
                        None => {
                            self.fail(codes::ILLEGAL_PARAMETER);
                            return None;
                        }
                    },
                };
                line(format!("{} 0x{:X}={}", axis, param, value))
            }
            Command::SetParameter(axis, param, value) => {
                let value = match value {
                    ParamValue::Int(n) => Some(n as f64),
                    ParamValue::Float(v) => Some(v),
                    ParamValue::Text(_) => None,
                }
                .filter(|_| param != params::UNIT);
                let rejected = match (self.axes.get_mut(&axis), value) {
                    (Some(a), Some(value)) => {
                        a.params.insert(param, value);
                        None
                    }
                    (Some(_), None) => Some(codes::ILLEGAL_PARAMETER),
                    (None, _) => Some(codes::INVALID_AXIS),
                };
                if let Some(code) = rejected {
                    self.fail(code);
                }
                None
            }
            Command::SetVelocity(axis, value) => {
                self.set_rate(&axis, value, params::MAX_VELOCITY, |a, v| a.velocity = v)
            }
            Command::SetAcceleration(axis, value) => {
                self.set_rate(&axis, value, params::MAX_ACCELERATION, |a, v| {
                    a.acceleration = v
                })
            }
            Command::SetDeceleration(axis, value) => {
                self.set_rate(&axis, value, params::MAX_DECELERATION, |a, v| {
                    a.deceleration = v
                })
            }
            Command::Servo(axis, on) => {
                match self.axes.get_mut(&axis) {
                    Some(a) => a.servo = on,
                    None => self.fail(codes::INVALID_AXIS),
                }
                None
            }
            Command::Joystick(axis, on) => {
                match self.axes.get_mut(&axis) {
                    Some(a) => a.joystick = on,
                    None => self.fail(codes::INVALID_AXIS),
                }
                None
            }
            Command::MotionStatus => {
                let mask = self
                    .order
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| self.axes.get(*id).is_some_and(SimAxis::is_moving))
                    .fold(0u32, |mask, (bit, _)| mask | (1 << bit));
                line(format!("{:X}", mask))
            }
            Command::Reboot => {
                for a in self.axes.values_mut() {
                    a.referenced = false;
                    a.reference_done_at = None;
                    a.servo = false;
                    a.joystick = false;
                    a.busy_remaining = 0;
                    a.target = a.position;
                }
                self.last_error = 0;
                self.startup_remaining = self.startup_polls;
                None
            }
            Command::RunningMacros => {
                if self.startup_remaining == 0 {
                    return line("");
                }
                self.startup_remaining -= 1;
                if self.startup_remaining == 0 && self.startup_references {
                    for a in self.axes.values_mut() {
                        a.referenced = true;
                        a.park_at_reference();
                    }
                }
                line("STARTUP")
            }
            Command::RawMacroCommand(text) => self.execute_raw(&text),
        }
    }

    /// Multi-axis forms and the argument-less `FRF`.
    fn execute_raw(&mut self, text: &str) -> Option<String> {
        if text.split_whitespace().eq(["FRF"]) {
            for id in self.order.clone() {
                self.execute(Command::Home(id));
            }
            return None;
        }

        match codec::split_per_axis(text) {
            Some(commands) if commands.len() > 1 => {
                let lines: Vec<String> = commands
                    .into_iter()
                    .filter_map(|command| self.execute(command))
                    .map(|reply| reply.trim_end().to_string())
                    .collect();
                if lines.is_empty() {
                    None
                } else {
                    line(lines.join(" \n"))
                }
            }
            _ => {
                self.fail(codes::UNKNOWN_COMMAND);
                None
            }
        }
    }

    fn start_move(&mut self, axis: &AxisId, target: impl FnOnce(&SimAxis) -> f64) {
        let busy_polls = self.busy_polls;
        let Some(a) = self.axes.get_mut(axis) else {
            self.fail(codes::INVALID_AXIS);
            return;
        };
        if !a.referenced {
            self.fail(codes::NOT_REFERENCED);
            return;
        }
        let target = target(a);
        if !a.limits.contains(target) {
            self.fail(codes::OUT_OF_LIMITS);
            return;
        }
        a.target = target;
        if busy_polls == 0 {
            a.position = target;
        } else {
            a.busy_remaining = busy_polls;
        }
    }

    fn set_rate(
        &mut self,
        axis: &AxisId,
        value: f64,
        max_param: u32,
        store: fn(&mut SimAxis, f64),
    ) -> Option<String> {
        let rejected = match self.axes.get_mut(axis) {
            Some(a) => {
                let max = a.params.get(&max_param).copied().unwrap_or(f64::INFINITY);
                if value.is_finite() && (0.0..=max).contains(&value) {
                    store(a, value);
                    None
                } else {
                    Some(codes::VALUE_OUT_OF_RANGE)
                }
            }
            None => Some(codes::INVALID_AXIS),
        };
        if let Some(code) = rejected {
            self.fail(code);
        }
        None
    }

    fn axis_reply(&mut self, axis: &AxisId, value: impl FnOnce(&SimAxis) -> f64) -> Option<String> {
        match self.axes.get(axis) {
            Some(a) => line(format!("{}={:.9}", axis, value(a))),
            None => {
                self.fail(codes::INVALID_AXIS);
                None
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configuration of a simulated controller.
#[derive(Debug, Clone)]
pub struct SimulatedController {
    identity: String,
    unit: String,
    counts_per_mm: u32,
    axes: Vec<(AxisId, TravelLimits)>,
    busy_polls: u32,
    reference_delay: Duration,
    referenced: bool,
    startup_polls: u32,
    startup_references: bool,
}

impl Default for SimulatedController {
    /// Two 25 mm axes, "1" and "2", not referenced.
    fn default() -> Self {
        let axis = |id: &str| AxisId::parse(id).map(|id| (id, TravelLimits::new(0.0, 25.0)));
        Self {
            identity: "(c)2015-2023 Physik Instrumente (PI) GmbH & Co. KG, C-867.2U2, 0, 1.0.0 (simulated)"
                .to_string(),
            unit: "MM".to_string(),
            counts_per_mm: 10_000,
            axes: ["1", "2"].into_iter().filter_map(|id| axis(id).ok()).collect(),
            busy_polls: 1,
            reference_delay: Duration::ZERO,
            referenced: false,
            startup_polls: 0,
            startup_references: false,
        }
    }
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the axis table.
    pub fn with_axes(mut self, axes: Vec<(AxisId, TravelLimits)>) -> Self {
        self.axes = axes;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Unit string reported for parameter 0x07000601.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Number of position queries answered with a travel limit after each
    /// accepted move.
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Time a reference move takes before `FRF?` reports it done.
    pub fn with_reference_delay(mut self, delay: Duration) -> Self {
        self.reference_delay = delay;
        self
    }

    /// Start with every axis already referenced.
    pub fn referenced(mut self, referenced: bool) -> Self {
        self.referenced = referenced;
        self
    }

    /// Startup macro run after `RBT`: listed by `RMC?` for `polls` polls,
    /// optionally referencing every axis when it ends.
    pub fn with_startup_macro(mut self, polls: u32, references: bool) -> Self {
        self.startup_polls = polls;
        self.startup_references = references;
        self
    }

    /// Start serving on a background task. The task ends when the returned
    /// transport is dropped.
    pub fn spawn(self) -> (Box<dyn Transport>, SimHandle) {
        let (host, device) = tokio::io::duplex(1024);

        let axes = self
            .axes
            .iter()
            .map(|(id, limits)| {
                let axis = SimAxis::new(*limits, self.referenced, self.counts_per_mm);
                (id.clone(), axis)
            })
            .collect();

        let state = Arc::new(Mutex::new(SimState {
            identity: self.identity,
            unit: self.unit,
            axes,
            order: self.axes.into_iter().map(|(id, _)| id).collect(),
            busy_polls: self.busy_polls,
            reference_delay: self.reference_delay,
            startup_polls: self.startup_polls,
            startup_references: self.startup_references,
            startup_remaining: 0,
            last_error: 0,
            forced_error: None,
            silent: false,
            received: Vec::new(),
        }));

        tokio::spawn(serve(device, state.clone()));

        let transport: Box<dyn Transport> = Box::new(SerialTransport::new(Box::new(host)));
        (transport, SimHandle { state })
    }
}

async fn serve(device: DuplexStream, state: Arc<Mutex<SimState>>) {
    let mut device = BufReader::new(device);

    loop {
        let first = match device.fill_buf().await {
            Ok([first, ..]) => *first,
            _ => break,
        };

        let request = if first == codec::MOTION_STATUS_REQUEST {
            device.consume(1);
            vec![codec::MOTION_STATUS_REQUEST]
        } else {
            let mut line = Vec::new();
            match device.read_until(codec::TERMINATOR, &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => line,
            }
        };

        let reply = {
            let mut state = state.lock();
            let reply = state.handle(&request);
            reply.filter(|_| !state.silent)
        };

        if let Some(text) = reply {
            if device.get_mut().write_all(text.as_bytes()).await.is_err() {
                break;
            }
        }
    }
    tracing::trace!("Simulated controller stopped");
}

// =============================================================================
// Handle
// =============================================================================

/// Test-side view into a running simulation.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_busy_polls(&self, polls: u32) {
        self.state.lock().busy_polls = polls;
    }

    /// Make the next non-`ERR?` command fail with `code`.
    pub fn fail_next_command(&self, code: i32) {
        self.state.lock().forced_error = Some(code);
    }

    /// Stop replying (commands are still received and logged).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn set_reference_delay(&self, delay: Duration) {
        self.state.lock().reference_delay = delay;
    }

    /// Change an axis's soft limits, as a `TMN`/`TMX` edit from another
    /// tool would.
    pub fn set_limits(&self, axis: &str, limits: TravelLimits) {
        if let Some(a) = self.state.lock().axes.get_mut(axis) {
            a.limits = limits;
        }
    }

    /// True stage position, which the driver may not know.
    pub fn position(&self, axis: &str) -> Option<f64> {
        self.state.lock().axes.get(axis).map(|a| a.position)
    }

    pub fn is_referenced(&self, axis: &str) -> bool {
        let mut state = self.state.lock();
        state.settle_references();
        state.axes.get(axis).is_some_and(|a| a.referenced)
    }

    pub fn servo(&self, axis: &str) -> bool {
        self.state.lock().axes.get(axis).is_some_and(|a| a.servo)
    }

    pub fn joystick(&self, axis: &str) -> bool {
        self.state.lock().axes.get(axis).is_some_and(|a| a.joystick)
    }

    pub fn velocity(&self, axis: &str) -> Option<f64> {
        self.state.lock().axes.get(axis).map(|a| a.velocity)
    }

    /// Stored value of a numeric parameter.
    pub fn parameter(&self, axis: &str, param: u32) -> Option<f64> {
        self.state
            .lock()
            .axes
            .get(axis)
            .and_then(|a| a.params.get(&param).copied())
    }

    /// Move the stage behind the driver's back, as the joystick would.
    pub fn jog(&self, axis: &str, delta_mm: f64) {
        if let Some(a) = self.state.lock().axes.get_mut(axis) {
            a.position = (a.position + delta_mm).clamp(a.limits.min_mm, a.limits.max_mm);
            a.target = a.position;
        }
    }

    /// Every command received so far, in wire text.
    pub fn commands_received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(link: &mut Box<dyn Transport>, command: &str) -> String {
        link.write_all(format!("{command}\n").as_bytes()).await.unwrap();
        let line = link
            .read_until(b'\n', Duration::from_millis(200))
            .await
            .unwrap();
        String::from_utf8(line).unwrap().trim_end().to_string()
    }

    #[tokio::test]
    async fn test_move_before_reference_latches_error() {
        let (mut link, sim) = SimulatedController::new().spawn();

        link.write_all(b"MOV 1 5.0\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "5");
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert_eq!(sim.position("1"), Some(0.0));
    }

    #[tokio::test]
    async fn test_busy_polls_report_limit_then_target() {
        let (mut link, sim) = SimulatedController::new()
            .referenced(true)
            .with_busy_polls(2)
            .spawn();

        link.write_all(b"MOV 2 10.0\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert_eq!(exchange(&mut link, "POS? 2").await, "2=25.000000000");
        assert_eq!(exchange(&mut link, "POS? 2").await, "2=25.000000000");
        assert_eq!(exchange(&mut link, "POS? 2").await, "2=10.000000000");
        assert_eq!(sim.position("2"), Some(10.0));
    }

    #[tokio::test]
    async fn test_parameter_and_limit_queries() {
        let (mut link, _sim) = SimulatedController::new().spawn();

        assert_eq!(exchange(&mut link, "SPA? 1 0x7000601").await, "1 0x7000601=MM");
        assert_eq!(exchange(&mut link, "SPA? 1 0xE").await, "1 0xE=10000");
        assert_eq!(exchange(&mut link, "SPA? 2 0xA").await, "2 0xA=200");
        assert_eq!(exchange(&mut link, "TMX? 2").await, "2=25.000000000");
    }

    #[tokio::test]
    async fn test_motion_status_byte() {
        let (mut link, _sim) = SimulatedController::new()
            .referenced(true)
            .with_busy_polls(1)
            .spawn();

        link.write_all(b"MOV 1 3.0\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");

        link.write_all(&[codec::MOTION_STATUS_REQUEST]).await.unwrap();
        let line = link
            .read_until(b'\n', Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(line, b"1\n");
    }

    #[tokio::test]
    async fn test_unknown_command_is_logged_and_rejected() {
        let (mut link, sim) = SimulatedController::new().spawn();

        link.write_all(b"XYZ 1\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "2");
        assert_eq!(sim.commands_received(), vec!["XYZ 1", "ERR?"]);
    }

    #[tokio::test]
    async fn test_multi_axis_forms() {
        let (mut link, sim) = SimulatedController::new()
            .referenced(true)
            .with_busy_polls(0)
            .spawn();

        link.write_all(b"MOV 1 5 2 6\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert_eq!(sim.position("1"), Some(5.0));
        assert_eq!(sim.position("2"), Some(6.0));

        assert_eq!(exchange(&mut link, "POS? 1 2").await, "1=5.000000000");
        let second = link
            .read_until(b'\n', Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(second, b"2=6.000000000\n");

        assert_eq!(exchange(&mut link, "SPA? 1 0xE 2 0xE").await, "1 0xE=10000");
        let second = link
            .read_until(b'\n', Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(second, b"2 0xE=10000\n");
    }

    #[tokio::test]
    async fn test_reference_state_follows_delay() {
        let (mut link, sim) = SimulatedController::new()
            .with_reference_delay(Duration::from_millis(50))
            .spawn();

        link.write_all(b"FRF 1\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert_eq!(exchange(&mut link, "FRF? 1").await, "1=0");
        assert!(!sim.is_referenced("1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(exchange(&mut link, "FRF? 1").await, "1=1");
    }

    #[tokio::test]
    async fn test_rates_checked_against_maximum() {
        let (mut link, sim) = SimulatedController::new().spawn();

        link.write_all(b"VEL 1 250\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "17");
        link.write_all(b"SPA 1 0xA 300\n").await.unwrap();
        link.write_all(b"VEL 1 250\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert_eq!(sim.velocity("1"), Some(250.0));
        assert_eq!(exchange(&mut link, "VEL? 1").await, "1=250.000000000");
    }

    #[tokio::test]
    async fn test_reboot_runs_startup_macro() {
        let (mut link, sim) = SimulatedController::new()
            .referenced(true)
            .with_startup_macro(2, true)
            .spawn();

        link.write_all(b"RBT\n").await.unwrap();
        assert_eq!(exchange(&mut link, "ERR?").await, "0");
        assert!(!sim.is_referenced("1"));
        assert_eq!(exchange(&mut link, "RMC?").await, "STARTUP");
        assert_eq!(exchange(&mut link, "RMC?").await, "STARTUP");
        assert_eq!(exchange(&mut link, "RMC?").await, "");
        assert!(sim.is_referenced("1"));
    }
}
