//! GCS command engine.
//!
//! One [`CommandEngine`] owns one controller link and its [`ControllerState`].
//! Every public operation is a complete exchange: encode, write, read the
//! reply (or acknowledge with `ERR?`), decode, and then update state. Only
//! one exchange is ever in flight because every operation takes `&mut self`;
//! callers sharing an engine wrap it in a single mutex.
//!
//! # Contracts
//!
//! - **No background activity.** Nothing refreshes positions or polls
//!   motion on its own.
//! - **No internal retries.** A timeout is returned as
//!   [`GcsError::Timeout`] and the session stays usable. Retrying a move on
//!   hardware that may still be executing it is the caller's decision.
//! - **Busy is an answer.** A position query issued while a move is in
//!   flight may be answered with a travel limit; it is returned as
//!   [`PositionReading::Busy`] without waiting or re-querying.
//! - **Reference moves are watched.** `ERR?` after `FRF` answers as soon as
//!   the move starts, so [`CommandEngine::home`] polls `FRF?` until the
//!   controller reports the axis referenced or the homing deadline passes.
//! - **Resync after timeout.** A reply that arrives after its deadline would
//!   otherwise be read as the answer to the next command. After a timeout the
//!   next exchange first discards whatever arrives within the resync window.

use crate::axis::{Axis, AxisId, ProfileLimits, TravelLimits};
use crate::cache::{Position, PositionCache};
use crate::codec::{
    self, params, Command, ErrorCode, Expected, MovedAxes, ParamValue, Response,
};
use crate::error::{GcsError, GcsResult};
use crate::homing::HomingController;
use stage_core::error::TransportError;
use stage_core::serial::Transport;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::instrument;

/// Macros generated from the axis table.
pub const BUILTIN_MACROS: &[&str] = &["servo_on", "servo_off", "joystick_on", "joystick_off"];

/// Upper bound of the settling time the controller accepts.
pub const MAX_SETTLING_TIME_MS: f64 = 1000.0;

/// Gap between the on-target exit and entry windows.
pub const TOLERANCE_MARGIN_UM: f64 = 0.1;

/// Time the controller needs before it answers again after `RBT`.
const REBOOT_SETTLE: Duration = Duration::from_millis(200);

/// Per-exchange deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// Read deadline for every ordinary reply
    pub command: Duration,
    /// Deadline for a reference move (or a reboot's startup macro) to finish
    pub home: Duration,
    /// How long to discard late bytes after a timeout
    pub resync_window: Duration,
    /// Pause between `FRF?` or `RMC?` polls
    pub poll_interval: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5),
            home: Duration::from_secs(60),
            resync_window: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Result of a position query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionReading {
    /// True position; the cache now holds this value.
    Settled(f64),
    /// Controller is mid-move and reported this travel limit instead. The
    /// limit indicates the direction of travel. The cache is unchanged.
    Busy(f64),
}

impl PositionReading {
    pub fn value(&self) -> f64 {
        match self {
            Self::Settled(v) | Self::Busy(v) => *v,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

// =============================================================================
// ControllerState
// =============================================================================

/// Everything the driver believes about the controller.
///
/// Created on connect, mutated only by explicit engine operations, dropped
/// on disconnect.
#[derive(Debug, Default)]
pub struct ControllerState {
    axes: Vec<Axis>,
    cache: PositionCache,
    homing: HomingController,
    in_motion: BTreeSet<AxisId>,
    last_command: Option<Command>,
}

impl ControllerState {
    /// Axes in controller order.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn axis(&self, id: &str) -> GcsResult<&Axis> {
        self.axes
            .iter()
            .find(|a| a.id.as_str() == id)
            .ok_or_else(|| GcsError::UnknownAxis {
                axis: id.to_string(),
            })
    }

    pub fn cache(&self) -> &PositionCache {
        &self.cache
    }

    pub fn homing(&self) -> &HomingController {
        &self.homing
    }

    /// Whether a move on the axis was acknowledged and no settled position
    /// has been read since.
    pub fn is_in_motion(&self, axis: &str) -> bool {
        self.in_motion.contains(axis)
    }

    /// Last command issued on behalf of a caller (acknowledgement queries
    /// are not recorded).
    pub fn last_command(&self) -> Option<&Command> {
        self.last_command.as_ref()
    }
}

// =============================================================================
// CommandEngine
// =============================================================================

pub struct CommandEngine<T: Transport = Box<dyn Transport>> {
    transport: T,
    timeouts: EngineTimeouts,
    state: ControllerState,
    macros: BTreeMap<String, Vec<String>>,
    needs_resync: bool,
    closed: bool,
}

impl<T: Transport> CommandEngine<T> {
    pub fn new(transport: T, timeouts: EngineTimeouts) -> Self {
        Self {
            transport,
            timeouts,
            state: ControllerState::default(),
            macros: BTreeMap::new(),
            needs_resync: false,
            closed: false,
        }
    }

    /// Register named macros. A configured macro shadows a built-in one of
    /// the same name.
    pub fn with_macros(mut self, macros: BTreeMap<String, Vec<String>>) -> Self {
        self.macros = macros;
        self
    }

    /// Add or replace an axis in the axis table.
    pub fn add_axis(&mut self, axis: Axis) {
        match self.state.axes.iter_mut().find(|a| a.id == axis.id) {
            Some(existing) => *existing = axis,
            None => self.state.axes.push(axis),
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn timeouts(&self) -> EngineTimeouts {
        self.timeouts
    }

    /// Cached positions. Never performs I/O; see [`crate::cache`] for the
    /// staleness contract.
    pub fn positions(&self) -> Position {
        self.state.cache.read()
    }

    pub fn limits_mm(&self, axis: &str) -> GcsResult<(f64, f64)> {
        Ok(self.state.axis(axis)?.limits.as_tuple())
    }

    pub fn is_homed(&self, axis: &str) -> bool {
        self.state.homing.is_homed(axis)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn macro_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = BUILTIN_MACROS.iter().map(|n| n.to_string()).collect();
        names.extend(self.macros.keys().cloned());
        names.into_iter().collect()
    }

    fn axis_info(&self, axis: &str) -> GcsResult<(AxisId, TravelLimits)> {
        let axis = self.state.axis(axis)?;
        Ok((axis.id.clone(), axis.limits))
    }

    fn axis_profile(&self, axis: &str) -> GcsResult<(AxisId, ProfileLimits)> {
        let axis = self.state.axis(axis)?;
        Ok((axis.id.clone(), axis.profile))
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Absolute move.
    ///
    /// Rejected without I/O when the axis is not homed or the target lies
    /// outside its travel range. On acknowledgement the cache is set to the
    /// target (the controller reports no intermediate progress) and the axis
    /// is flagged as in motion.
    #[instrument(skip(self), err)]
    pub async fn move_mm(&mut self, axis: &str, target_mm: f64) -> GcsResult<()> {
        let (id, limits) = self.axis_info(axis)?;

        if !self.state.homing.is_homed(axis) {
            return Err(GcsError::NotHomed {
                axis: axis.to_string(),
            });
        }
        if !limits.contains(target_mm) {
            return Err(GcsError::OutOfRange {
                axis: axis.to_string(),
                target: target_mm,
                min: limits.min_mm,
                max: limits.max_mm,
            });
        }

        let command = Command::Move(id.clone(), target_mm);
        self.command_with_ack(&command, self.timeouts.command).await?;

        self.state.cache.update(&id, target_mm);
        self.state.in_motion.insert(id);
        Ok(())
    }

    /// Relative move.
    ///
    /// When a cached position exists, the resulting target is range-checked
    /// before sending and the cache is advanced by `delta_mm` on
    /// acknowledgement. Without a cached position the controller's own
    /// limit check applies and the cache stays empty.
    #[instrument(skip(self), err)]
    pub async fn move_relative_mm(&mut self, axis: &str, delta_mm: f64) -> GcsResult<()> {
        let (id, limits) = self.axis_info(axis)?;

        if !delta_mm.is_finite() {
            return Err(GcsError::InvalidValue {
                what: "relative distance",
                value: delta_mm,
            });
        }

        let predicted = self.state.cache.get(axis).map(|base| base + delta_mm);
        if let Some(target) = predicted {
            if !limits.contains(target) {
                return Err(GcsError::OutOfRange {
                    axis: axis.to_string(),
                    target,
                    min: limits.min_mm,
                    max: limits.max_mm,
                });
            }
        }

        let command = Command::MoveRelative(id.clone(), delta_mm);
        self.command_with_ack(&command, self.timeouts.command).await?;

        if let Some(target) = predicted {
            self.state.cache.update(&id, target);
        }
        self.state.in_motion.insert(id);
        Ok(())
    }

    /// Position query honoring the busy contract.
    ///
    /// Never waits for motion to finish and never re-queries.
    #[instrument(skip(self), err)]
    pub async fn query_position(&mut self, axis: &str) -> GcsResult<PositionReading> {
        let (id, limits) = self.axis_info(axis)?;

        let command = Command::Query(id.clone());
        self.send(&command).await?;
        let line = self.read_line(&command, self.timeouts.command).await?;

        let busy_limits = self.state.in_motion.contains(axis).then_some(limits);
        match codec::decode(
            &line,
            Expected::Position {
                axis: &id,
                busy_limits,
            },
        ) {
            Response::PositionValue(value) => {
                self.state.cache.update(&id, value);
                self.state.in_motion.remove(axis);
                Ok(PositionReading::Settled(value))
            }
            Response::Busy(limit) => {
                tracing::debug!(axis, limit, "Controller busy, reporting travel limit");
                Ok(PositionReading::Busy(limit))
            }
            Response::ErrorCode(ErrorCode::Controller(code)) => Err(GcsError::Controller {
                command: command.to_string(),
                code,
            }),
            Response::Ack | Response::ErrorCode(ErrorCode::MalformedResponse) => {
                Err(self.malformed(&command, &String::from_utf8_lossy(&line)))
            }
        }
    }

    /// Position query returning the best available value: the true position,
    /// or a travel limit while the axis is busy.
    pub async fn get_position_mm(&mut self, axis: &str) -> GcsResult<f64> {
        Ok(self.query_position(axis).await?.value())
    }

    /// Motion status bitmask, read once.
    ///
    /// Axes reported still have their in-motion flag cleared. Positions are
    /// not touched.
    #[instrument(skip(self), err)]
    pub async fn motion_status(&mut self) -> GcsResult<BTreeMap<AxisId, bool>> {
        let command = Command::MotionStatus;
        self.send(&command).await?;
        let line = self.read_line(&command, self.timeouts.command).await?;

        let Some(mask) = codec::line_text(&line).and_then(codec::parse_motion_status) else {
            return Err(self.malformed(&command, &String::from_utf8_lossy(&line)));
        };

        let mut status = BTreeMap::new();
        for (index, axis) in self.state.axes.iter().enumerate() {
            let bit = axis
                .id
                .as_str()
                .parse::<u32>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .unwrap_or(index as u32);
            let moving = bit < 32 && mask & (1 << bit) != 0;
            if !moving {
                self.state.in_motion.remove(&axis.id);
            }
            status.insert(axis.id.clone(), moving);
        }
        Ok(status)
    }

    // =========================================================================
    // Homing
    // =========================================================================

    /// Reference move, waiting up to the homing timeout for it to finish.
    ///
    /// `FRF` is acknowledged with `ERR?` and then `FRF?` is polled every
    /// `poll_interval` until it reports the axis referenced. The axis is in
    /// motion for the whole wait. Success leaves it `Homed`; a timeout or
    /// controller error returns it to `Unknown`. Either way the cached
    /// position is dropped, since the stage moved to its reference switch.
    #[instrument(skip(self), err)]
    pub async fn home(&mut self, axis: &str) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;

        self.state.homing.begin(&id);
        self.state.cache.invalidate(&id);
        self.state.in_motion.insert(id.clone());

        let command = Command::Home(id.clone());
        if let Err(e) = self.command_with_ack(&command, self.timeouts.command).await {
            self.state.homing.abort(&id);
            self.state.in_motion.remove(&id);
            tracing::warn!(axis, error = %e, "Reference move rejected");
            return Err(e);
        }

        match self.wait_referenced(&id).await {
            Ok(()) => {
                self.state.homing.complete(&id);
                self.state.in_motion.remove(&id);
                tracing::info!(axis, "Reference move complete");
                Ok(())
            }
            Err(e) => {
                // The stage may still be travelling, so the axis stays in motion
                self.state.homing.abort(&id);
                tracing::warn!(axis, error = %e, "Reference move failed");
                Err(e)
            }
        }
    }

    async fn wait_referenced(&mut self, id: &AxisId) -> GcsResult<()> {
        let deadline = tokio::time::Instant::now() + self.timeouts.home;
        let query = Command::QueryReferenced(id.clone());
        loop {
            if self.query_axis_number(&query, id).await? != 0.0 {
                return Ok(());
            }
            if tokio::time::Instant::now() + self.timeouts.poll_interval > deadline {
                return Err(GcsError::Timeout {
                    command: Command::Home(id.clone()).to_string(),
                    after: self.timeouts.home,
                });
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    /// Record an out-of-band reference (e.g. by the firmware startup macro).
    pub fn mark_homed(&mut self, axis: &str) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;
        self.state.homing.mark_homed(&id);
        Ok(())
    }

    // =========================================================================
    // Macros
    // =========================================================================

    /// Send raw commands in order, stopping at the first failure.
    ///
    /// Each command is acknowledged with `ERR?`. Query commands have their
    /// reply lines collected and returned. Raw commands bypass the homing
    /// interlock. Every axis a raw motion command moves (`MOV 1 5 2 6`
    /// moves two) loses its cached position and is flagged in motion, so
    /// the busy contract holds for it.
    ///
    /// All commands are checked before anything is sent: text with control
    /// characters (an embedded newline would put two commands in one frame)
    /// aborts the macro without I/O.
    #[instrument(skip(self, commands), fields(count = commands.len()), err)]
    pub async fn execute_macro(
        &mut self,
        name: &str,
        commands: &[String],
    ) -> GcsResult<Vec<String>> {
        let aborted = |index: usize, source: GcsError| GcsError::MacroAborted {
            name: name.to_string(),
            index,
            source: Box::new(source),
        };

        let mut steps = Vec::new();
        for (index, text) in commands.iter().enumerate() {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if text.chars().any(char::is_control) {
                return Err(aborted(
                    index,
                    GcsError::InvalidCommandText {
                        text: text.to_string(),
                    },
                ));
            }
            steps.push((index, Command::RawMacroCommand(text.to_string())));
        }

        let mut replies = Vec::new();
        for (index, command) in steps {
            match self.run_raw(&command).await {
                Ok(lines) => replies.extend(lines),
                Err(source) => return Err(aborted(index, source)),
            }
        }

        Ok(replies)
    }

    /// Run a built-in or configured macro by name.
    pub async fn run_macro(&mut self, name: &str) -> GcsResult<Vec<String>> {
        let commands = self
            .macro_commands(name)
            .ok_or_else(|| GcsError::UnknownMacro {
                name: name.to_string(),
            })?;
        self.execute_macro(name, &commands).await
    }

    fn macro_commands(&self, name: &str) -> Option<Vec<String>> {
        if let Some(commands) = self.macros.get(name) {
            return Some(commands.clone());
        }

        let build: fn(AxisId) -> Command = match name {
            "servo_on" => |a| Command::Servo(a, true),
            "servo_off" => |a| Command::Servo(a, false),
            "joystick_on" => |a| Command::Joystick(a, true),
            "joystick_off" => |a| Command::Joystick(a, false),
            _ => return None,
        };
        Some(
            self.state
                .axes
                .iter()
                .map(|a| build(a.id.clone()).to_string())
                .collect(),
        )
    }

    async fn run_raw(&mut self, command: &Command) -> GcsResult<Vec<String>> {
        self.send(command).await?;
        let lines = if command.expects_reply() {
            self.read_reply(command, self.timeouts.command).await?
        } else {
            Vec::new()
        };
        self.check_ack(command, self.timeouts.command).await?;

        let moved = match codec::moved_axes(command) {
            MovedAxes::None => Vec::new(),
            MovedAxes::Listed(axes) => axes,
            MovedAxes::All => self.state.axes.iter().map(|a| a.id.clone()).collect(),
        };
        for axis in moved {
            if self.state.axis(axis.as_str()).is_err() {
                continue;
            }
            tracing::debug!(axis = %axis, "Raw command moved axis");
            self.state.cache.invalidate(&axis);
            self.state.in_motion.insert(axis);
        }
        Ok(lines)
    }

    // =========================================================================
    // Identification, discovery and tuning
    // =========================================================================

    /// Controller identification string (`*IDN?`).
    pub async fn identify(&mut self) -> GcsResult<String> {
        let lines = self.query_lines(&Command::Identify).await?;
        Ok(lines.join(" ").trim().to_string())
    }

    /// Read unit, scale, travel limits, profile maxima and the tolerance
    /// bound of an axis from the controller and add it to the axis table.
    ///
    /// `limits_override` replaces the controller's soft limits.
    #[instrument(skip(self), err)]
    pub async fn discover_axis(
        &mut self,
        id: AxisId,
        limits_override: Option<TravelLimits>,
        require_mm: bool,
    ) -> GcsResult<Axis> {
        if require_mm {
            let unit = self.read_parameter(&id, params::UNIT).await?;
            if !unit.eq_ignore_ascii_case("MM") {
                return Err(GcsError::UnitMismatch {
                    axis: id.to_string(),
                    unit,
                });
            }
        }

        let counts_per_mm = self.read_counts_per_mm(&id).await?;

        let limits = match limits_override {
            Some(limits) => limits,
            None => self.read_limits(&id).await?,
        };
        if !limits.is_valid() {
            return Err(GcsError::InvalidValue {
                what: "travel minimum",
                value: limits.min_mm,
            });
        }

        let profile = ProfileLimits {
            max_velocity: Some(self.query_parameter_number(&id, params::MAX_VELOCITY).await?),
            max_acceleration: Some(
                self.query_parameter_number(&id, params::MAX_ACCELERATION)
                    .await?,
            ),
            max_deceleration: Some(
                self.query_parameter_number(&id, params::MAX_DECELERATION)
                    .await?,
            ),
        };
        let max_tolerance_counts = self
            .query_parameter_number(&id, params::WINDOW_EXIT_LIMIT)
            .await? as i64;

        let mut axis = Axis::new(id, limits);
        axis.counts_per_mm = counts_per_mm;
        axis.profile = profile;
        axis.max_tolerance_counts = Some(max_tolerance_counts);
        tracing::info!(
            axis = %axis.id,
            min_mm = limits.min_mm,
            max_mm = limits.max_mm,
            counts_per_mm = ?axis.counts_per_mm,
            max_velocity = ?profile.max_velocity,
            "Axis discovered"
        );

        self.add_axis(axis.clone());
        Ok(axis)
    }

    /// Re-read the controller's soft limits for a known axis and store them
    /// in the axis table.
    pub async fn query_limits(&mut self, axis: &str) -> GcsResult<(f64, f64)> {
        let (id, _) = self.axis_info(axis)?;
        let limits = self.read_limits(&id).await?;
        if let Some(entry) = self.state.axes.iter_mut().find(|a| a.id == id) {
            entry.limits = limits;
        }
        Ok(limits.as_tuple())
    }

    /// Re-read the encoder scale of a known axis.
    pub async fn query_counts_per_mm(&mut self, axis: &str) -> GcsResult<f64> {
        let (id, _) = self.axis_info(axis)?;
        let counts = self
            .read_counts_per_mm(&id)
            .await?
            .ok_or(GcsError::InvalidValue {
                what: "counts-per-unit denominator",
                value: 0.0,
            })?;
        if let Some(entry) = self.state.axes.iter_mut().find(|a| a.id == id) {
            entry.counts_per_mm = Some(counts);
        }
        Ok(counts)
    }

    async fn read_counts_per_mm(&mut self, id: &AxisId) -> GcsResult<Option<f64>> {
        let numerator = self
            .query_parameter_number(id, params::COUNTS_PER_UNIT_NUMERATOR)
            .await?;
        let denominator = self
            .query_parameter_number(id, params::COUNTS_PER_UNIT_DENOMINATOR)
            .await?;
        Ok((denominator != 0.0).then(|| numerator / denominator))
    }

    async fn read_limits(&mut self, id: &AxisId) -> GcsResult<TravelLimits> {
        let min = self
            .query_axis_number(&Command::QueryMinLimit(id.clone()), id)
            .await?;
        let max = self
            .query_axis_number(&Command::QueryMaxLimit(id.clone()), id)
            .await?;
        Ok(TravelLimits::new(min, max))
    }

    /// Closed-loop velocity, checked against the axis maximum read at
    /// discovery.
    pub async fn set_velocity(&mut self, axis: &str, mm_per_s: f64) -> GcsResult<()> {
        let (id, profile) = self.axis_profile(axis)?;
        check_setting("velocity", mm_per_s, profile.max_velocity)?;
        self.command_with_ack(&Command::SetVelocity(id, mm_per_s), self.timeouts.command)
            .await
    }

    pub async fn set_acceleration(&mut self, axis: &str, mm_per_s2: f64) -> GcsResult<()> {
        let (id, profile) = self.axis_profile(axis)?;
        check_setting("acceleration", mm_per_s2, profile.max_acceleration)?;
        self.command_with_ack(
            &Command::SetAcceleration(id, mm_per_s2),
            self.timeouts.command,
        )
        .await
    }

    pub async fn set_deceleration(&mut self, axis: &str, mm_per_s2: f64) -> GcsResult<()> {
        let (id, profile) = self.axis_profile(axis)?;
        check_setting("deceleration", mm_per_s2, profile.max_deceleration)?;
        self.command_with_ack(
            &Command::SetDeceleration(id, mm_per_s2),
            self.timeouts.command,
        )
        .await
    }

    pub async fn query_velocity(&mut self, axis: &str) -> GcsResult<f64> {
        let (id, _) = self.axis_info(axis)?;
        self.query_axis_number(&Command::QueryVelocity(id.clone()), &id)
            .await
    }

    pub async fn query_acceleration(&mut self, axis: &str) -> GcsResult<f64> {
        let (id, _) = self.axis_info(axis)?;
        self.query_axis_number(&Command::QueryAcceleration(id.clone()), &id)
            .await
    }

    pub async fn query_deceleration(&mut self, axis: &str) -> GcsResult<f64> {
        let (id, _) = self.axis_info(axis)?;
        self.query_axis_number(&Command::QueryDeceleration(id.clone()), &id)
            .await
    }

    /// Time the axis must stay inside the on-target window before it counts
    /// as settled. Sent in seconds.
    pub async fn set_settling_time_ms(&mut self, axis: &str, ms: f64) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;
        check_setting("settling time", ms, Some(MAX_SETTLING_TIME_MS))?;
        self.write_parameter(&id, params::SETTLING_TIME, ParamValue::Float(ms * 1e-3))
            .await
    }

    pub async fn query_settling_time_ms(&mut self, axis: &str) -> GcsResult<f64> {
        let (id, _) = self.axis_info(axis)?;
        Ok(self
            .query_parameter_number(&id, params::SETTLING_TIME)
            .await?
            * 1e3)
    }

    /// Set the on-target window to `um` micrometers.
    ///
    /// The exit window is `um` in encoder counts, the entry window sits
    /// [`TOLERANCE_MARGIN_UM`] inside it. Returns the tolerance actually
    /// applied after rounding to whole counts.
    #[instrument(skip(self), err)]
    pub async fn set_positional_tolerance_um(&mut self, axis: &str, um: f64) -> GcsResult<f64> {
        let entry = self.state.axis(axis)?.clone();
        check_setting("positional tolerance", um, None)?;

        let scale_unknown = || GcsError::ScaleUnknown {
            axis: axis.to_string(),
        };
        let exit = entry.mm_to_counts(um * 1e-3).ok_or_else(scale_unknown)?;
        let margin = entry
            .mm_to_counts(TOLERANCE_MARGIN_UM * 1e-3)
            .ok_or_else(scale_unknown)?;

        if let Some(max) = entry.max_tolerance_counts {
            if exit >= max {
                return Err(GcsError::ExceedsMaximum {
                    what: "positional tolerance (counts)",
                    value: exit as f64,
                    max: (max - 1) as f64,
                });
            }
        }
        if exit - margin <= 0 {
            return Err(GcsError::InvalidValue {
                what: "positional tolerance",
                value: um,
            });
        }

        self.write_parameter(&entry.id, params::WINDOW_EXIT, ParamValue::Int(exit))
            .await?;
        self.write_parameter(
            &entry.id,
            params::WINDOW_ENTER,
            ParamValue::Int(exit - margin),
        )
        .await?;

        let applied = entry.counts_to_mm(exit).ok_or_else(scale_unknown)? * 1e3;
        tracing::info!(axis, requested_um = um, applied_um = applied, "Positional tolerance set");
        Ok(applied)
    }

    /// Current exit window in micrometers.
    pub async fn query_positional_tolerance_um(&mut self, axis: &str) -> GcsResult<f64> {
        let entry = self.state.axis(axis)?.clone();
        let counts = self
            .query_parameter_number(&entry.id, params::WINDOW_EXIT)
            .await?;
        let resolution = entry.resolution_mm().ok_or_else(|| GcsError::ScaleUnknown {
            axis: axis.to_string(),
        })?;
        Ok(counts * resolution * 1e3)
    }

    /// Read any axis parameter as text (`SPA?`).
    pub async fn get_parameter(&mut self, axis: &str, param: u32) -> GcsResult<String> {
        let (id, _) = self.axis_info(axis)?;
        self.read_parameter(&id, param).await
    }

    /// Write any axis parameter (`SPA`). No range checks beyond the
    /// controller's own.
    pub async fn set_parameter(
        &mut self,
        axis: &str,
        param: u32,
        value: ParamValue,
    ) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;
        if !value.is_single_token() {
            return Err(GcsError::InvalidCommandText {
                text: value.to_string(),
            });
        }
        self.write_parameter(&id, param, value).await
    }

    pub async fn set_servo(&mut self, axis: &str, enabled: bool) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;
        self.command_with_ack(&Command::Servo(id, enabled), self.timeouts.command)
            .await
    }

    /// Enable or disable the joystick. With the joystick enabled the stage
    /// can move without this driver knowing.
    pub async fn set_joystick(&mut self, axis: &str, enabled: bool) -> GcsResult<()> {
        let (id, _) = self.axis_info(axis)?;
        self.command_with_ack(&Command::Joystick(id, enabled), self.timeouts.command)
            .await
    }

    /// Reboot the controller, same as a power cycle.
    ///
    /// Every axis loses its reference, so homing state, cached positions and
    /// motion flags are reset. With `wait_for_startup` set, `RMC?` is polled
    /// until no macro is running, within the homing deadline. Servo and
    /// joystick settings are the controller's power-on defaults afterwards.
    #[instrument(skip(self), err)]
    pub async fn reboot(&mut self, wait_for_startup: bool) -> GcsResult<()> {
        let command = Command::Reboot;
        self.send(&command).await?;
        tokio::time::sleep(REBOOT_SETTLE).await;

        self.state.homing.reset();
        self.state.cache.clear();
        self.state.in_motion.clear();
        self.check_ack(&command, self.timeouts.command).await?;

        if wait_for_startup {
            let deadline = tokio::time::Instant::now() + self.timeouts.home;
            loop {
                let running = self.query_lines(&Command::RunningMacros).await?;
                if running.iter().all(|name| name.is_empty()) {
                    break;
                }
                tracing::debug!(?running, "Waiting for startup macro");
                if tokio::time::Instant::now() + self.timeouts.poll_interval > deadline {
                    return Err(GcsError::Timeout {
                        command: Command::RunningMacros.to_string(),
                        after: self.timeouts.home,
                    });
                }
                tokio::time::sleep(self.timeouts.poll_interval).await;
            }
        }
        tracing::info!("Controller rebooted");
        Ok(())
    }

    /// Shut the link down. Every later call fails with
    /// [`GcsError::Disconnected`].
    pub async fn close(&mut self) -> GcsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close().await?;
        Ok(())
    }

    // =========================================================================
    // Exchange primitives
    // =========================================================================

    async fn send(&mut self, command: &Command) -> GcsResult<()> {
        if self.closed {
            return Err(GcsError::Disconnected);
        }
        if self.needs_resync {
            self.transport
                .discard_pending(self.timeouts.resync_window)
                .await;
            self.needs_resync = false;
        }

        tracing::debug!(command = %command, "GCS send");
        if !matches!(command, Command::ErrorQuery) {
            self.state.last_command = Some(command.clone());
        }
        self.transport
            .write_all(&codec::encode(command))
            .await
            .map_err(GcsError::from)
    }

    async fn read_line(&mut self, command: &Command, timeout: Duration) -> GcsResult<Vec<u8>> {
        match self.transport.read_until(codec::TERMINATOR, timeout).await {
            Ok(line) => {
                tracing::trace!(command = %command, response = %String::from_utf8_lossy(&line).trim_end(), "GCS recv");
                Ok(line)
            }
            Err(TransportError::Timeout(after)) => {
                self.needs_resync = true;
                tracing::warn!(command = %command, ?after, "GCS response timed out");
                Err(GcsError::Timeout {
                    command: command.to_string(),
                    after,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read all lines of one reply, following continuation markers.
    async fn read_reply(&mut self, command: &Command, timeout: Duration) -> GcsResult<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line(command, timeout).await?;
            let more = codec::is_continuation(&line);
            match codec::line_text(&line) {
                Some(text) => lines.push(text.to_string()),
                None => return Err(self.malformed(command, &String::from_utf8_lossy(&line))),
            }
            if !more {
                return Ok(lines);
            }
        }
    }

    /// Acknowledge the previous command with `ERR?`.
    async fn check_ack(&mut self, command: &Command, timeout: Duration) -> GcsResult<()> {
        self.send(&Command::ErrorQuery).await?;
        let line = self.read_line(command, timeout).await?;

        match codec::decode(&line, Expected::Ack) {
            Response::Ack => Ok(()),
            Response::ErrorCode(ErrorCode::Controller(code)) => {
                tracing::warn!(command = %command, code, "Controller rejected command");
                Err(GcsError::Controller {
                    command: command.to_string(),
                    code,
                })
            }
            _ => Err(self.malformed(command, &String::from_utf8_lossy(&line))),
        }
    }

    async fn command_with_ack(&mut self, command: &Command, timeout: Duration) -> GcsResult<()> {
        self.send(command).await?;
        self.check_ack(command, timeout).await
    }

    /// Query, read its reply, then acknowledge.
    async fn query_lines(&mut self, command: &Command) -> GcsResult<Vec<String>> {
        self.send(command).await?;
        let lines = self.read_reply(command, self.timeouts.command).await?;
        self.check_ack(command, self.timeouts.command).await?;
        Ok(lines)
    }

    async fn query_axis_number(&mut self, command: &Command, id: &AxisId) -> GcsResult<f64> {
        let lines = self.query_lines(command).await?;
        let first = lines.first().map(String::as_str).unwrap_or_default();
        match codec::parse_axis_value(first, id) {
            Some(value) => Ok(value),
            None => Err(self.malformed(command, first)),
        }
    }

    async fn read_parameter(&mut self, id: &AxisId, param: u32) -> GcsResult<String> {
        let command = Command::QueryParameter(id.clone(), param);
        let lines = self.query_lines(&command).await?;
        let first = lines.first().map(String::as_str).unwrap_or_default();
        match codec::parse_parameter_value(first, id, param) {
            Some(value) => Ok(value.to_string()),
            None => Err(self.malformed(&command, first)),
        }
    }

    async fn query_parameter_number(&mut self, id: &AxisId, param: u32) -> GcsResult<f64> {
        let text = self.read_parameter(id, param).await?;
        match codec::parse_number(&text) {
            Some(value) => Ok(value),
            None => Err(self.malformed(&Command::QueryParameter(id.clone(), param), &text)),
        }
    }

    async fn write_parameter(&mut self, id: &AxisId, param: u32, value: ParamValue) -> GcsResult<()> {
        let command = Command::SetParameter(id.clone(), param, value);
        self.command_with_ack(&command, self.timeouts.command).await
    }

    /// Build a malformed-response error. Any unread remainder of the reply
    /// is discarded before the next exchange.
    fn malformed(&mut self, command: &Command, response: &str) -> GcsError {
        self.needs_resync = true;
        let response = response.trim_end().to_string();
        tracing::warn!(command = %command, response = %response, "Malformed GCS response");
        GcsError::MalformedResponse {
            command: command.to_string(),
            response,
        }
    }
}

/// Non-negative, finite and not above `max`.
fn check_setting(what: &'static str, value: f64, max: Option<f64>) -> GcsResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(GcsError::InvalidValue { what, value });
    }
    match max {
        Some(max) if value > max => Err(GcsError::ExceedsMaximum { what, value, max }),
        _ => Ok(()),
    }
}
