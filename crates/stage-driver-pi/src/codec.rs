//! GCS wire codec for the C-867 controller.
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232 or USB-CDC, 115200 baud
//! - Commands: `{MNEMONIC} {axis} {value}` terminated by LF
//! - Example: `MOV 1 12.500000000` (axis 1, move absolute, 12.5 mm)
//! - Query replies: `{axis}={value}` LF; a line whose last character before
//!   the LF is a space is continued on the next line
//! - Set commands (`MOV`, `MVR`, `FRF`, `SVO`, ...) have no reply. They are
//!   acknowledged by following them with `ERR?`, which answers `0` when the
//!   command was accepted and the controller's error number otherwise.
//! - Motion status is a single control byte (0x05) answered with a hex
//!   bitmask of moving axes.
//! - Most mnemonics take several axes at once (`MOV 1 5 2 6`, `POS? 1 2`);
//!   the reply then has one line per axis. [`split_per_axis`] breaks such
//!   text into single-axis commands.
//!
//! Numbers go on the wire in fixed-point notation with nine decimals and a
//! `.` separator regardless of locale.
//!
//! Decoding never fails: every input maps to a [`Response`], and anything the
//! grammar does not accept becomes [`ErrorCode::MalformedResponse`].

use crate::axis::{AxisId, TravelLimits};
use std::fmt;

/// Line terminator on both directions.
pub const TERMINATOR: u8 = b'\n';

/// Control byte requesting the motion status bitmask.
pub const MOTION_STATUS_REQUEST: u8 = 0x05;

/// Parameter ids (`SPA`/`SPA?`) the driver reads or writes.
pub mod params {
    /// Numerator of encoder counts per physical unit
    pub const COUNTS_PER_UNIT_NUMERATOR: u32 = 0x0E;
    /// Denominator of encoder counts per physical unit
    pub const COUNTS_PER_UNIT_DENOMINATOR: u32 = 0x0F;
    /// Physical unit name ("MM")
    pub const UNIT: u32 = 0x0700_0601;
    /// Maximum closed-loop velocity
    pub const MAX_VELOCITY: u32 = 0x0A;
    /// Maximum closed-loop acceleration
    pub const MAX_ACCELERATION: u32 = 0x4A;
    /// Maximum closed-loop deceleration
    pub const MAX_DECELERATION: u32 = 0x4B;
    /// Settling time in seconds
    pub const SETTLING_TIME: u32 = 0x3F;
    /// On-target window entry, in encoder counts ("window enter 0")
    pub const WINDOW_ENTER: u32 = 0x406;
    /// On-target window exit, in encoder counts ("window exit 0")
    pub const WINDOW_EXIT: u32 = 0x407;
    /// Lower bound of the next window level ("window enter 1"); the exit
    /// window must stay below it
    pub const WINDOW_EXIT_LIMIT: u32 = 0x416;
}

// =============================================================================
// Commands
// =============================================================================

/// Everything the engine can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Absolute move (`MOV`)
    Move(AxisId, f64),
    /// Relative move (`MVR`)
    MoveRelative(AxisId, f64),
    /// Current position (`POS?`)
    Query(AxisId),
    /// Reference move to the reference switch (`FRF`)
    Home(AxisId),
    /// Verbatim command text, used by macros
    RawMacroCommand(String),
    /// Last error number (`ERR?`)
    ErrorQuery,
    /// Identification string (`*IDN?`)
    Identify,
    /// Soft travel minimum (`TMN?`)
    QueryMinLimit(AxisId),
    /// Soft travel maximum (`TMX?`)
    QueryMaxLimit(AxisId),
    /// Parameter read (`SPA?`)
    QueryParameter(AxisId, u32),
    /// Parameter write (`SPA`)
    SetParameter(AxisId, u32, ParamValue),
    /// Reference state, `1` once referenced (`FRF?`)
    QueryReferenced(AxisId),
    /// Commanded velocity (`VEL?`)
    QueryVelocity(AxisId),
    /// Commanded acceleration (`ACC?`)
    QueryAcceleration(AxisId),
    /// Commanded deceleration (`DEC?`)
    QueryDeceleration(AxisId),
    /// Closed-loop velocity in mm/s (`VEL`)
    SetVelocity(AxisId, f64),
    /// Acceleration in mm/s² (`ACC`)
    SetAcceleration(AxisId, f64),
    /// Deceleration in mm/s² (`DEC`)
    SetDeceleration(AxisId, f64),
    /// Servo on/off (`SVO`)
    Servo(AxisId, bool),
    /// Joystick / human interface on/off (`HIN`)
    Joystick(AxisId, bool),
    /// Moving-axes bitmask (control byte 0x05)
    MotionStatus,
    /// Controller reboot, same as a power cycle (`RBT`)
    Reboot,
    /// Names of running macros, an empty line when none (`RMC?`)
    RunningMacros,
}

/// Discriminant of [`Command`], for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Move,
    MoveRelative,
    Query,
    Home,
    RawMacroCommand,
    ErrorQuery,
    Identify,
    QueryMinLimit,
    QueryMaxLimit,
    QueryParameter,
    SetParameter,
    QueryReferenced,
    QueryVelocity,
    QueryAcceleration,
    QueryDeceleration,
    SetVelocity,
    SetAcceleration,
    SetDeceleration,
    Servo,
    Joystick,
    MotionStatus,
    Reboot,
    RunningMacros,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Move(..) => CommandKind::Move,
            Self::MoveRelative(..) => CommandKind::MoveRelative,
            Self::Query(..) => CommandKind::Query,
            Self::Home(..) => CommandKind::Home,
            Self::RawMacroCommand(..) => CommandKind::RawMacroCommand,
            Self::ErrorQuery => CommandKind::ErrorQuery,
            Self::Identify => CommandKind::Identify,
            Self::QueryMinLimit(..) => CommandKind::QueryMinLimit,
            Self::QueryMaxLimit(..) => CommandKind::QueryMaxLimit,
            Self::QueryParameter(..) => CommandKind::QueryParameter,
            Self::SetParameter(..) => CommandKind::SetParameter,
            Self::QueryReferenced(..) => CommandKind::QueryReferenced,
            Self::QueryVelocity(..) => CommandKind::QueryVelocity,
            Self::QueryAcceleration(..) => CommandKind::QueryAcceleration,
            Self::QueryDeceleration(..) => CommandKind::QueryDeceleration,
            Self::SetVelocity(..) => CommandKind::SetVelocity,
            Self::SetAcceleration(..) => CommandKind::SetAcceleration,
            Self::SetDeceleration(..) => CommandKind::SetDeceleration,
            Self::Servo(..) => CommandKind::Servo,
            Self::Joystick(..) => CommandKind::Joystick,
            Self::MotionStatus => CommandKind::MotionStatus,
            Self::Reboot => CommandKind::Reboot,
            Self::RunningMacros => CommandKind::RunningMacros,
        }
    }

    /// Axis the command addresses, if any.
    pub fn axis(&self) -> Option<&AxisId> {
        match self {
            Self::Move(axis, _)
            | Self::MoveRelative(axis, _)
            | Self::Query(axis)
            | Self::Home(axis)
            | Self::QueryMinLimit(axis)
            | Self::QueryMaxLimit(axis)
            | Self::QueryParameter(axis, _)
            | Self::SetParameter(axis, ..)
            | Self::QueryReferenced(axis)
            | Self::QueryVelocity(axis)
            | Self::QueryAcceleration(axis)
            | Self::QueryDeceleration(axis)
            | Self::SetVelocity(axis, _)
            | Self::SetAcceleration(axis, _)
            | Self::SetDeceleration(axis, _)
            | Self::Servo(axis, _)
            | Self::Joystick(axis, _) => Some(axis),
            Self::RawMacroCommand(_)
            | Self::ErrorQuery
            | Self::Identify
            | Self::MotionStatus
            | Self::Reboot
            | Self::RunningMacros => None,
        }
    }

    /// Whether the controller sends reply lines for this command.
    pub fn expects_reply(&self) -> bool {
        match self {
            Self::Query(_)
            | Self::ErrorQuery
            | Self::Identify
            | Self::QueryMinLimit(_)
            | Self::QueryMaxLimit(_)
            | Self::QueryParameter(..)
            | Self::QueryReferenced(_)
            | Self::QueryVelocity(_)
            | Self::QueryAcceleration(_)
            | Self::QueryDeceleration(_)
            | Self::MotionStatus
            | Self::RunningMacros => true,
            Self::RawMacroCommand(text) => is_query_text(text),
            _ => false,
        }
    }

    /// Whether the command sets the stage in motion.
    pub fn is_motion(&self) -> bool {
        matches!(self, Self::Move(..) | Self::MoveRelative(..) | Self::Home(_))
    }
}

impl fmt::Display for Command {
    /// Wire text without the terminator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move(axis, target) => write!(f, "MOV {} {}", axis, fixed(*target)),
            Self::MoveRelative(axis, delta) => write!(f, "MVR {} {}", axis, fixed(*delta)),
            Self::Query(axis) => write!(f, "POS? {}", axis),
            Self::Home(axis) => write!(f, "FRF {}", axis),
            Self::RawMacroCommand(text) => f.write_str(text.trim_end_matches(['\r', '\n'])),
            Self::ErrorQuery => f.write_str("ERR?"),
            Self::Identify => f.write_str("*IDN?"),
            Self::QueryMinLimit(axis) => write!(f, "TMN? {}", axis),
            Self::QueryMaxLimit(axis) => write!(f, "TMX? {}", axis),
            Self::QueryParameter(axis, id) => write!(f, "SPA? {} 0x{:X}", axis, id),
            Self::SetParameter(axis, id, value) => write!(f, "SPA {} 0x{:X} {}", axis, id, value),
            Self::QueryReferenced(axis) => write!(f, "FRF? {}", axis),
            Self::QueryVelocity(axis) => write!(f, "VEL? {}", axis),
            Self::QueryAcceleration(axis) => write!(f, "ACC? {}", axis),
            Self::QueryDeceleration(axis) => write!(f, "DEC? {}", axis),
            Self::SetVelocity(axis, v) => write!(f, "VEL {} {}", axis, fixed(*v)),
            Self::SetAcceleration(axis, a) => write!(f, "ACC {} {}", axis, fixed(*a)),
            Self::SetDeceleration(axis, d) => write!(f, "DEC {} {}", axis, fixed(*d)),
            Self::Servo(axis, on) => write!(f, "SVO {} {}", axis, flag(*on)),
            Self::Joystick(axis, on) => write!(f, "HIN {} {}", axis, flag(*on)),
            Self::MotionStatus => f.write_str("#5"),
            Self::Reboot => f.write_str("RBT"),
            Self::RunningMacros => f.write_str("RMC?"),
        }
    }
}

fn fixed(value: f64) -> String {
    format!("{:.9}", value)
}

fn flag(on: bool) -> u8 {
    u8::from(on)
}

/// Value of an `SPA` parameter write. Parameters are typed on the
/// controller; counts are integers, times and rates are floats, a few are
/// short strings.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Classify one wire token: integer, then float, then text.
    pub fn parse(token: &str) -> Self {
        if let Ok(n) = token.parse::<i64>() {
            return Self::Int(n);
        }
        match parse_number(token) {
            Some(v) => Self::Float(v),
            None => Self::Text(token.to_string()),
        }
    }

    /// Whether the value fits in one whitespace-delimited token.
    pub fn is_single_token(&self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(v) => v.is_finite(),
            Self::Text(text) => {
                !text.is_empty() && !text.chars().any(|c| c.is_whitespace() || c.is_control())
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(v) => f.write_str(&fixed(*v)),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Encode a command into the exact bytes the controller expects.
pub fn encode(command: &Command) -> Vec<u8> {
    if let Command::MotionStatus = command {
        return vec![MOTION_STATUS_REQUEST];
    }
    let mut bytes = command.to_string().into_bytes();
    bytes.push(TERMINATOR);
    bytes
}

/// Reconstruct a command from its wire form.
///
/// Text with an unrecognized mnemonic or argument list comes back as
/// [`Command::RawMacroCommand`]; only empty input yields `None`.
pub fn parse_command(wire: &[u8]) -> Option<Command> {
    if wire == [MOTION_STATUS_REQUEST] {
        return Some(Command::MotionStatus);
    }

    let text = std::str::from_utf8(wire).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    let mut tokens = text.split_whitespace();
    let mnemonic = tokens.next()?;
    let args: Vec<&str> = tokens.collect();

    let parsed = match (mnemonic, args.as_slice()) {
        ("MOV", [axis, value]) => axis_and_number(axis, value).map(|(a, v)| Command::Move(a, v)),
        ("MVR", [axis, value]) => {
            axis_and_number(axis, value).map(|(a, v)| Command::MoveRelative(a, v))
        }
        ("POS?", [axis]) => AxisId::parse(axis).ok().map(Command::Query),
        ("FRF", [axis]) => AxisId::parse(axis).ok().map(Command::Home),
        ("ERR?", []) => Some(Command::ErrorQuery),
        ("*IDN?", []) => Some(Command::Identify),
        ("TMN?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryMinLimit),
        ("TMX?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryMaxLimit),
        ("SPA?", [axis, id]) => match (AxisId::parse(axis), parse_param_id(id)) {
            (Ok(a), Some(p)) => Some(Command::QueryParameter(a, p)),
            _ => None,
        },
        ("SPA", [axis, id, value]) => match (AxisId::parse(axis), parse_param_id(id)) {
            (Ok(a), Some(p)) => Some(Command::SetParameter(a, p, ParamValue::parse(value))),
            _ => None,
        },
        ("FRF?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryReferenced),
        ("VEL?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryVelocity),
        ("ACC?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryAcceleration),
        ("DEC?", [axis]) => AxisId::parse(axis).ok().map(Command::QueryDeceleration),
        ("RBT", []) => Some(Command::Reboot),
        ("RMC?", []) => Some(Command::RunningMacros),
        ("VEL", [axis, value]) => {
            axis_and_number(axis, value).map(|(a, v)| Command::SetVelocity(a, v))
        }
        ("ACC", [axis, value]) => {
            axis_and_number(axis, value).map(|(a, v)| Command::SetAcceleration(a, v))
        }
        ("DEC", [axis, value]) => {
            axis_and_number(axis, value).map(|(a, v)| Command::SetDeceleration(a, v))
        }
        ("SVO", [axis, state]) => axis_and_flag(axis, state).map(|(a, s)| Command::Servo(a, s)),
        ("HIN", [axis, state]) => {
            axis_and_flag(axis, state).map(|(a, s)| Command::Joystick(a, s))
        }
        _ => None,
    };

    Some(parsed.unwrap_or_else(|| Command::RawMacroCommand(text.to_string())))
}

/// Number of arguments each axis takes in a multi-axis command.
fn per_axis_arity(mnemonic: &str) -> Option<usize> {
    match mnemonic {
        "POS?" | "FRF" | "FRF?" | "TMN?" | "TMX?" | "VEL?" | "ACC?" | "DEC?" => Some(1),
        "MOV" | "MVR" | "SVO" | "HIN" | "VEL" | "ACC" | "DEC" | "SPA?" => Some(2),
        "SPA" => Some(3),
        _ => None,
    }
}

/// Split command text addressing several axes (`MOV 1 5 2 6`,
/// `SPA? 1 0xE 2 0xE`) into one typed command per axis, in order.
///
/// Single-axis text yields a one-element list. `None` when the mnemonic
/// takes no axis list, the argument count does not divide evenly, or any
/// group fails to parse.
pub fn split_per_axis(text: &str) -> Option<Vec<Command>> {
    let mut tokens = text.split_whitespace();
    let mnemonic = tokens.next()?;
    let args: Vec<&str> = tokens.collect();
    let arity = per_axis_arity(mnemonic)?;
    if args.is_empty() || args.len() % arity != 0 {
        return None;
    }

    args.chunks(arity)
        .map(|group| {
            let single = format!("{} {}", mnemonic, group.join(" "));
            match parse_command(single.as_bytes())? {
                Command::RawMacroCommand(_) => None,
                command => Some(command),
            }
        })
        .collect()
}

/// Axes a command sets in motion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovedAxes {
    None,
    Listed(Vec<AxisId>),
    /// `FRF` without arguments references every axis
    All,
}

/// Work out which axes a command (typed or raw text) moves.
pub fn moved_axes(command: &Command) -> MovedAxes {
    let text = match command {
        Command::RawMacroCommand(text) => text.as_str(),
        typed => {
            return match typed.axis() {
                Some(axis) if typed.is_motion() => MovedAxes::Listed(vec![axis.clone()]),
                _ => MovedAxes::None,
            }
        }
    };

    if text.split_whitespace().eq(["FRF"]) {
        return MovedAxes::All;
    }
    let axes: Vec<AxisId> = split_per_axis(text)
        .unwrap_or_default()
        .iter()
        .filter(|c| c.is_motion())
        .filter_map(|c| c.axis().cloned())
        .collect();
    if axes.is_empty() {
        MovedAxes::None
    } else {
        MovedAxes::Listed(axes)
    }
}

fn axis_and_number(axis: &str, value: &str) -> Option<(AxisId, f64)> {
    Some((AxisId::parse(axis).ok()?, parse_number(value)?))
}

fn axis_and_flag(axis: &str, state: &str) -> Option<(AxisId, bool)> {
    let on = match state {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    Some((AxisId::parse(axis).ok()?, on))
}

fn parse_param_id(id: &str) -> Option<u32> {
    match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => id.parse().ok(),
    }
}

/// Parse a controller number. Rejects NaN and infinities, which Rust's float
/// parser would otherwise accept ("inf", "NaN").
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let looks_numeric = !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'));
    if !looks_numeric {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Whether raw command text is a query (its mnemonic ends with `?`).
pub fn is_query_text(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .is_some_and(|mnemonic| mnemonic.ends_with('?'))
}

// =============================================================================
// Responses
// =============================================================================

/// Controller-side failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Nonzero `ERR?` value
    Controller(i32),
    /// Reply outside the expected grammar
    MalformedResponse,
}

/// Typed reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    /// Settled position report in millimeters
    PositionValue(f64),
    /// Command accepted (`ERR?` answered `0`)
    Ack,
    /// Mid-move report: the controller answered with a travel limit instead
    /// of the true position. Not an error.
    Busy(f64),
    ErrorCode(ErrorCode),
}

/// What kind of reply line the engine is waiting for.
#[derive(Debug, Clone, Copy)]
pub enum Expected<'a> {
    /// Reply to `ERR?`
    Ack,
    /// Reply to `POS?`. `busy_limits` is set only while a move on the axis
    /// is believed to be in progress; a value equal to one of those limits
    /// is then reported as [`Response::Busy`].
    Position {
        axis: &'a AxisId,
        busy_limits: Option<TravelLimits>,
    },
}

/// Decode one terminated reply line.
pub fn decode(line: &[u8], expected: Expected<'_>) -> Response {
    let Some(text) = line_text(line) else {
        return Response::ErrorCode(ErrorCode::MalformedResponse);
    };

    match expected {
        Expected::Ack => match text.parse::<i32>() {
            Ok(0) => Response::Ack,
            Ok(code) => Response::ErrorCode(ErrorCode::Controller(code)),
            Err(_) => Response::ErrorCode(ErrorCode::MalformedResponse),
        },
        Expected::Position { axis, busy_limits } => match parse_axis_value(text, axis) {
            Some(value) => match busy_limits.and_then(|limits| limits.matching(value)) {
                Some(limit) => Response::Busy(limit),
                None => Response::PositionValue(value),
            },
            None => Response::ErrorCode(ErrorCode::MalformedResponse),
        },
    }
}

/// ASCII text of a reply line with the terminator and surrounding blanks
/// removed. `None` for non-ASCII input.
pub fn line_text(line: &[u8]) -> Option<&str> {
    if !line.is_ascii() {
        return None;
    }
    std::str::from_utf8(line).ok().map(str::trim)
}

/// Whether another line of the same reply follows this one.
pub fn is_continuation(line: &[u8]) -> bool {
    let body = line
        .strip_suffix(b"\n")
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .unwrap_or(line);
    body.last() == Some(&b' ')
}

/// Split `key=value` and return both halves trimmed.
pub fn split_key_value(text: &str) -> Option<(&str, &str)> {
    let (key, value) = text.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Parse `{axis}={value}` for the given axis.
pub fn parse_axis_value(text: &str, axis: &AxisId) -> Option<f64> {
    let (key, value) = split_key_value(text)?;
    if key != axis.as_str() {
        return None;
    }
    parse_number(value)
}

/// Parse a parameter reply (`{axis} 0x{id}={value}`) and return the value text.
pub fn parse_parameter_value<'t>(text: &'t str, axis: &AxisId, id: u32) -> Option<&'t str> {
    let (key, value) = split_key_value(text)?;
    let mut parts = key.split_whitespace();
    let key_axis = parts.next()?;
    let key_id = parse_param_id(parts.next()?)?;
    (key_axis == axis.as_str() && key_id == id && parts.next().is_none()).then_some(value)
}

/// Parse the motion status bitmask (hex). Bit 0 is the first axis.
pub fn parse_motion_status(text: &str) -> Option<u32> {
    let hex = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if hex.is_empty() {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}
