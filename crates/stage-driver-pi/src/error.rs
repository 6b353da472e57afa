//! GCS driver errors.
//!
//! Every failure is returned to the immediate caller as a typed value. None
//! of them triggers an internal retry: retrying against a controller that is
//! mid-move can compound faults, so retry policy belongs to the caller.
//! A busy position report is not an error and never appears here.

use stage_core::error::TransportError;
use std::time::Duration;
use thiserror::Error;

pub type GcsResult<T> = std::result::Result<T, GcsError>;

#[derive(Error, Debug)]
pub enum GcsError {
    /// No reply before the command's deadline. Fatal to the call, not to the
    /// session; the caller may retry.
    #[error("'{command}' got no response within {after:?}")]
    Timeout { command: String, after: Duration },

    /// Reply could not be decoded in the expected grammar. The session stays
    /// usable.
    #[error("'{command}' got a malformed response: {response:?}")]
    MalformedResponse { command: String, response: String },

    /// Absolute move attempted before the axis completed a reference move.
    #[error("axis {axis} is not homed; run a reference move first")]
    NotHomed { axis: String },

    /// Target outside the axis travel range. Rejected before any I/O.
    #[error("target {target} mm on axis {axis} is outside travel range [{min}, {max}] mm")]
    OutOfRange {
        axis: String,
        target: f64,
        min: f64,
        max: f64,
    },

    /// Fault reported by the controller through `ERR?`, surfaced verbatim.
    #[error("controller reported error {code} after '{command}'")]
    Controller { command: String, code: i32 },

    #[error("unknown axis '{axis}'")]
    UnknownAxis { axis: String },

    #[error("invalid axis identifier '{0}'")]
    InvalidAxisId(String),

    #[error("unknown macro '{name}'")]
    UnknownMacro { name: String },

    #[error("macro '{name}' aborted at command {index}: {source}")]
    MacroAborted {
        name: String,
        index: usize,
        #[source]
        source: Box<GcsError>,
    },

    #[error("axis {axis} reports unit '{unit}', expected MM")]
    UnitMismatch { axis: String, unit: String },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: f64 },

    /// Setting above the axis maximum read from the controller.
    #[error("{what} {value} exceeds the controller maximum {max}")]
    ExceedsMaximum {
        what: &'static str,
        value: f64,
        max: f64,
    },

    /// Operation needs the encoder scale, which the controller did not report.
    #[error("encoder scale of axis {axis} is unknown")]
    ScaleUnknown { axis: String },

    /// Command text that would not fit in one GCS frame.
    #[error("command text {text:?} is not a single GCS command")]
    InvalidCommandText { text: String },

    #[error("controller link is closed")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl GcsError {
    /// Whether repeating the same call could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MalformedResponse { .. })
    }

    /// Controller error code, if this error carries one.
    pub fn controller_code(&self) -> Option<i32> {
        match self {
            Self::Controller { code, .. } => Some(*code),
            Self::MacroAborted { source, .. } => source.controller_code(),
            _ => None,
        }
    }
}
