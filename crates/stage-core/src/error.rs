//! Error types shared by stage drivers.
//!
//! Two layers are defined here:
//!
//! - **`TransportError`**: failures of the byte link itself (read deadline
//!   exceeded, I/O failure, peer closed). Every driver crate maps these into
//!   its own protocol-level error type.
//! - **`StageError`**: the application-level error used outside the protocol
//!   engines, for configuration problems and unknown driver types.
//!
//! Both derive `thiserror::Error`, so `?` converts underlying errors where a
//! `#[from]` conversion exists.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure of the underlying byte link.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No terminator arrived before the read deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The peer closed the link (EOF) before a full line arrived.
    #[error("link closed by peer")]
    Closed,

    /// Operating system level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the failure was a read deadline rather than a broken link.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// =============================================================================
// Application Errors
// =============================================================================

/// Convenience alias for results using the application error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Application-level error for stage control.
///
/// Protocol engines return their own typed errors; this type collects what
/// happens around them while drivers are configured and constructed.
#[derive(Error, Debug)]
pub enum StageError {
    /// Configuration values parsed but are semantically wrong
    /// (e.g. `min_mm > max_mm`, empty axis list, zero timeout).
    ///
    /// **Recovery Strategy**: abort startup and fix the configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// TOML could not be deserialized into the driver's config type.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Requested driver type has no registered factory.
    #[error("Unknown driver type '{0}'")]
    UnknownDriver(String),
}
