//! Axis identity, unit scale and travel range.

use crate::error::GcsError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Two values closer than this are treated as the same limit position.
pub const LIMIT_MATCH_TOLERANCE_MM: f64 = 1e-9;

/// GCS axis identifier ("1", "2", ...).
///
/// Identifiers are short alphanumeric tokens. Anything else would break the
/// space-separated command framing, so construction is checked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisId(String);

impl AxisId {
    pub fn parse(s: &str) -> Result<Self, GcsError> {
        let valid = !s.is_empty()
            && s.len() <= 8
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(GcsError::InvalidAxisId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AxisId {
    type Err = GcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AxisId {
    type Error = GcsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AxisId> for String {
    fn from(id: AxisId) -> Self {
        id.0
    }
}

impl Borrow<str> for AxisId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Closed travel interval `[min_mm, max_mm]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelLimits {
    pub min_mm: f64,
    pub max_mm: f64,
}

impl TravelLimits {
    pub fn new(min_mm: f64, max_mm: f64) -> Self {
        Self { min_mm, max_mm }
    }

    /// NaN is never contained.
    pub fn contains(&self, value_mm: f64) -> bool {
        self.min_mm <= value_mm && value_mm <= self.max_mm
    }

    /// The limit `value_mm` sits on, if any.
    pub fn matching(&self, value_mm: f64) -> Option<f64> {
        if (value_mm - self.min_mm).abs() <= LIMIT_MATCH_TOLERANCE_MM {
            Some(self.min_mm)
        } else if (value_mm - self.max_mm).abs() <= LIMIT_MATCH_TOLERANCE_MM {
            Some(self.max_mm)
        } else {
            None
        }
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.min_mm, self.max_mm)
    }

    pub fn is_valid(&self) -> bool {
        self.min_mm.is_finite() && self.max_mm.is_finite() && self.min_mm <= self.max_mm
    }
}

/// Closed-loop profile maxima (`SPA? 0xA/0x4A/0x4B`). `None` when not
/// read; rate settings are then only checked for sign.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileLimits {
    pub max_velocity: Option<f64>,
    pub max_acceleration: Option<f64>,
    pub max_deceleration: Option<f64>,
}

/// Static description of one controller axis, discovered at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    pub id: AxisId,
    /// Encoder counts per millimeter, when the controller reported it.
    pub counts_per_mm: Option<f64>,
    pub limits: TravelLimits,
    pub profile: ProfileLimits,
    /// Exclusive upper bound for the on-target exit window, in counts.
    pub max_tolerance_counts: Option<i64>,
}

impl Axis {
    pub fn new(id: AxisId, limits: TravelLimits) -> Self {
        Self {
            id,
            counts_per_mm: None,
            limits,
            profile: ProfileLimits::default(),
            max_tolerance_counts: None,
        }
    }

    pub fn with_counts_per_mm(mut self, counts_per_mm: f64) -> Self {
        self.counts_per_mm = Some(counts_per_mm);
        self
    }

    /// Smallest addressable step in millimeters (one encoder count).
    pub fn resolution_mm(&self) -> Option<f64> {
        self.counts_per_mm
            .filter(|c| *c > 0.0)
            .map(|counts| 1.0 / counts)
    }

    pub fn mm_to_counts(&self, mm: f64) -> Option<i64> {
        self.counts_per_mm
            .filter(|c| *c > 0.0)
            .map(|c| (mm * c).round() as i64)
    }

    pub fn counts_to_mm(&self, counts: i64) -> Option<f64> {
        self.resolution_mm().map(|r| counts as f64 * r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_id_rejects_framing_characters() {
        assert!(AxisId::parse("1").is_ok());
        assert!(AxisId::parse("AXIS_2").is_ok());
        assert!(AxisId::parse("").is_err());
        assert!(AxisId::parse("1 2").is_err());
        assert!(AxisId::parse("1\n").is_err());
    }

    #[test]
    fn test_limits_contains_is_closed_interval() {
        let limits = TravelLimits::new(0.0, 25.0);
        assert!(limits.contains(0.0));
        assert!(limits.contains(25.0));
        assert!(!limits.contains(25.000001));
        assert!(!limits.contains(f64::NAN));
    }

    #[test]
    fn test_limits_matching() {
        let limits = TravelLimits::new(-12.5, 12.5);
        assert_eq!(limits.matching(12.5), Some(12.5));
        assert_eq!(limits.matching(-12.5), Some(-12.5));
        assert_eq!(limits.matching(12.4), None);
    }

    #[test]
    fn test_resolution_from_counts() {
        let axis = Axis::new(AxisId::parse("1").unwrap(), TravelLimits::new(0.0, 25.0))
            .with_counts_per_mm(10_000.0);
        assert_eq!(axis.resolution_mm(), Some(1e-4));
        assert_eq!(axis.mm_to_counts(1.23456), Some(12346));
        assert_eq!(axis.counts_to_mm(5), Some(5e-4));
    }
}
