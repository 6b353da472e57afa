//! Last-known axis positions.
//!
//! The cache is written only by the command engine, after a successful
//! position query or an acknowledged move, under the same lock that
//! serializes the link. Nothing refreshes it in the background.
//!
//! **Staleness**: a snapshot reflects the last explicit exchange only. The
//! controller's joystick moves the stage without going through this driver,
//! so a snapshot may be arbitrarily far from the real position. Call
//! `get_position_mm` when an up-to-date value matters.

use crate::axis::AxisId;
use std::collections::BTreeMap;

/// Snapshot of cached positions in millimeters, keyed by axis.
pub type Position = BTreeMap<AxisId, f64>;

#[derive(Debug, Clone, Default)]
pub struct PositionCache {
    positions: Position,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the cached values. Never performs I/O.
    pub fn read(&self) -> Position {
        self.positions.clone()
    }

    /// Cached value for one axis, if any exchange has produced one.
    pub fn get(&self, axis: &str) -> Option<f64> {
        self.positions.get(axis).copied()
    }

    pub(crate) fn update(&mut self, axis: &AxisId, value_mm: f64) {
        self.positions.insert(axis.clone(), value_mm);
    }

    /// Forget an axis whose position is no longer known (e.g. after a raw
    /// motion command or a reference move).
    pub(crate) fn invalidate(&mut self, axis: &AxisId) {
        self.positions.remove(axis);
    }

    pub(crate) fn clear(&mut self) {
        self.positions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_is_a_snapshot() {
        let mut cache = PositionCache::new();
        let axis = AxisId::parse("1").unwrap();

        cache.update(&axis, 10.0);
        let snapshot = cache.read();
        cache.update(&axis, 11.0);

        assert_eq!(snapshot.get("1"), Some(&10.0));
        assert_eq!(cache.get("1"), Some(11.0));
    }

    #[test]
    fn test_invalidate_forgets_axis() {
        let mut cache = PositionCache::new();
        let axis = AxisId::parse("2").unwrap();

        cache.update(&axis, -4.0);
        cache.invalidate(&axis);

        assert_eq!(cache.get("2"), None);
        assert!(cache.read().is_empty());
    }
}
