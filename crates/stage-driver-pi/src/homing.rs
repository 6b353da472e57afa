//! Reference-move interlock.
//!
//! Each axis runs a small state machine:
//!
//! ```text
//!            home()           FRF? = 1
//! Unknown ─────────▶ Homing ──────────▶ Homed
//!    ▲                 │                  │
//!    └─────────────────┴──────────────────┘
//!      timeout / error        reboot
//! ```
//!
//! `mark_homed` jumps straight to `Homed` for controllers whose firmware
//! startup macro already ran the reference move. The driver never assumes
//! that happened; it trusts only a reference move it watched finish or an
//! explicit confirmation.

use crate::axis::AxisId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomingState {
    #[default]
    Unknown,
    Homing,
    Homed,
}

#[derive(Debug, Clone, Default)]
pub struct HomingController {
    states: BTreeMap<AxisId, HomingState>,
}

impl HomingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, axis: &str) -> HomingState {
        self.states.get(axis).copied().unwrap_or_default()
    }

    pub fn is_homed(&self, axis: &str) -> bool {
        self.state(axis) == HomingState::Homed
    }

    /// Reference move sent. Allowed from any state; re-homing a homed axis
    /// drops it back through `Homing`.
    pub fn begin(&mut self, axis: &AxisId) {
        self.transition(axis, HomingState::Homing);
    }

    /// Reference move acknowledged.
    pub fn complete(&mut self, axis: &AxisId) {
        self.transition(axis, HomingState::Homed);
    }

    /// Reference move timed out or was rejected.
    pub fn abort(&mut self, axis: &AxisId) {
        self.transition(axis, HomingState::Unknown);
    }

    /// Out-of-band confirmation that the axis is referenced.
    pub fn mark_homed(&mut self, axis: &AxisId) {
        self.transition(axis, HomingState::Homed);
    }

    /// Controller rebooted; every axis lost its reference.
    pub fn reset(&mut self) {
        if !self.states.is_empty() {
            tracing::debug!(axes = self.states.len(), "Homing state reset");
        }
        self.states.clear();
    }

    fn transition(&mut self, axis: &AxisId, to: HomingState) {
        let from = self.states.insert(axis.clone(), to).unwrap_or_default();
        if from != to {
            tracing::debug!(axis = %axis, ?from, ?to, "Homing state changed");
        }
    }
}
