//! # Consensus State
//!
//! The process-wide record of where this adjudicator is: the last finalized
//! height, the phase currently being negotiated, and whether that phase has
//! finalized. Heartbeats advertise it, the coordinator and pruner read it,
//! and the block producer bumps the height when it commits.
//!
//! All mutation goes through a single `parking_lot::RwLock`; readers take a
//! cheap [`ConsensusSnapshot`] copy and never hold the lock across an await.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consensus::round::RoundKey;

/// Status of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Processing,
    Finalized,
}

/// An immutable copy of the consensus state at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    /// Height of the last finalized block.
    pub height: u64,
    /// Phase currently negotiated at `height + 1`.
    pub phase: u32,
    pub status: RoundStatus,
    /// Numeric draw for the current phase (random-number rounds).
    pub draw: u64,
    /// Opaque encrypted answer attached to the current phase, if any.
    pub answer: Option<String>,
    /// Whether the draw/answer pair has already been consumed.
    pub used: bool,
}

impl ConsensusSnapshot {
    /// The round key currently being negotiated.
    pub fn active_key(&self) -> RoundKey {
        RoundKey::new(self.height + 1, self.phase)
    }

    pub fn is_finalized(&self) -> bool {
        self.status == RoundStatus::Finalized
    }
}

/// Lock-guarded consensus state. Create once per process and share via `Arc`.
#[derive(Debug)]
pub struct ConsensusState {
    inner: RwLock<ConsensusSnapshot>,
}

impl ConsensusState {
    /// Starts at `height` (last finalized), phase 0, processing.
    pub fn new(height: u64) -> Self {
        Self {
            inner: RwLock::new(ConsensusSnapshot {
                height,
                phase: 0,
                status: RoundStatus::Processing,
                draw: 0,
                answer: None,
                used: false,
            }),
        }
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        self.inner.read().clone()
    }

    pub fn height(&self) -> u64 {
        self.inner.read().height
    }

    /// Enters `phase` at the current height and marks it processing.
    pub fn begin_phase(&self, phase: u32) {
        let mut state = self.inner.write();
        if state.phase != phase {
            state.used = false;
        }
        state.phase = phase;
        state.status = RoundStatus::Processing;
    }

    /// Marks `phase` finalized. Ignored if the height moved on or a
    /// different phase is active by now.
    pub fn finalize_phase(&self, height: u64, phase: u32) -> bool {
        let mut state = self.inner.write();
        if state.height != height || state.phase != phase {
            debug!(
                height,
                phase,
                current_height = state.height,
                current_phase = state.phase,
                "stale phase finalization ignored"
            );
            return false;
        }
        state.status = RoundStatus::Finalized;
        true
    }

    /// Records a committed block. Heights only move forward.
    pub fn advance_height(&self, height: u64) -> bool {
        let mut state = self.inner.write();
        if height <= state.height {
            return false;
        }
        state.height = height;
        state.phase = 0;
        state.status = RoundStatus::Processing;
        state.draw = 0;
        state.answer = None;
        state.used = false;
        true
    }

    /// Stores this phase's draw and optional encrypted answer.
    pub fn set_draw(&self, draw: u64, answer: Option<String>) {
        let mut state = self.inner.write();
        state.draw = draw;
        state.answer = answer;
        state.used = false;
    }

    /// Marks the draw as consumed. Returns `false` if it already was.
    pub fn mark_used(&self) -> bool {
        let mut state = self.inner.write();
        !std::mem::replace(&mut state.used, true)
    }
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_processing_at_phase_zero() {
        let state = ConsensusState::new(7);
        let snap = state.snapshot();
        assert_eq!(snap.height, 7);
        assert_eq!(snap.phase, 0);
        assert_eq!(snap.status, RoundStatus::Processing);
        assert_eq!(snap.active_key(), RoundKey::new(8, 0));
    }

    #[test]
    fn finalize_only_matches_current_phase() {
        let state = ConsensusState::new(1);
        state.begin_phase(2);
        assert!(!state.finalize_phase(1, 1));
        assert!(!state.snapshot().is_finalized());
        assert!(state.finalize_phase(1, 2));
        assert!(state.snapshot().is_finalized());
    }

    #[test]
    fn begin_phase_resets_status() {
        let state = ConsensusState::new(1);
        state.finalize_phase(1, 0);
        state.begin_phase(1);
        let snap = state.snapshot();
        assert_eq!(snap.phase, 1);
        assert_eq!(snap.status, RoundStatus::Processing);
    }

    #[test]
    fn height_only_moves_forward() {
        let state = ConsensusState::new(5);
        state.begin_phase(3);
        state.set_draw(99, Some("ciphertext".into()));
        assert!(!state.advance_height(5));
        assert!(!state.advance_height(4));
        assert!(state.advance_height(6));

        let snap = state.snapshot();
        assert_eq!(snap.height, 6);
        assert_eq!(snap.phase, 0);
        assert_eq!(snap.draw, 0);
        assert!(snap.answer.is_none());
    }

    #[test]
    fn draw_is_used_once() {
        let state = ConsensusState::new(0);
        state.set_draw(17, None);
        assert!(state.mark_used());
        assert!(!state.mark_used());
        assert!(state.snapshot().used);
    }
}
