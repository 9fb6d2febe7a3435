//! # Devnet Application
//!
//! The block-production side the devnet runs on top of the round driver.
//! Each height goes through three phases:
//!
//! ```text
//! Initial (draw) -> Middle (confirm) -> Last (commit) -> advance height
//! ```
//!
//! The Initial payload carries a random draw. When the Last phase finalizes,
//! the producer is elected from that phase's set and every adjudicator
//! commits the height. There are no real blocks; a commit is a log line and
//! a metrics update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use arbiter_protocol::config::FINALIZE_TIMEOUT;
use arbiter_protocol::consensus::{
    elect_producer, ConsensusSnapshot, ConsensusState, DriverError, PhasePlan, RoundApplication,
    RoundKind, RoundOutcome,
};

use crate::metrics::SharedMetrics;

/// Phases per height.
const PHASES: u32 = 3;

pub struct DevnetApplication {
    address: String,
    state: Arc<ConsensusState>,
    /// Only adjudicator 0 reports into the shared registry.
    metrics: Option<SharedMetrics>,
}

impl DevnetApplication {
    pub fn new(address: String, state: Arc<ConsensusState>, metrics: Option<SharedMetrics>) -> Self {
        Self {
            address,
            state,
            metrics,
        }
    }
}

/// Phase kind for `phase` within a height.
fn kind_of(phase: u32) -> RoundKind {
    match phase {
        0 => RoundKind::Initial,
        p if p + 1 >= PHASES => RoundKind::Last,
        _ => RoundKind::Middle,
    }
}

#[async_trait]
impl RoundApplication for DevnetApplication {
    async fn plan(&self, snapshot: &ConsensusSnapshot) -> Option<PhasePlan> {
        let phase = if snapshot.is_finalized() {
            snapshot.phase + 1
        } else {
            snapshot.phase
        };
        if phase >= PHASES {
            // Last phase finalized but not yet committed.
            return None;
        }

        let height = snapshot.height + 1;
        let payload = match phase {
            0 => {
                let draw: u64 = rand::random();
                self.state.set_draw(draw, None);
                format!("{height}/{phase}/draw={draw}")
            }
            _ => format!("{height}/{phase}/draw={}", snapshot.draw),
        };

        Some(PhasePlan {
            phase,
            kind: kind_of(phase),
            payload,
            finalize_timeout: FINALIZE_TIMEOUT,
        })
    }

    async fn accept(&self, outcome: &RoundOutcome, elapsed: Duration) -> Result<(), DriverError> {
        if let Some(metrics) = &self.metrics {
            metrics
                .round_duration_seconds
                .observe(elapsed.as_secs_f64());
            if outcome.is_finalized() {
                metrics.rounds_finalized_total.inc();
            } else {
                metrics.rounds_failed_total.inc();
            }
        }

        let RoundOutcome::Finalized { key, entries, .. } = outcome else {
            return Ok(());
        };
        if key.phase + 1 < PHASES {
            return Ok(());
        }

        let producer = elect_producer(entries)
            .ok_or_else(|| DriverError::Application("finalized an empty set".into()))?;
        if self.state.advance_height(key.height) {
            info!(
                height = key.height,
                producer = %producer,
                local = producer == self.address,
                "height committed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.block_height.set(key.height as i64);
            }
        }
        Ok(())
    }
}
