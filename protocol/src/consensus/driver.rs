//! # Round Driver
//!
//! The long-running loop that keeps an adjudicator taking part in rounds.
//! It owns no protocol logic of its own: the application decides what to
//! negotiate next, the coordinator runs it, and the application gets told
//! how it went.
//!
//! ## How it works
//!
//! Each iteration:
//!
//! 1. Snapshot the consensus state and ask the application for a
//!    [`PhasePlan`]. `None` means there is nothing to do yet; sleep
//!    `idle_delay` and ask again.
//! 2. Sign the planned payload and run the round.
//! 3. Hand the outcome to [`RoundApplication::accept`]. This is where the
//!    block producer commits and advances the height.
//! 4. On failure, sleep `retry_delay` before the next attempt.
//!
//! ## Shutdown
//!
//! The loop watches a `tokio::sync::watch` channel, including while a round
//! is in flight. Dropping the in-flight round cancels its gossip fills, so
//! nothing outlives the driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ROUND_RETRY_DELAY;
use crate::consensus::coordinator::RoundCoordinator;
use crate::consensus::round::{RoundKind, RoundOutcome};
use crate::consensus::state::{ConsensusSnapshot, ConsensusState};
use crate::crypto::keys::ArbiterKeypair;
use crate::crypto::signatures::contribution_message;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Pause after a failed round.
    pub retry_delay_ms: u64,
    /// Pause when the application has nothing to negotiate.
    pub idle_delay_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: ROUND_RETRY_DELAY.as_millis() as u64,
            idle_delay_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Application seam
// ---------------------------------------------------------------------------

/// One phase the application wants negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub phase: u32,
    pub kind: RoundKind,
    /// Opaque contribution payload. The driver signs it.
    pub payload: String,
    pub finalize_timeout: Duration,
}

/// The block-production side of the node: produces round payloads and
/// consumes finalized rounds.
#[async_trait]
pub trait RoundApplication: Send + Sync {
    /// What to negotiate next from `snapshot`, or `None` to wait.
    async fn plan(&self, snapshot: &ConsensusSnapshot) -> Option<PhasePlan>;

    /// Receives every round outcome along with how long the round took.
    async fn accept(&self, outcome: &RoundOutcome, elapsed: Duration) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The application could not process an outcome. Logged; the loop goes on.
    #[error("application error: {0}")]
    Application(String),
    /// The shutdown signal was received. This is the normal way out.
    #[error("round driver received shutdown signal")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Finalized and failed round counts since the driver started.
#[derive(Debug, Default)]
pub struct DriverStats {
    finalized: AtomicU64,
    failed: AtomicU64,
}

impl DriverStats {
    pub fn finalized(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct RoundDriver {
    coordinator: Arc<RoundCoordinator>,
    keypair: ArbiterKeypair,
    state: Arc<ConsensusState>,
    app: Arc<dyn RoundApplication>,
    config: DriverConfig,
    stats: Arc<DriverStats>,
}

impl RoundDriver {
    pub fn new(
        coordinator: Arc<RoundCoordinator>,
        keypair: ArbiterKeypair,
        state: Arc<ConsensusState>,
        app: Arc<dyn RoundApplication>,
        config: DriverConfig,
    ) -> Self {
        Self {
            coordinator,
            keypair,
            state,
            app,
            config,
            stats: Arc::new(DriverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DriverStats> {
        Arc::clone(&self.stats)
    }

    /// Runs rounds until the shutdown signal fires. Always ends with
    /// [`DriverError::Shutdown`] on a clean exit.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        info!(address = %self.keypair.address(), "round driver starting");

        loop {
            if *shutdown.borrow() {
                info!("round driver received shutdown signal, exiting cleanly");
                return Err(DriverError::Shutdown);
            }

            let snapshot = self.state.snapshot();
            let delay = match self.app.plan(&snapshot).await {
                None => Duration::from_millis(self.config.idle_delay_ms),
                Some(plan) => {
                    let started = Instant::now();
                    let outcome = tokio::select! {
                        outcome = self.run_plan(plan) => outcome,
                        _ = shutdown.changed() => {
                            info!("round driver shutting down mid-round");
                            return Err(DriverError::Shutdown);
                        }
                    };
                    self.record(&outcome, started.elapsed()).await
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("round driver shutting down during sleep");
                    return Err(DriverError::Shutdown);
                }
            }
        }
    }

    async fn run_plan(&self, plan: PhasePlan) -> RoundOutcome {
        let signature = self.keypair.sign_hex(&contribution_message(&plan.payload));
        self.coordinator
            .run_round(
                plan.phase,
                plan.payload,
                signature,
                plan.finalize_timeout,
                plan.kind,
            )
            .await
    }

    /// Updates stats, notifies the application, and picks the next delay.
    async fn record(&self, outcome: &RoundOutcome, elapsed: Duration) -> Duration {
        let delay = match outcome {
            RoundOutcome::Finalized { key, .. } => {
                self.stats.finalized.fetch_add(1, Ordering::Relaxed);
                debug!(%key, elapsed_ms = elapsed.as_millis() as u64, "driver saw finalized round");
                Duration::ZERO
            }
            RoundOutcome::Failed { key, reason } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(%key, reason = %reason, "driver saw failed round, will retry");
                Duration::from_millis(self.config.retry_delay_ms)
            }
        };

        if let Err(e) = self.app.accept(outcome, elapsed).await {
            warn!(error = %e, "application rejected round outcome");
        }
        delay
    }
}
