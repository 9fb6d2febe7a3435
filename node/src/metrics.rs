//! # Prometheus Metrics
//!
//! Exposes round and peer metrics for the adjudicator node. Scraped by
//! Prometheus at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are `Arc`s internally) so it can be
/// shared across request handlers and round drivers.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Rounds that finalized with a majority-agreed set.
    pub rounds_finalized_total: IntCounter,
    /// Rounds that ended in a `RoundFailure`.
    pub rounds_failed_total: IntCounter,
    /// Wall time of each round, finalized or not.
    pub round_duration_seconds: Histogram,
    /// Last committed block height.
    pub block_height: IntGauge,
    /// Peers with a row in the peer table.
    pub connected_peers: IntGauge,
    /// Peers whose last heartbeat is inside the freshness window.
    pub fresh_peers: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("arbiter".into()), None)?;

        let rounds_finalized_total = IntCounter::new(
            "rounds_finalized_total",
            "Total number of consensus rounds that finalized",
        )?;
        registry.register(Box::new(rounds_finalized_total.clone()))?;

        let rounds_failed_total = IntCounter::new(
            "rounds_failed_total",
            "Total number of consensus rounds that failed",
        )?;
        registry.register(Box::new(rounds_failed_total.clone()))?;

        let round_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "round_duration_seconds",
                "Time from round start to outcome in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(round_duration_seconds.clone()))?;

        let block_height = IntGauge::new("block_height", "Height of the last committed block")?;
        registry.register(Box::new(block_height.clone()))?;

        let connected_peers =
            IntGauge::new("connected_peers", "Number of connected adjudicator peers")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let fresh_peers = IntGauge::new(
            "fresh_peers",
            "Number of peers with a heartbeat inside the freshness window",
        )?;
        registry.register(Box::new(fresh_peers.clone()))?;

        Ok(Self {
            registry,
            rounds_finalized_total,
            rounds_failed_total,
            round_duration_seconds,
            block_height,
            connected_peers,
            fresh_peers,
        })
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
