//! # Logging
//!
//! One `tracing` subscriber for the whole binary, writing to stderr so the
//! `init` and `version` output on stdout stays clean. `RUST_LOG` replaces
//! the per-command default filter when set.
//!
//! In JSON mode every line carries the enclosing `round` span and its
//! `round_id`, so a single round can be followed across coordinator, gossip
//! and pruner with one filter.

use std::io;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for `run`.
pub const RUN_FILTER: &str = "arbiter_node=info,arbiter_protocol=info,tower_http=debug";

/// Default filter for `init`.
pub const INIT_FILTER: &str = "arbiter_node=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// `"json"` in any case selects JSON; anything else is pretty.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Installs the global subscriber. Panics if one is already installed.
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(io::stderr).with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init(),
    }

    tracing::debug!(?format, "logging initialized");
}
