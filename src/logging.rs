//! Tracing subscriber setup for binaries and test harnesses embedding qa-pilot.
//!
//! The library only emits `tracing` events; nothing here runs unless the host
//! calls [`init_tracing`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Primary filter variable; `RUST_LOG` is consulted when it is unset.
pub const LOG_ENV: &str = "QA_PILOT_LOG";

const DEFAULT_DIRECTIVE: &str = "qa_pilot=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Build the filter from an explicit directive string, falling back to the
/// default when it is missing or invalid.
pub fn build_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

fn filter_from_env() -> EnvFilter {
    let directives = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok());
    build_filter(directives.as_deref())
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = filter_from_env();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.is_ok()
}
