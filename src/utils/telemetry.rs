//! Telemetry and structured logging setup.
//!
//! Log lines carry the emitting component's name in brackets, so one process
//! running several connections or engines can be filtered per component.
//! Verbosity comes from `RUST_LOG`.

use std::time::Duration;

use tokio::time::Instant;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,marketlink=debug";

/// Initializes the telemetry/logging system with compact, human-readable
/// output.
///
/// Example RUST_LOG values:
/// - `info` - All info and above
/// - `marketlink=trace,tokio_tungstenite=warn` - Trace for us, quiet socket
pub fn init_telemetry() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initializes telemetry with JSON output (for production).
pub fn init_telemetry_json() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_span_events(FmtSpan::CLOSE))
        .init();
}

/// Lets a noisy log record through at most once per interval.
///
/// Suppressed occurrences are counted so the next record can report them.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `true` if a record may be emitted now.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Number of records suppressed since the last call.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}
