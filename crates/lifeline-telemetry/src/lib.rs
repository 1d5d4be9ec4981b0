mod metrics;

pub use metrics::{HistogramSummary, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "lifeline_detect" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; plain text otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from string levels, skipping entries that do not parse.
    pub fn from_levels<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a String, &'a String)>,
        json: bool,
    ) -> Self {
        let log_level = level.parse().unwrap_or(Level::INFO);
        let module_levels = modules
            .into_iter()
            .filter_map(|(m, l)| l.parse().ok().map(|lvl| (m.clone(), lvl)))
            .collect();
        Self {
            log_level,
            module_levels,
            json,
        }
    }

    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle returned by [`init_telemetry`]. Owns the process metrics recorder.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// Shared recorder handed to the engine and the server.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// Per-module overrides the subscriber was built with.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize the tracing subscriber. Call once at startup.
///
/// A second call (tests, embedded use) keeps the existing subscriber and
/// still returns a fresh recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        module_levels: Arc::new(RwLock::new(config.module_levels)),
    }
}
