use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lifeline_core::ContextJudge;
use lifeline_detect::{Detector, HttpJudge};
use lifeline_engine::{CrisisEngine, EngineConfig, MemoryStore};
use lifeline_server::ServerConfig;
use lifeline_telemetry::{init_telemetry, TelemetryConfig};

/// Crisis detection and escalation server.
#[derive(Parser, Debug)]
#[command(name = "lifeline", version)]
struct Cli {
    /// Settings file to use instead of ~/.lifeline/settings.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => lifeline_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => lifeline_settings::load_settings().context("loading settings")?,
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(TelemetryConfig::from_levels(
        &settings.logging.level,
        &settings.logging.module_levels,
        settings.logging.json,
    ));
    tracing::info!(name = %settings.name, version = %settings.version, "starting lifeline");

    let judge: Option<Arc<dyn ContextJudge>> = if settings.classifier.enabled {
        let judge = HttpJudge::new(
            &settings.classifier.base_url,
            &settings.classifier.model,
            Duration::from_millis(settings.classifier.timeout_ms),
        )
        .context("building classifier client")?;
        tracing::info!(endpoint = judge.endpoint(), model = %settings.classifier.model, "classifier enabled");
        Some(Arc::new(judge))
    } else {
        tracing::info!("classifier disabled, local detection only");
        None
    };

    let detector = Detector::from_settings(&settings.detection, &settings.classifier, judge)
        .context("compiling detection taxonomy")?;

    let engine = CrisisEngine::new(
        Arc::new(detector),
        Arc::new(MemoryStore::new()),
        telemetry.metrics(),
        EngineConfig::from_settings(&settings),
    );

    let handle = lifeline_server::start(ServerConfig::from_settings(&settings.server), engine.clone())
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "lifeline ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    engine.shutdown();
    handle.shutdown().await;
    Ok(())
}
