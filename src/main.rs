//! feed-ingest binary entrypoint.
//! Loads config, wires the pipeline, serves the operational endpoints and
//! runs until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use feed_ingest::clock::SystemClock;
use feed_ingest::metrics::Metrics;
use feed_ingest::{api, shutdown, Pipeline, PipelineConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` filter (default `feed_ingest=info,pipeline=info,warn`); `LOG_FORMAT=json`
/// switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_ingest=info,pipeline=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    let metrics = Metrics::init()?;

    let pipeline = Pipeline::build(&cfg, Arc::new(SystemClock))?;
    info!(
        sources = pipeline.scheduled_sources(),
        export = cfg.export.enabled,
        "pipeline configured"
    );
    if pipeline.scheduled_sources() == 0 {
        warn!("no sources scheduled; only the exporter will run");
    }

    let stop = shutdown::install_signal_handler();

    let server = match cfg.api.listen {
        Some(addr) => {
            let app = api::router(pipeline.api_state(Some(metrics.handle.clone())));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!(%addr, "status api listening");
            let stop = stop.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { stop.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    pipeline.run(stop).await?;

    if let Some(s) = server {
        match s.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "status api stopped with error"),
            Err(e) => warn!(error = %e, "status api task failed"),
        }
    }
    Ok(())
}
