//! Run the catalog pipeline once and exit.
use anyhow::Context;
use catalog_pipeline::config::{Config, LogFormat};
use catalog_pipeline::orchestrator::Pipeline;
use catalog_pipeline::sink::JsonFileSink;
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(format: LogFormat) {
    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

async fn interrupted() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("failed to register SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    setup_tracing(config.log_format);
    info!(category = config.category.as_str(), "starting catalog pipeline");

    let sink = JsonFileSink::new(config.output_dir.clone());
    let pipeline = Pipeline::new(config, sink)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            interrupted().await;
            warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });

    match pipeline.run(cancel).await {
        Ok(report) => {
            info!(
                records = report.stats.records,
                requests = report.stats.catalog.requests,
                retries = report.stats.catalog.retries,
                grade = %report.metrics.grade,
                duration_secs = report.duration().as_secs_f64(),
                "run finished"
            );
            info!("{}", serde_json::to_string(&report.stats)?);
            Ok(())
        }
        Err(e) => {
            error!("run failed: {}", e);
            Err(e).context("catalog pipeline run failed")
        }
    }
}
