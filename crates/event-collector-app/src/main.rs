use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use event_collector_core::CollectorConfig;
use event_collector_service::{RunOutcome, Supervisor};

/// Exit codes: 0 clean shutdown, 1 fatal startup failure, 2 fatal runtime
/// failure.
#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging();

    let config = match CollectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };

    tracing::info!(
        workers = config.worker_pool_size,
        batch_size = config.batch_size,
        metrics_port = config.metrics_port,
        "starting event collector"
    );

    match Supervisor::new(config).run().await {
        Ok(RunOutcome::Clean) => {
            tracing::info!("shutdown complete");
        }
        Ok(RunOutcome::Fatal(reason)) => {
            tracing::error!(reason, "fatal runtime failure");
            process::exit(2);
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
