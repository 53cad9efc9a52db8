mod executor;

use executor::Executor;
use skillgrade_common::config::ScoringConfig;
use skillgrade_common::redis::RedisStore;
use skillgrade_engine::{DockerSandbox, LanguageRegistry};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Skillgrade worker booting...");

    let config = ScoringConfig::from_env().map_err(|e| {
        error!("Invalid scoring configuration: {}", e);
        e
    })?;
    info!(
        timeout_ms = config.sandbox_timeout_ms,
        parallel_answers = config.max_parallel_answers,
        plagiarism_threshold = config.plagiarism_threshold,
        "Scoring configuration loaded"
    );

    let languages = LanguageRegistry::load_default().map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure config/languages.json exists or set SKILLGRADE_LANGUAGES");
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let sandbox = Arc::new(DockerSandbox::connect(languages)?);
    info!("Connected to Docker");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisStore::connect(&redis_url).await?;
    info!("Connected to Redis: {}", redis_url);

    let executor = Executor::new(store, sandbox, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        warn!("Received shutdown signal, stopping after current request...");
        let _ = shutdown_tx.send(true);
    });

    executor.run(shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}
