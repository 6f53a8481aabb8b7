use anyhow::Context;
use tracing::info;

use taskbridge_api::app::{self, services};
use taskbridge_api::AppConfig;
use taskbridge_infra::Broker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    taskbridge_observability::init(config.log_format);

    info!(
        role = %config.role,
        broker = %config.broker.url,
        task_timeout_secs = config.bridge.task_timeout.as_secs(),
        "starting taskbridge"
    );

    let broker = Broker::from_config(&config.broker).context("failed to set up broker")?;

    let workers = config
        .role
        .runs_workers()
        .then(|| services::spawn_workers(&broker, config.worker.clone(), "worker"));

    if config.role.runs_api() {
        let addr = config.bind_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("listening on {}", listener.local_addr()?);

        let router = app::build_app(&broker, config.bridge);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server failed")?;
    } else {
        shutdown_signal().await;
    }

    if let Some(pool) = workers {
        let stats = pool.stats();
        pool.shutdown().await;
        info!(
            jobs_processed = stats.jobs_processed,
            jobs_failed = stats.jobs_failed,
            "worker pool stopped"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
