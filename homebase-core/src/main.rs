//! Homebase server binary

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use homebase_core::repository::pg;
use homebase_core::storage::LocalFsBackend;
use homebase_core::{build_router, AuthKernel, Config, Repositories};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().context("failed to load configuration")?;

    let kernel = if config.database.url.is_empty() {
        tracing::warn!("no database configured; running with in-memory stores");
        AuthKernel::in_memory(config).await?
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .context("failed to connect to the database")?;
        // IAM schema must be in place before anything is served.
        pg::migrate(&pool)
            .await
            .context("database migration failed")?;

        let backend = Arc::new(LocalFsBackend::new(config.storage.data_dir.clone()));
        AuthKernel::bootstrap(config, Repositories::postgres(pool), backend).await?
    };

    let bind = kernel.config().server.bind.clone();
    let app = build_router(kernel);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
