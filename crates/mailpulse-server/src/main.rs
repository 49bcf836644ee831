//! MailPulse - watcher service entry point

use anyhow::{Context, Result};
use mailpulse_api::AppState;
use mailpulse_common::config::{Config, LoggingConfig};
use mailpulse_core::{ManagerRegistry, PgManagerFactory};
use mailpulse_storage::{AccountRepository, DatabasePool};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::load()?);

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting MailPulse...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    let database = config.database.database_name();
    let registry = Arc::new(ManagerRegistry::new(Arc::new(PgManagerFactory::new(
        config.clone(),
        db_pool.clone(),
    ))));

    // Take part in leader election right away so watchers resume without
    // waiting for the first client call
    let manager = registry.get_or_start(&database).await?;
    info!(database = %database, is_leader = manager.is_leader(), "Subscription manager ready");

    let state = AppState {
        database: database.clone(),
        registry: registry.clone(),
        accounts: Arc::new(AccountRepository::new(db_pool.clone())),
        db_pool: Some(db_pool.clone()),
    };
    let app = mailpulse_api::create_router(state);

    let addr = format!("{}:{}", config.api.bind, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;
    info!("Starting API server on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("API server error: {}", e);
    }

    info!("Shutdown signal received");
    registry.shutdown_all().await;
    db_pool.close().await;

    info!("MailPulse shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
