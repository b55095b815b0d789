// Main entry point for the bridge server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tillbridge_core::kernel::handlers::register_handlers;
use tillbridge_core::kernel::jobs::{Dispatcher, DispatcherConfig, JobRegistry};
use tillbridge_core::kernel::settings::keys;
use tillbridge_core::kernel::ServerDeps;
use tillbridge_core::server::build_app;
use tillbridge_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tillbridge_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tillbridge vendor queue service");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let deps = Arc::new(ServerDeps::new(pool, &config)?);

    // Embedded continuous dispatcher, gated by the runner flag. The
    // `runner:all` advisory lock keeps it from doubling up with an external
    // runner process.
    if deps
        .settings
        .get_bool_fresh(keys::RUNNER_ENABLED, false)
        .await
        .unwrap_or(false)
    {
        let mut registry = JobRegistry::new();
        register_handlers(&mut registry);
        let dispatcher = Dispatcher::new(
            deps.clone(),
            Arc::new(registry),
            DispatcherConfig {
                continuous: true,
                ..Default::default()
            },
        );
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run().await {
                tracing::error!(error = %e, "embedded dispatcher exited with error");
            }
        });
        tracing::info!("Embedded dispatcher started");
    }

    let app = build_app(deps);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Webhook intake: http://localhost:{}/webhooks/vendor", config.port);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
