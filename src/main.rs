//! ChangeFlow API - Changeset Validation & Simulation
//!
//! Every changeset is dry-run against a throwaway copy of the canonical
//! database. The response says whether it is safe to apply, and why not.

use changeflow::config::{LogFormat, Settings};
use changeflow::routes::create_router;
use changeflow::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log format is known
    let settings = Settings::load()?;

    // Initialize tracing subscriber for structured logging
    init_tracing(settings.log_format);

    info!("🚀 Starting ChangeFlow - Changeset Validation Engine...");
    info!("📋 Configuration loaded successfully");

    let database = &settings.engine.database_path;
    if database.is_file() {
        info!("🗄️  Canonical database: {}", database.display());
    } else {
        warn!(
            "⚠️  Canonical database {} not found; requests must supply databasePath",
            database.display()
        );
    }
    if let Some(dir) = &settings.engine.report_dir {
        info!("🗂️  Archiving reports to {}", dir.display());
    }
    info!(
        "📏 Rules: {} unique, {} orphan, {} flag fields",
        settings.rules.unique_rules.len(),
        settings.rules.orphan_rules.len(),
        settings.rules.flag_fields.len()
    );

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    let state = Arc::new(AppState::new(settings.clone()));

    // Build the router
    let app = create_router(state, &settings);

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   GET  /health               - Health check");
    info!("   GET  /api/schema           - Introspected schema of the canonical database");
    info!("   POST /api/validate         - Validate one changeset");
    info!("   POST /api/validate/batch   - Validate several changesets");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,changeflow=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
