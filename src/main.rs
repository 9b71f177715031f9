use duckdb::Connection;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidemark::config::Config;
use tidemark::ingest::enrich::StandardEnricher;
use tidemark::ingest::handler::AppState;
use tidemark::rollup::scheduler;
use tidemark::{server, storage};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidemark=info,tower_http=info".into()),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref().map(std::path::Path::new));

    tracing::info!(
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        reject_unresolved = config.reject_unresolved,
        "Starting Tidemark"
    );

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data directory");

    let conn = Connection::open(config.database_path()).expect("Failed to open DuckDB");
    storage::migrations::run_migrations(&conn).expect("Failed to run migrations");
    let conn = Arc::new(Mutex::new(conn));

    let enricher = StandardEnricher::new(config.geoip_db_path.as_deref());
    let geoip_loaded = enricher.geoip_loaded();
    if !geoip_loaded {
        tracing::warn!("No GeoIP database loaded; country, region and city will be absent");
    }

    let mut state = AppState::new(Arc::clone(&conn), Arc::new(enricher));
    state.allowed_sites.clone_from(&config.site_ids);
    state.policy = config.unresolved_policy();
    state.geoip_loaded = geoip_loaded;
    let state = Arc::new(state);

    let compaction = tokio::spawn(scheduler::run_compaction_loop(
        Arc::clone(&state),
        Duration::from_secs(config.compaction_delay_secs),
        config.repair_lookback_days,
    ));

    let app = server::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(addr = %addr, "Listening");

    let stop = Arc::new(tokio::sync::Notify::new());
    let stopped = Arc::clone(&stop);
    let mut serve = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stopped.notified().await })
            .await
    });

    tokio::select! {
        result = &mut serve => {
            tracing::error!(result = ?result, "Server exited unexpectedly");
        }
        () = shutdown_signal() => {
            tracing::info!(
                timeout_secs = config.shutdown_timeout_secs,
                "Shutdown signal received, draining connections"
            );
            stop.notify_one();
            let timeout = Duration::from_secs(config.shutdown_timeout_secs);
            if tokio::time::timeout(timeout, &mut serve).await.is_err() {
                tracing::warn!("Graceful shutdown timed out");
                serve.abort();
            }
        }
    }

    compaction.abort();
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
