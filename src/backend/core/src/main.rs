//! Vitrine Server - main entry point.
//!
//! Headless storefront catalog gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use vitrine_core::{
    api::{self, AppState},
    cache::{CacheStore, InMemoryBackend, RedisBackend, TieredBackend},
    catalog::{FetchCoordinator, NormalizerSettings},
    config::Config,
    observability,
    upstream::UpstreamClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize observability
    observability::init(
        "vitrine-server",
        config.observability.otlp_endpoint.as_deref(),
    )?;
    observability::metrics::register_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Vitrine Server");

    // Install the Prometheus recorder for /metrics
    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    // Attach the distributed cache tier; the service runs memory-only when
    // Redis is unreachable.
    let distributed = if config.redis.url.is_empty() {
        None
    } else {
        match RedisBackend::new(&config.redis.url, config.redis.key_prefix.clone()).await {
            Ok(backend) => Some(Arc::new(backend) as Arc<dyn vitrine_core::cache::CacheBackend>),
            Err(e) => {
                tracing::warn!(url = %config.redis.url, error = %e, "Redis unavailable, running memory-only");
                None
            }
        }
    };

    let store = Arc::new(CacheStore::new(Arc::new(TieredBackend::new(
        Arc::new(InMemoryBackend::new()),
        distributed,
    ))));

    // Upstream client
    let upstream = Arc::new(UpstreamClient::new(config.upstream.clone())?);
    tracing::info!(base_url = %config.upstream.base_url, "Upstream client ready");

    // Fetch coordinator
    let coordinator = FetchCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&upstream),
        NormalizerSettings::default(),
        config.catalog.clone(),
    );

    // Create app state
    let app_state = AppState {
        coordinator,
        store,
        upstream,
        catalog: config.catalog.clone(),
        metrics: metrics_handle,
    };

    // Build router
    let app = api::build_router(app_state);

    // Start server
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
