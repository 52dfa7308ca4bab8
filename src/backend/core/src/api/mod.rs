//! HTTP API layer for Vitrine Core.
//!
//! Exposes the catalog gateway over REST:
//!
//! - `GET /api/v1/products`: filtered product lists with the full cache
//!   orchestration behind them (ETag, Cache-Control, cache diagnostics)
//! - `GET /api/v1/categories`: cached category listing
//! - `POST /api/v1/cache/invalidate`: namespace-version bump + prefix purge
//! - `GET /health`, `GET /metrics`: unversioned operational endpoints

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::cache::CacheStore;
use crate::catalog::FetchCoordinator;
use crate::config::CatalogConfig;
use crate::upstream::UpstreamClient;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: FetchCoordinator,
    pub store: Arc<CacheStore>,
    pub upstream: Arc<UpstreamClient>,
    pub catalog: CatalogConfig,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Unversioned endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        // V1 API
        .nest(
            "/api/v1",
            Router::new()
                .route("/products", get(handlers::list_products))
                .route("/categories", get(handlers::list_categories))
                .route("/cache/invalidate", post(handlers::invalidate_cache)),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper for non-catalog endpoints.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
