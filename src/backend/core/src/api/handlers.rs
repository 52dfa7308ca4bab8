//! API endpoint handlers.

use crate::api::{ApiResponse, AppState};
use crate::cache::{CacheControl, ETagGenerator, FilterParams, CATEGORIES_NAMESPACE, PRODUCTS_NAMESPACE};
use crate::catalog::{CatalogPage, NormalizedProduct};
use crate::error::Result;
use crate::upstream::{CategoryQuery, CategoryNode};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "cache": {
            "distributed": state.store.has_distributed(),
            "local_entries": state.coordinator.entry_count(),
            "inflight_fetches": state.coordinator.inflight_count(),
        }
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Product Listing
// ═══════════════════════════════════════════════════════════════════════════════

/// Response envelope for product lists.
#[derive(Debug, Serialize)]
pub struct ProductListResponse {
    pub data: Vec<NormalizedProduct>,
    pub meta: ProductListMeta,
}

#[derive(Debug, Serialize)]
pub struct ProductListMeta {
    pub count: usize,
    pub page: u32,
    pub per_page: u32,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    /// When the served batch was fetched from the upstream.
    pub timestamp: DateTime<Utc>,
    /// When the served batch stops being fresh.
    pub cache_expiry: DateTime<Utc>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stale: Option<bool>,
}

/// `GET /api/v1/products`
///
/// Serves a filtered product list through the fetch coordinator and applies
/// the conditional-response layer: a request whose `If-None-Match` matches
/// the freshly computed ETag receives a bodiless 304.
#[instrument(skip(state, headers))]
pub async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<FilterParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let page = state.coordinator.get_products(&params).await?;
    let envelope = build_envelope(&page, &state);

    let body = serde_json::to_string(&envelope)?;
    let etag = ETagGenerator::weak(body.as_bytes());

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response_headers.insert(
        header::CACHE_CONTROL,
        CacheControl::catalog(state.catalog.fresh_ttl, state.catalog.swr_window)
            .to_header_value(),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response_headers.insert(header::ETAG, value);
    }
    insert_str(&mut response_headers, "x-cache", page.status.as_str());
    insert_str(&mut response_headers, "x-cache-source", page.source.as_str());
    insert_str(
        &mut response_headers,
        "x-cache-namespace-version",
        &page.namespace_version.to_string(),
    );

    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
    {
        if ETagGenerator::matches_any(&etag, if_none_match) {
            return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
        }
    }

    Ok((StatusCode::OK, response_headers, body).into_response())
}

fn build_envelope(page: &CatalogPage, state: &AppState) -> ProductListResponse {
    let has_more = match page.total_pages {
        Some(total_pages) => u64::from(page.filter.page) < total_pages,
        None => page.products.len() as u32 >= page.filter.per_page,
    };

    let fresh = chrono::Duration::from_std(state.catalog.fresh_ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(0));

    ProductListResponse {
        meta: ProductListMeta {
            count: page.products.len(),
            page: page.filter.page,
            per_page: page.filter.per_page,
            total: page.total,
            total_pages: page.total_pages,
            timestamp: page.written_at,
            cache_expiry: page.written_at + fresh,
            has_more,
            is_stale: page.is_stale.then_some(true),
        },
        data: page.products.clone(),
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Category Listing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct CategoriesParams {
    pub slug: Option<String>,
    pub parent: Option<u64>,
    pub per_page: Option<u32>,
}

/// `GET /api/v1/categories`
///
/// Cached pass-through of the upstream category listing, under its own
/// namespace so product invalidation does not churn it.
#[instrument(skip(state))]
pub async fn list_categories(
    State(state): State<AppState>,
    Query(params): Query<CategoriesParams>,
) -> Result<Response> {
    let namespace_version = state.store.namespace_version(CATEGORIES_NAMESPACE).await;
    let slug = params
        .slug
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let per_page = params.per_page.map(|v| v.clamp(1, 100));

    let key = format!(
        "{}:v{}:slug={}|parent={}|per_page={}",
        CATEGORIES_NAMESPACE,
        namespace_version,
        slug.as_deref().unwrap_or(""),
        params.parent.map(|p| p.to_string()).unwrap_or_default(),
        per_page.map(|p| p.to_string()).unwrap_or_default(),
    );

    if let Some((categories, tier)) = state.store.get_json::<Vec<CategoryNode>>(&key).await {
        let mut headers = HeaderMap::new();
        insert_str(&mut headers, "x-cache", "HIT");
        insert_str(&mut headers, "x-cache-source", tier.as_str());
        return Ok((headers, Json(ApiResponse::success(categories))).into_response());
    }

    let query = CategoryQuery {
        slug,
        parent: params.parent,
        per_page,
    };
    let categories = state.upstream.fetch_categories(&query).await?;

    state
        .store
        .set_json(&key, &categories, state.catalog.categories_ttl)
        .await;

    let mut headers = HeaderMap::new();
    insert_str(&mut headers, "x-cache", "MISS");
    insert_str(&mut headers, "x-cache-source", "upstream");
    Ok((headers, Json(ApiResponse::success(categories))).into_response())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Invalidation
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub previous_version: u64,
    pub version: u64,
    pub purged: u64,
}

/// `POST /api/v1/cache/invalidate`
///
/// Bumps the products namespace version (instantly detaching every derived
/// key) and purges the now-unreachable entries in the background of the
/// request.
#[instrument(skip(state))]
pub async fn invalidate_cache(State(state): State<AppState>) -> Result<Response> {
    let previous_version = state.store.namespace_version(PRODUCTS_NAMESPACE).await;
    let version = state.store.bump_namespace(PRODUCTS_NAMESPACE).await;
    let purged = state
        .store
        .purge_prefix(&format!("{}:", PRODUCTS_NAMESPACE))
        .await;

    Ok(Json(ApiResponse::success(InvalidateResponse {
        previous_version,
        version,
        purged,
    }))
    .into_response())
}
