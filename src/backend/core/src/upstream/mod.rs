//! HTTP client for the upstream commerce API.
//!
//! This module provides:
//! - [`UpstreamClient`]: a pooled, retrying client for the commerce REST API
//! - The loose upstream schemas ([`RawProduct`], [`CategoryNode`]) with
//!   defaulting rules for every optional field
//!
//! # Retry semantics
//!
//! Each call makes up to `max_attempts` (default 5) tries with exponential
//! backoff (`2^attempt × retry_base`, i.e. 2 s, 4 s, 8 s, 16 s between tries
//! at the 1 s default base). Only transient failures are retried: network
//! errors, timeouts, and 5xx responses. A 4xx response indicates a malformed
//! request and is raised immediately with the upstream status mirrored.
//!
//! Worst-case latency per call is therefore bounded by
//! `max_attempts * timeout + (2+4+8+16) * retry_base` (about 3 minutes at
//! the defaults), independent of the per-attempt timeout.

use crate::config::UpstreamConfig;
use crate::error::{Result, VitrineError};
use metrics::counter;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Product fields requested from the upstream. Keeping the list explicit
/// trims response payloads while guaranteeing the normalizer's inputs
/// (`meta_data`, `categories`) are always present.
pub const DEFAULT_PRODUCT_FIELDS: &str = "id,name,slug,price,regular_price,sale_price,\
average_rating,stock_quantity,manage_stock,images,short_description,description,\
categories,attributes,tags,date_created,meta_data,related_ids";

// ═══════════════════════════════════════════════════════════════════════════════
// Upstream Schemas
// ═══════════════════════════════════════════════════════════════════════════════

/// A product record as the upstream delivers it: every field optional,
/// numbers frequently encoded as strings, images either plain URLs or
/// objects. Coerced into [`crate::catalog::NormalizedProduct`] exactly once
/// at the normalization boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProduct {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub slug: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub price: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub regular_price: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub sale_price: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub average_rating: Option<String>,
    pub stock_quantity: Option<i64>,
    pub manage_stock: Option<bool>,
    pub images: Vec<RawImage>,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<RawCategoryRef>,
    pub attributes: Vec<RawAttribute>,
    pub tags: Vec<RawTag>,
    pub date_created: Option<String>,
    pub meta_data: Vec<RawMeta>,
    pub related_ids: Vec<u64>,
}

/// Upstream image: either a bare URL string or an object carrying `src`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawImage {
    Url(String),
    Object {
        #[serde(default)]
        src: Option<String>,
        #[serde(default)]
        alt: Option<String>,
    },
}

impl RawImage {
    /// The image URL, when one exists.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url.as_str()),
            Self::Object { src, .. } => src.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCategoryRef {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAttribute {
    pub name: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTag {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub slug: Option<String>,
}

/// Free-form product metadata entry (ACF-style custom fields).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMeta {
    pub key: Option<String>,
    pub value: Value,
}

/// A node of the upstream category tree. `parent == 0` marks a root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryNode {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub parent: u64,
}

/// Accept a string, a number, or null where the upstream is inconsistent.
fn loose_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Query parameters for `GET /products`.
#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    pub category_ids: Vec<u64>,
    pub tag: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub on_sale: Option<bool>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub orderby: Option<String>,
    pub order: Option<String>,
    pub search: Option<String>,
    pub fields: Option<String>,
}

impl ProductQuery {
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        if !self.category_ids.is_empty() {
            let joined = self
                .category_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("category".to_string(), joined));
        }
        if let Some(ref tag) = self.tag {
            pairs.push(("tag".to_string(), tag.clone()));
        }
        if let Some(ref status) = self.status {
            pairs.push(("status".to_string(), status.clone()));
        }
        if let Some(page) = self.page {
            pairs.push(("page".to_string(), page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            pairs.push(("per_page".to_string(), per_page.to_string()));
        }
        if self.on_sale == Some(true) {
            pairs.push(("on_sale".to_string(), "true".to_string()));
        }
        if let Some(min) = self.min_price {
            pairs.push(("min_price".to_string(), min.to_string()));
        }
        if let Some(max) = self.max_price {
            pairs.push(("max_price".to_string(), max.to_string()));
        }
        if let Some(ref orderby) = self.orderby {
            pairs.push(("orderby".to_string(), orderby.clone()));
        }
        if let Some(ref order) = self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        if let Some(ref search) = self.search {
            pairs.push(("search".to_string(), search.clone()));
        }
        let fields = self
            .fields
            .clone()
            .unwrap_or_else(|| DEFAULT_PRODUCT_FIELDS.to_string());
        pairs.push(("_fields".to_string(), fields));

        pairs
    }
}

/// Query parameters for `GET /products/categories`.
#[derive(Debug, Clone, Default)]
pub struct CategoryQuery {
    pub slug: Option<String>,
    pub parent: Option<u64>,
    pub per_page: Option<u32>,
}

impl CategoryQuery {
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(ref slug) = self.slug {
            pairs.push(("slug".to_string(), slug.clone()));
        }
        if let Some(parent) = self.parent {
            pairs.push(("parent".to_string(), parent.to_string()));
        }
        if let Some(per_page) = self.per_page {
            pairs.push(("per_page".to_string(), per_page.to_string()));
        }
        pairs
    }
}

/// One page of upstream products plus the pagination totals delivered via
/// response headers.
#[derive(Debug, Clone, Default)]
pub struct ProductPage {
    /// Raw product records. Kept as JSON values so one malformed record
    /// degrades at the normalization boundary instead of failing the page.
    pub products: Vec<Value>,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upstream Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Client for the upstream commerce REST API.
///
/// Holds a single [`reqwest::Client`] so connections are pooled and reused
/// across calls. Authentication uses consumer key/secret query parameters.
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Create a client from configuration.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self { http, config })
    }

    /// Fetch one page of products.
    #[instrument(skip(self, query), fields(page = query.page, per_page = query.per_page))]
    pub async fn fetch_products(&self, query: &ProductQuery) -> Result<ProductPage> {
        let response = self.get_with_retry("products", &query.to_pairs()).await?;

        let total = header_u64(&response, "x-wp-total");
        let total_pages = header_u64(&response, "x-wp-totalpages");

        let bytes = response.bytes().await?;
        let products: Vec<Value> = serde_json::from_slice(&bytes)?;

        debug!(
            count = products.len(),
            total,
            total_pages,
            "Fetched product page from upstream"
        );

        Ok(ProductPage {
            products,
            total,
            total_pages,
        })
    }

    /// Fetch category nodes. Records that fail to decode are skipped.
    #[instrument(skip(self, query), fields(slug = ?query.slug, parent = ?query.parent))]
    pub async fn fetch_categories(&self, query: &CategoryQuery) -> Result<Vec<CategoryNode>> {
        let response = self
            .get_with_retry("products/categories", &query.to_pairs())
            .await?;

        let bytes = response.bytes().await?;
        let values: Vec<Value> = serde_json::from_slice(&bytes)?;

        let categories = values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<CategoryNode>(value) {
                Ok(node) if node.id > 0 => Some(node),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable category record");
                    None
                }
            })
            .collect();

        Ok(categories)
    }

    /// Perform a GET with the retry loop described in the module docs.
    async fn get_with_retry(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            counter!("vitrine_upstream_requests_total", "endpoint" => path.to_string())
                .increment(1);

            match self.get_once(&url, query).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt);
                    counter!("vitrine_upstream_retries_total", "endpoint" => path.to_string())
                        .increment(1);
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    counter!("vitrine_upstream_failures_total", "endpoint" => path.to_string())
                        .increment(1);
                    warn!(url = %url, attempt, error = %e, "Upstream request failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// A single attempt: send, then classify the status.
    async fn get_once(&self, url: &str, query: &[(String, String)]) -> Result<reqwest::Response> {
        let mut request = self.http.get(url).query(query);
        if !self.config.consumer_key.is_empty() {
            request = request.query(&[
                ("consumer_key", self.config.consumer_key.as_str()),
                ("consumer_secret", self.config.consumer_secret.as_str()),
            ]);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(VitrineError::with_internal(
                crate::error::ErrorCode::UpstreamUnavailable,
                "The upstream commerce API returned a server error",
                format!("{} from {}", status, url),
            ));
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(VitrineError::upstream_rejected(status.as_u16(), body));
        }

        Ok(response)
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
