//! Fetch coordination: cache states, single-flight, stale-while-revalidate.
//!
//! For every cache key a request lands in one of four states:
//!
//! - **Fresh**: a cached batch younger than `fresh_ttl`; served directly.
//! - **Stale**: older than `fresh_ttl` but inside the stale-while-revalidate
//!   window; served immediately while a refresh runs on a background task.
//! - **Fetching**: a fetch for this key is already in flight; callers wait
//!   on a per-key broadcast channel under a hard timeout, then fall back to
//!   any stale payload.
//! - **Miss**: no usable entry; the caller becomes the fetcher.
//!
//! Within one process at most one fetch pipeline runs per key. Across
//! processes the distributed tier makes duplicate fetches rare but does not
//! prevent them; writes are last-writer-wins and the system stays correct
//! (merely less optimally cached) under that race.
//!
//! The coordinator owns the process-local entry map outright. It is
//! constructed at startup and injected; nothing else writes to the map.

use crate::cache::{CacheStore, CacheTier, FilterParams, NormalizedFilter, PRODUCTS_NAMESPACE};
use crate::catalog::categories::{CategoryResolver, ResolutionOutcome};
use crate::catalog::normalize::{self, NormalizedProduct, NormalizerSettings};
use crate::config::CatalogConfig;
use crate::error::{ErrorCode, Result, VitrineError};
use crate::upstream::{ProductQuery, UpstreamClient};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

/// Page size used when re-fetching a category for the manual tag filter.
const TAG_FALLBACK_PAGE_SIZE: u32 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Cached Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// One page of raw upstream products plus pagination totals. Raw records are
/// cached as-is; normalization runs on every serve so normalizer fixes apply
/// to already-cached data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductBatch {
    pub products: Vec<Value>,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
}

/// The envelope written through the cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedBatch {
    pub batch: ProductBatch,
    pub written_at: DateTime<Utc>,
}

/// Process-local cache entry. Kept after TTL expiry (overwritten on the next
/// successful fetch) so an upstream outage can still be bridged with the last
/// known payload.
#[derive(Debug, Clone)]
struct CatalogEntry {
    payload: Option<ProductBatch>,
    written_at: DateTime<Utc>,
    is_fetching: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Serve Result
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache disposition of a served response, for the diagnostic header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
        }
    }
}

/// Where the served payload came from, for the diagnostic header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Memory,
    Distributed,
    Upstream,
    Fallback,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Distributed => "distributed",
            Self::Upstream => "upstream",
            Self::Fallback => "fallback",
        }
    }
}

impl From<CacheTier> for CacheSource {
    fn from(tier: CacheTier) -> Self {
        match tier {
            CacheTier::Memory => Self::Memory,
            CacheTier::Distributed => Self::Distributed,
        }
    }
}

/// A served catalog page with everything the response envelope needs.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub products: Vec<NormalizedProduct>,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    pub written_at: DateTime<Utc>,
    pub is_stale: bool,
    pub status: CacheStatus,
    pub source: CacheSource,
    pub namespace_version: u64,
    pub filter: NormalizedFilter,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fetch Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Orchestrates cache lookups, single-flight upstream fetches, and
/// stale-while-revalidate serving for product list requests.
///
/// A cheap handle: every field is shared, so cloning one into a background
/// task costs a few reference-count bumps.
#[derive(Clone)]
pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    upstream: Arc<UpstreamClient>,
    resolver: Arc<CategoryResolver>,
    normalizer: Arc<NormalizerSettings>,
    config: CatalogConfig,

    /// Process-local entries; the ageless fallback tier.
    entries: Arc<DashMap<String, CatalogEntry>>,

    /// One broadcast channel per key with a fetch in flight. Registration in
    /// this map is what enforces single-flight.
    inflight: Arc<DashMap<String, broadcast::Sender<()>>>,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        upstream: Arc<UpstreamClient>,
        normalizer: NormalizerSettings,
        config: CatalogConfig,
    ) -> Self {
        let resolver = Arc::new(CategoryResolver::new(Arc::clone(&upstream), &config));
        Self {
            store,
            upstream,
            resolver,
            normalizer: Arc::new(normalizer),
            config,
            entries: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Serve a product list for the given filter, per the state machine in
    /// the module docs.
    #[instrument(skip(self, params))]
    pub async fn get_products(&self, params: &FilterParams) -> Result<CatalogPage> {
        let filter = params.normalized();
        let namespace_version = self.store.namespace_version(PRODUCTS_NAMESPACE).await;
        let key = filter.cache_key(namespace_version);
        let now = Utc::now();

        let cached = self.lookup(&key).await;

        // Fresh: served directly.
        if let Some((ref hit, source)) = cached {
            if age_of(now, hit.written_at) < self.config.fresh_ttl
                && !self.inflight.contains_key(&key)
            {
                counter!("vitrine_catalog_requests_total", "status" => "hit").increment(1);
                return Ok(self.page_from(hit.clone(), CacheStatus::Hit, source, false, namespace_version, filter));
            }
        }

        // Fetching: a refresh is already in flight for this key.
        if let Some(receiver) = self.subscribe(&key) {
            if let Some((hit, source)) = cached {
                let age = age_of(now, hit.written_at);
                if age < self.config.fresh_ttl + self.config.swr_window {
                    // Usable payload; no need to wait on the fetcher.
                    let is_stale = age >= self.config.fresh_ttl;
                    let status = if is_stale { CacheStatus::Stale } else { CacheStatus::Hit };
                    counter!("vitrine_catalog_requests_total", "status" => "stale").increment(1);
                    return Ok(self.page_from(hit, status, source, is_stale, namespace_version, filter));
                }
            }

            self.bounded_wait(receiver).await;

            if let Some((hit, source)) = self.lookup(&key).await {
                let is_stale = age_of(Utc::now(), hit.written_at) >= self.config.fresh_ttl;
                let status = if is_stale { CacheStatus::Stale } else { CacheStatus::Hit };
                return Ok(self.page_from(hit, status, source, is_stale, namespace_version, filter));
            }

            return self.degrade(&key, namespace_version, filter, in_flight_timeout());
        }

        // Stale: serve immediately, refresh out-of-band.
        if let Some((hit, source)) = cached {
            let age = age_of(now, hit.written_at);
            if age < self.config.fresh_ttl + self.config.swr_window {
                let is_stale = age >= self.config.fresh_ttl;
                if is_stale {
                    self.spawn_refresh(key.clone(), filter.clone());
                    counter!("vitrine_catalog_requests_total", "status" => "stale").increment(1);
                } else {
                    counter!("vitrine_catalog_requests_total", "status" => "hit").increment(1);
                }
                let status = if is_stale { CacheStatus::Stale } else { CacheStatus::Hit };
                return Ok(self.page_from(hit, status, source, is_stale, namespace_version, filter));
            }
        }

        // Miss (or entry beyond the stale window): this caller fetches.
        match self.try_lead(&key) {
            Some(sender) => {
                // Another leader may have completed between the lookup above
                // and winning the registration race.
                if let Some((hit, source)) = self.lookup(&key).await {
                    if age_of(Utc::now(), hit.written_at) < self.config.fresh_ttl {
                        self.inflight.remove(&key);
                        let _ = sender.send(());
                        counter!("vitrine_catalog_requests_total", "status" => "hit").increment(1);
                        return Ok(self.page_from(hit, CacheStatus::Hit, source, false, namespace_version, filter));
                    }
                }

                counter!("vitrine_catalog_requests_total", "status" => "miss").increment(1);
                match self.lead_fetch(&key, &filter, sender).await {
                    Ok(written) => Ok(self.page_from(
                        written,
                        CacheStatus::Miss,
                        CacheSource::Upstream,
                        false,
                        namespace_version,
                        filter,
                    )),
                    Err(e) => self.degrade(&key, namespace_version, filter, e),
                }
            }
            None => {
                // Lost the registration race; behave as a waiter.
                if let Some(receiver) = self.subscribe(&key) {
                    self.bounded_wait(receiver).await;
                }
                if let Some((hit, source)) = self.lookup(&key).await {
                    let is_stale = age_of(Utc::now(), hit.written_at) >= self.config.fresh_ttl;
                    let status = if is_stale { CacheStatus::Stale } else { CacheStatus::Hit };
                    return Ok(self.page_from(hit, status, source, is_stale, namespace_version, filter));
                }
                self.degrade(&key, namespace_version, filter, in_flight_timeout())
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Distributed-first lookup with the process-local entry as fallback.
    async fn lookup(&self, key: &str) -> Option<(CachedBatch, CacheSource)> {
        if let Some((cached, tier)) = self.store.get_json::<CachedBatch>(key).await {
            return Some((cached, CacheSource::from(tier)));
        }

        let entry = self.entries.get(key)?;
        let payload = entry.payload.clone()?;
        // Only reachable when both store tiers evicted; age checks upstream
        // of this call decide whether it is servable.
        Some((
            CachedBatch {
                batch: payload,
                written_at: entry.written_at,
            },
            CacheSource::Memory,
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Single-Flight Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Try to become the fetcher for a key. `None` means a fetch is already
    /// in flight.
    fn try_lead(&self, key: &str) -> Option<broadcast::Sender<()>> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(sender.clone());
                Some(sender)
            }
        }
    }

    /// Subscribe to the in-flight fetch for a key, if any.
    fn subscribe(&self, key: &str) -> Option<broadcast::Receiver<()>> {
        self.inflight.get(key).map(|sender| sender.subscribe())
    }

    /// Wait for an in-flight fetch under the hard cap. Both a completion
    /// signal and a closed channel end the wait early.
    async fn bounded_wait(&self, mut receiver: broadcast::Receiver<()>) {
        let _ = tokio::time::timeout(self.config.inflight_wait, receiver.recv()).await;
    }

    /// Run the fetch pipeline as the registered leader, write through both
    /// cache tiers, then wake every waiter.
    async fn lead_fetch(
        &self,
        key: &str,
        filter: &NormalizedFilter,
        sender: broadcast::Sender<()>,
    ) -> Result<CachedBatch> {
        self.mark_fetching(key, true);

        let result = self.fetch_pipeline(filter).await;

        let outcome = match result {
            Ok(batch) => {
                let written_at = Utc::now();
                let cached = CachedBatch {
                    batch: batch.clone(),
                    written_at,
                };

                let ttl = if batch.products.is_empty() {
                    // Empty results recover quickly.
                    self.config.empty_result_ttl
                } else {
                    self.config.fresh_ttl + self.config.swr_window
                };
                self.store.set_json(key, &cached, ttl).await;

                self.entries.insert(
                    key.to_string(),
                    CatalogEntry {
                        payload: Some(batch),
                        written_at,
                        is_fetching: false,
                    },
                );

                Ok(cached)
            }
            Err(e) => {
                self.mark_fetching(key, false);
                Err(e)
            }
        };

        self.inflight.remove(key);
        let _ = sender.send(());

        outcome
    }

    fn mark_fetching(&self, key: &str, fetching: bool) {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().is_fetching = fetching;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CatalogEntry {
                    payload: None,
                    written_at: Utc::now(),
                    is_fetching: fetching,
                });
            }
        }
    }

    /// Kick off a background refresh unless one is already running. The
    /// serving request does not wait on it.
    fn spawn_refresh(&self, key: String, filter: NormalizedFilter) {
        let Some(sender) = self.try_lead(&key) else {
            return;
        };

        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.lead_fetch(&key, &filter, sender).await {
                warn!(key = %key, error = %e, "Background catalog refresh failed");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fetch Pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// Category resolution, upstream query, and the manual tag fallback.
    async fn fetch_pipeline(&self, filter: &NormalizedFilter) -> Result<ProductBatch> {
        let mut category_ids = Vec::new();
        if let Some(ref category) = filter.category {
            let resolution = self.resolver.resolve(category).await;
            if let ResolutionOutcome::Partial(ref reason) = resolution.outcome {
                debug!(category = %category, reason = %reason, "Category resolution was partial");
            }
            category_ids = resolution.ids;
        }

        let query = ProductQuery {
            category_ids: category_ids.clone(),
            tag: filter.tag.clone(),
            status: Some("publish".to_string()),
            page: Some(filter.page),
            per_page: Some(filter.per_page),
            on_sale: filter.on_sale,
            min_price: filter.price_min,
            max_price: filter.price_max,
            orderby: filter.orderby.clone(),
            order: filter.order.clone(),
            search: filter.search.clone(),
            fields: None,
        };

        let page = self.upstream.fetch_products(&query).await?;

        // Some upstream deployments do not index tag filters; fall back to
        // filtering the category's products by hand before giving up.
        if page.products.is_empty() && filter.tag.is_some() && !category_ids.is_empty() {
            return Ok(self.tag_fallback(filter, &category_ids).await);
        }

        Ok(ProductBatch {
            products: page.products,
            total: page.total,
            total_pages: page.total_pages,
        })
    }

    /// Fetch the category's products without the tag filter and match tag
    /// slugs (and category membership) manually. Errors degrade to the empty
    /// batch the direct query already produced.
    async fn tag_fallback(&self, filter: &NormalizedFilter, category_ids: &[u64]) -> ProductBatch {
        let Some(ref tag) = filter.tag else {
            return ProductBatch::default();
        };

        let query = ProductQuery {
            category_ids: category_ids.to_vec(),
            status: Some("publish".to_string()),
            per_page: Some(TAG_FALLBACK_PAGE_SIZE),
            ..Default::default()
        };

        let candidates = match self.upstream.fetch_products(&query).await {
            Ok(page) => page.products,
            Err(e) => {
                warn!(tag = %tag, error = %e, "Manual tag fallback fetch failed");
                return ProductBatch::default();
            }
        };

        let scanned = candidates.len();
        let matched: Vec<Value> = candidates
            .into_iter()
            .filter(|product| {
                product_has_tag(product, tag)
                    && product_in_categories(product, category_ids, filter.category.as_deref())
            })
            .take(filter.per_page as usize)
            .collect();

        debug!(tag = %tag, scanned, matched = matched.len(), "Manual tag fallback");
        counter!("vitrine_tag_fallbacks_total").increment(1);

        ProductBatch {
            products: matched,
            total: None,
            total_pages: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serving
    // ─────────────────────────────────────────────────────────────────────────

    fn page_from(
        &self,
        cached: CachedBatch,
        status: CacheStatus,
        source: CacheSource,
        is_stale: bool,
        namespace_version: u64,
        filter: NormalizedFilter,
    ) -> CatalogPage {
        let products = normalize::normalize_all(&cached.batch.products, &self.normalizer);

        CatalogPage {
            products,
            total: cached.batch.total,
            total_pages: cached.batch.total_pages,
            written_at: cached.written_at,
            is_stale,
            status,
            source,
            namespace_version,
            filter,
        }
    }

    /// Last resort after a failed fetch or an expired wait: serve the
    /// process-local payload regardless of age, else surface the error.
    fn degrade(
        &self,
        key: &str,
        namespace_version: u64,
        filter: NormalizedFilter,
        error: VitrineError,
    ) -> Result<CatalogPage> {
        let fallback = self
            .entries
            .get(key)
            .and_then(|entry| {
                entry.payload.clone().map(|payload| CachedBatch {
                    batch: payload,
                    written_at: entry.written_at,
                })
            });

        match fallback {
            Some(cached) => {
                warn!(key, error = %error, "Serving last known payload as degraded response");
                counter!("vitrine_catalog_requests_total", "status" => "degraded").increment(1);
                Ok(self.page_from(
                    cached,
                    CacheStatus::Stale,
                    CacheSource::Fallback,
                    true,
                    namespace_version,
                    filter,
                ))
            }
            None => Err(error),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection (used by tests and the health endpoint)
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of keys with a fetch currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Number of process-local entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Wait until no fetch is in flight, bounded; for draining in tests.
    pub async fn quiesce(&self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.inflight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn in_flight_timeout() -> VitrineError {
    VitrineError::new(
        ErrorCode::UpstreamTimeout,
        "Timed out waiting for an in-flight catalog fetch",
    )
}

/// Age of a cached entry relative to `now`. A future timestamp (clock skew
/// across processes) counts as zero.
fn age_of(now: DateTime<Utc>, written_at: DateTime<Utc>) -> Duration {
    now.signed_duration_since(written_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw-record predicates for the manual tag fallback
// ─────────────────────────────────────────────────────────────────────────────

fn product_has_tag(product: &Value, tag: &str) -> bool {
    product
        .get("tags")
        .and_then(Value::as_array)
        .is_some_and(|tags| {
            tags.iter().any(|t| {
                t.get("slug")
                    .and_then(Value::as_str)
                    .is_some_and(|slug| slug.eq_ignore_ascii_case(tag))
            })
        })
}

fn product_in_categories(product: &Value, ids: &[u64], category_slug: Option<&str>) -> bool {
    product
        .get("categories")
        .and_then(Value::as_array)
        .is_some_and(|categories| {
            categories.iter().any(|c| {
                let id_match = c
                    .get("id")
                    .and_then(Value::as_u64)
                    .is_some_and(|id| ids.contains(&id));
                let slug_match = match category_slug {
                    Some(slug) => c
                        .get("slug")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.eq_ignore_ascii_case(slug)),
                    None => false,
                };
                id_match || slug_match
            })
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
