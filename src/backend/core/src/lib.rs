//! # Vitrine Core
//!
//! The catalog retrieval and caching orchestration layer of a headless
//! storefront. Product data is not stored locally; it is fetched on demand
//! from an upstream commerce API and cached aggressively in between.
//!
//! ## Architecture
//!
//! - **FetchCoordinator**: per-key single-flight, stale-while-revalidate, and
//!   write-through caching for product list requests
//! - **CategoryTreeResolver**: depth-bounded recursive category resolution
//!   with cycle protection and a wall-clock budget
//! - **UpstreamClient**: pooled HTTP client with exponential-backoff retry
//! - **ProductNormalizer**: pure coercion of the loose upstream schema into a
//!   stable internal shape with a deterministic image-fallback chain
//! - **CacheStore**: two-tier cache (process-local + Redis) with namespace
//!   versioning for bulk invalidation
//! - **API**: axum router with ETag/conditional responses and cache
//!   diagnostic headers

pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod observability;
pub mod upstream;

pub use error::{ErrorCode, ErrorContext, Result, VitrineError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::cache::{
        CacheBackend, CacheControl, CacheStore, CacheTier, ETagGenerator, FilterParams,
        InMemoryBackend, NormalizedFilter, RedisBackend, TieredBackend,
    };
    pub use crate::catalog::{
        normalize, normalize_all, CacheSource, CacheStatus, CatalogPage, CategoryResolution,
        CategoryResolver, FetchCoordinator, ImageStatus, NormalizedProduct, NormalizerSettings,
        ProductBatch, ResolutionOutcome,
    };
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, Result, VitrineError};
    pub use crate::upstream::{
        CategoryNode, CategoryQuery, ProductPage, ProductQuery, RawProduct, UpstreamClient,
    };
}
