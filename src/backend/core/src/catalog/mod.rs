//! Catalog retrieval and caching orchestration.
//!
//! The pipeline between an inbound filter request and the upstream commerce
//! API:
//!
//! ```text
//! FilterParams ──▶ FetchCoordinator ──▶ CategoryResolver ──▶ UpstreamClient
//!                        │                                        │
//!                        ▼                                        ▼
//!                   CacheStore  ◀──── write-through ───── ProductNormalizer
//! ```
//!
//! - [`coordinator`]: cache states, single-flight, stale-while-revalidate
//! - [`categories`]: depth-bounded recursive category resolution
//! - [`normalize`]: coercion of raw upstream records into [`NormalizedProduct`]

pub mod categories;
pub mod coordinator;
pub mod normalize;

pub use categories::{CategoryResolution, CategoryResolver, ResolutionOutcome};
pub use coordinator::{
    CacheSource, CacheStatus, CachedBatch, CatalogPage, FetchCoordinator, ProductBatch,
};
pub use normalize::{
    normalize, normalize_all, ImageStatus, NormalizedProduct, NormalizerSettings,
};
