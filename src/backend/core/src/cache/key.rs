//! Filter parameters and deterministic cache key derivation.
//!
//! Two logically identical requests must always produce the same cache key,
//! and any differing parameter must produce a different one. Keys embed a
//! namespace version counter so bumping the version invalidates every prior
//! key without enumerating or deleting them.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Namespace for product-list cache entries.
pub const PRODUCTS_NAMESPACE: &str = "products";

/// Namespace for category-list cache entries.
pub const CATEGORIES_NAMESPACE: &str = "categories";

const PAGE_MAX: u32 = 1000;
const PER_PAGE_MAX: u32 = 100;
const PRICE_MAX: i64 = 1_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Filter Parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Inbound product filter parameters, as deserialized from the query string.
///
/// Call [`FilterParams::normalized`] before deriving a cache key or querying
/// the upstream; raw values may carry stray whitespace, empty strings, or
/// out-of-range numbers.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterParams {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub on_sale: Option<bool>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub orderby: Option<String>,
    pub order: Option<String>,
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            category: None,
            tag: None,
            on_sale: None,
            price_min: None,
            price_max: None,
            orderby: None,
            order: None,
            search: None,
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    24
}

impl FilterParams {
    /// Produce the normalized, immutable form used for key derivation and
    /// upstream queries: empty strings dropped, slugs lowercased, numeric
    /// ranges clamped.
    pub fn normalized(&self) -> NormalizedFilter {
        NormalizedFilter {
            category: clean_slug(self.category.as_deref()),
            tag: clean_slug(self.tag.as_deref()),
            on_sale: self.on_sale.filter(|v| *v),
            price_min: self.price_min.map(|v| v.clamp(0, PRICE_MAX)),
            price_max: self.price_max.map(|v| v.clamp(0, PRICE_MAX)),
            orderby: clean_slug(self.orderby.as_deref()),
            order: clean_slug(self.order.as_deref()),
            search: clean_text(self.search.as_deref()),
            page: self.page.clamp(1, PAGE_MAX),
            per_page: self.per_page.clamp(1, PER_PAGE_MAX),
        }
    }
}

fn clean_slug(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Normalized Filter
// ═══════════════════════════════════════════════════════════════════════════════

/// Normalized filter parameters. Immutable for the rest of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedFilter {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub on_sale: Option<bool>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub orderby: Option<String>,
    pub order: Option<String>,
    pub search: Option<String>,
    pub page: u32,
    pub per_page: u32,
}

impl NormalizedFilter {
    /// Build the cache key for this filter under the given namespace version.
    ///
    /// Fields are emitted in a fixed order and absent fields are skipped, so
    /// the key is a pure function of the normalized parameters plus the
    /// version counter.
    pub fn cache_key(&self, namespace_version: u64) -> String {
        let mut key = format!("{}:v{}:", PRODUCTS_NAMESPACE, namespace_version);

        let mut push = |name: &str, value: &str| {
            let _ = write!(key, "{}={}|", name, value);
        };

        if let Some(ref v) = self.category {
            push("category", v);
        }
        if self.on_sale == Some(true) {
            push("on_sale", "true");
        }
        if let Some(ref v) = self.order {
            push("order", v);
        }
        if let Some(ref v) = self.orderby {
            push("orderby", v);
        }
        push("page", &self.page.to_string());
        push("per_page", &self.per_page.to_string());
        if let Some(v) = self.price_max {
            push("price_max", &v.to_string());
        }
        if let Some(v) = self.price_min {
            push("price_min", &v.to_string());
        }
        if let Some(ref v) = self.search {
            push("search", v);
        }
        if let Some(ref v) = self.tag {
            push("tag", v);
        }

        key
    }

    /// Key prefix shared by every product-list entry, for bulk invalidation.
    pub fn products_prefix() -> String {
        format!("{}:", PRODUCTS_NAMESPACE)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> FilterParams {
        FilterParams {
            category: Some("Shoes".to_string()),
            tag: Some("summer".to_string()),
            on_sale: Some(true),
            price_min: Some(10),
            price_max: Some(200),
            orderby: Some("price".to_string()),
            order: Some("ASC".to_string()),
            search: None,
            page: 2,
            per_page: 24,
        }
    }

    #[test]
    fn test_key_determinism() {
        let a = base_params().normalized().cache_key(1);
        let b = base_params().normalized().cache_key(1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_case_insensitive_slugs() {
        let mut other = base_params();
        other.category = Some("  SHOES ".to_string());
        assert_eq!(
            base_params().normalized().cache_key(1),
            other.normalized().cache_key(1)
        );
    }

    #[test]
    fn test_key_differs_per_param() {
        let base = base_params().normalized().cache_key(1);

        let mut changed = base_params();
        changed.page = 3;
        assert_ne!(base, changed.normalized().cache_key(1));

        let mut changed = base_params();
        changed.tag = Some("winter".to_string());
        assert_ne!(base, changed.normalized().cache_key(1));

        let mut changed = base_params();
        changed.on_sale = None;
        assert_ne!(base, changed.normalized().cache_key(1));
    }

    #[test]
    fn test_namespace_version_changes_key() {
        let v1 = base_params().normalized().cache_key(1);
        let v2 = base_params().normalized().cache_key(2);
        assert_ne!(v1, v2);
        assert!(v1.starts_with("products:v1:"));
        assert!(v2.starts_with("products:v2:"));
    }

    #[test]
    fn test_empty_fields_dropped() {
        let params = FilterParams {
            category: Some("   ".to_string()),
            search: Some("".to_string()),
            ..Default::default()
        };
        let normalized = params.normalized();
        assert_eq!(normalized.category, None);
        assert_eq!(normalized.search, None);
        assert_eq!(
            normalized.cache_key(1),
            FilterParams::default().normalized().cache_key(1)
        );
    }

    #[test]
    fn test_ranges_clamped() {
        let params = FilterParams {
            page: 0,
            per_page: 500,
            price_min: Some(-5),
            price_max: Some(99_999_999),
            ..Default::default()
        };
        let normalized = params.normalized();
        assert_eq!(normalized.page, 1);
        assert_eq!(normalized.per_page, 100);
        assert_eq!(normalized.price_min, Some(0));
        assert_eq!(normalized.price_max, Some(1_000_000));
    }

    #[test]
    fn test_on_sale_false_equivalent_to_absent() {
        let explicit = FilterParams {
            on_sale: Some(false),
            ..Default::default()
        };
        let absent = FilterParams::default();
        assert_eq!(
            explicit.normalized().cache_key(1),
            absent.normalized().cache_key(1)
        );
    }
}
