//! HTTP response caching primitives.
//!
//! This module provides:
//! - ETag generation and conditional-request matching (If-None-Match)
//! - Cache-Control header construction with stale-while-revalidate support
//!
//! Both are stateless and derived purely from the serialized response body;
//! an ETag must be recomputed whenever the payload changes, including when a
//! stale payload is served (a stale body still has a legitimate current ETag).

use axum::http::HeaderValue;
use sha2::{Digest, Sha256};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// ETag Generator
// ═══════════════════════════════════════════════════════════════════════════════

/// ETag generation utilities.
pub struct ETagGenerator;

impl ETagGenerator {
    /// Generate a strong ETag from content.
    pub fn strong(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let hash = hasher.finalize();
        format!("\"{}\"", hex::encode(&hash[..16]))
    }

    /// Generate a weak ETag from content.
    pub fn weak(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let hash = hasher.finalize();
        format!("W/\"{}\"", hex::encode(&hash[..8]))
    }

    /// Check if two ETags match (weak comparison).
    pub fn matches(etag1: &str, etag2: &str) -> bool {
        let e1 = etag1.trim_start_matches("W/");
        let e2 = etag2.trim_start_matches("W/");
        e1 == e2
    }

    /// Check if an ETag matches any candidate in an If-None-Match header.
    pub fn matches_any(etag: &str, if_none_match: &str) -> bool {
        if if_none_match.trim() == "*" {
            return true;
        }

        for candidate in if_none_match.split(',') {
            if Self::matches(etag, candidate.trim()) {
                return true;
            }
        }

        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Control Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for Cache-Control headers.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    directives: Vec<String>,
}

impl CacheControl {
    /// Create a new Cache-Control builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache-Control for catalog responses: browsers and shared caches may
    /// hold the body for the fresh TTL and serve it stale while revalidating.
    pub fn catalog(fresh: Duration, stale_while_revalidate: Duration) -> Self {
        Self::new()
            .public()
            .max_age(fresh)
            .s_maxage(fresh)
            .stale_while_revalidate(stale_while_revalidate)
    }

    /// Cache-Control for responses that must not be cached.
    pub fn no_cache() -> Self {
        let mut cc = Self::new();
        cc.directives.push("no-cache".to_string());
        cc.directives.push("no-store".to_string());
        cc.directives.push("must-revalidate".to_string());
        cc
    }

    /// Mark as public (cacheable by CDNs).
    pub fn public(mut self) -> Self {
        self.directives.push("public".to_string());
        self
    }

    /// Set max-age.
    pub fn max_age(mut self, duration: Duration) -> Self {
        self.directives.push(format!("max-age={}", duration.as_secs()));
        self
    }

    /// Set s-maxage (shared cache max-age).
    pub fn s_maxage(mut self, duration: Duration) -> Self {
        self.directives
            .push(format!("s-maxage={}", duration.as_secs()));
        self
    }

    /// Add stale-while-revalidate.
    pub fn stale_while_revalidate(mut self, duration: Duration) -> Self {
        self.directives
            .push(format!("stale-while-revalidate={}", duration.as_secs()));
        self
    }

    /// Build the Cache-Control header value.
    pub fn build(&self) -> String {
        self.directives.join(", ")
    }

    /// Convert to HeaderValue.
    pub fn to_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.build())
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_deterministic() {
        let content = b"catalog body";
        let etag1 = ETagGenerator::weak(content);
        let etag2 = ETagGenerator::weak(content);
        let etag3 = ETagGenerator::weak(b"different body");

        assert_eq!(etag1, etag2);
        assert_ne!(etag1, etag3);
        assert!(etag1.starts_with("W/\""));
        assert!(etag1.ends_with('"'));
    }

    #[test]
    fn test_strong_etag_format() {
        let etag = ETagGenerator::strong(b"content");
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with('"'));
        assert!(!etag.starts_with("W/"));
    }

    #[test]
    fn test_etag_matching() {
        assert!(ETagGenerator::matches("\"abc\"", "\"abc\""));
        assert!(ETagGenerator::matches("W/\"abc\"", "\"abc\""));
        assert!(ETagGenerator::matches("\"abc\"", "W/\"abc\""));
        assert!(!ETagGenerator::matches("\"abc\"", "\"xyz\""));
    }

    #[test]
    fn test_etag_matches_any() {
        assert!(ETagGenerator::matches_any("\"abc\"", "\"abc\""));
        assert!(ETagGenerator::matches_any(
            "\"abc\"",
            "\"xyz\", \"abc\", \"def\""
        ));
        assert!(ETagGenerator::matches_any("\"abc\"", "*"));
        assert!(!ETagGenerator::matches_any("\"abc\"", "\"xyz\", \"def\""));
    }

    #[test]
    fn test_cache_control_catalog() {
        let cc = CacheControl::catalog(Duration::from_secs(600), Duration::from_secs(1200));
        let header = cc.build();
        assert!(header.contains("public"));
        assert!(header.contains("max-age=600"));
        assert!(header.contains("s-maxage=600"));
        assert!(header.contains("stale-while-revalidate=1200"));
    }

    #[test]
    fn test_cache_control_no_cache() {
        let header = CacheControl::no_cache().build();
        assert!(header.contains("no-cache"));
        assert!(header.contains("no-store"));
    }
}
