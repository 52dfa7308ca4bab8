//! Category resolution.
//!
//! Resolves a category slug (or numeric ID) to the requested category plus
//! every descendant, so a filter on a parent category also matches products
//! filed under its subcategories.
//!
//! Resolution is defensive by design:
//! - the recursion is depth-counted with a hard cap,
//! - a visited-ID set guards against cycles in the upstream data,
//! - a failure fetching one subtree's children is treated as "no further
//!   children" and never aborts sibling branches,
//! - an overall wall-clock budget stops expansion and returns whatever IDs
//!   were gathered so far.

use crate::config::CatalogConfig;
use crate::upstream::{CategoryQuery, UpstreamClient};
use metrics::counter;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const CHILDREN_PAGE_SIZE: u32 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Resolution Result
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether a resolution covered the whole subtree or was cut short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Every reachable branch within the depth cap was expanded.
    Complete,
    /// Expansion stopped early; the IDs gathered so far are still usable.
    Partial(String),
}

/// The result of resolving a category input.
///
/// `primary` is `None` when the slug did not resolve; the caller proceeds
/// without category filtering rather than failing the request.
#[derive(Debug, Clone)]
pub struct CategoryResolution {
    pub primary: Option<u64>,
    pub ids: Vec<u64>,
    pub outcome: ResolutionOutcome,
}

impl CategoryResolution {
    fn unresolved() -> Self {
        Self {
            primary: None,
            ids: Vec::new(),
            outcome: ResolutionOutcome::Complete,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves category slugs to ID sets via the upstream categories endpoint.
pub struct CategoryResolver {
    upstream: Arc<UpstreamClient>,
    max_depth: u32,
    budget: Duration,
}

impl CategoryResolver {
    pub fn new(upstream: Arc<UpstreamClient>, config: &CatalogConfig) -> Self {
        Self {
            upstream,
            max_depth: config.category_depth,
            budget: config.category_budget,
        }
    }

    /// Resolve a slug or numeric ID to the category plus all descendants.
    ///
    /// Never fails: upstream errors degrade to a partial or empty resolution.
    #[instrument(skip(self))]
    pub async fn resolve(&self, input: &str) -> CategoryResolution {
        let primary = match input.trim().parse::<u64>() {
            Ok(id) if id > 0 => Some(id),
            _ => self.lookup_slug(input).await,
        };

        let Some(primary) = primary else {
            // An unknown slug and a category with zero products are served
            // the same way further down the pipeline; the log line is the
            // only place the two are distinguishable.
            debug!(input, "Category slug did not resolve, proceeding unfiltered");
            counter!("vitrine_category_resolutions_total", "outcome" => "unresolved").increment(1);
            return CategoryResolution::unresolved();
        };

        let started = Instant::now();
        let mut visited: HashSet<u64> = HashSet::new();
        visited.insert(primary);
        let mut ids = vec![primary];
        let mut partial: Option<String> = None;

        self.expand(primary, 0, started, &mut visited, &mut ids, &mut partial)
            .await;

        let outcome = match partial {
            Some(reason) => {
                counter!("vitrine_category_resolutions_total", "outcome" => "partial")
                    .increment(1);
                ResolutionOutcome::Partial(reason)
            }
            None => {
                counter!("vitrine_category_resolutions_total", "outcome" => "complete")
                    .increment(1);
                ResolutionOutcome::Complete
            }
        };

        debug!(primary, descendants = ids.len() - 1, ?outcome, "Resolved category");

        CategoryResolution {
            primary: Some(primary),
            ids,
            outcome,
        }
    }

    /// Look up a category ID by slug. Errors degrade to `None`.
    async fn lookup_slug(&self, slug: &str) -> Option<u64> {
        let query = CategoryQuery {
            slug: Some(slug.trim().to_lowercase()),
            per_page: Some(1),
            ..Default::default()
        };

        match self.upstream.fetch_categories(&query).await {
            Ok(categories) => categories.first().map(|c| c.id),
            Err(e) => {
                warn!(slug, error = %e, "Category slug lookup failed");
                None
            }
        }
    }

    /// Recursively gather descendant IDs. Boxed because async recursion
    /// cannot be expressed with plain `async fn`.
    fn expand<'a>(
        &'a self,
        parent: u64,
        depth: u32,
        started: Instant,
        visited: &'a mut HashSet<u64>,
        ids: &'a mut Vec<u64>,
        partial: &'a mut Option<String>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if depth >= self.max_depth {
                return;
            }

            if started.elapsed() >= self.budget {
                if partial.is_none() {
                    *partial = Some(format!(
                        "wall-clock budget of {:?} exhausted at depth {}",
                        self.budget, depth
                    ));
                }
                return;
            }

            let query = CategoryQuery {
                parent: Some(parent),
                per_page: Some(CHILDREN_PAGE_SIZE),
                ..Default::default()
            };

            let children = match self.upstream.fetch_categories(&query).await {
                Ok(children) => children,
                Err(e) => {
                    // Treated as a leaf; siblings keep expanding.
                    warn!(parent, depth, error = %e, "Failed to fetch subcategories");
                    *partial = Some(format!("children of {} unavailable", parent));
                    return;
                }
            };

            for child in children {
                // The visited set breaks cycles in malformed upstream data.
                if !visited.insert(child.id) {
                    continue;
                }
                ids.push(child.id);
                self.expand(child.id, depth + 1, started, visited, ids, partial)
                    .await;
            }
        })
    }
}
