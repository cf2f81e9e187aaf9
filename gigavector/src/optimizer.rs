//! Heuristic query planning.
//!
//! The optimizer advises the database on how to run a search: whether an
//! exact scan beats the index, and what beam or probe width to use. It is
//! purely advisory, runs on the caller's thread, and never cancels anything.

use serde_derive::{Deserialize, Serialize};

use crate::index::IndexKind;

/// A plan for one search call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryPlan {
    /// Scan live rows exactly instead of going through the index.
    pub exact: bool,

    /// HNSW beam width for this query.
    pub ef_search: usize,

    /// IVFPQ probe count for this query.
    pub nprobe: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Below this many live rows an exact scan is cheaper than any index.
    pub exact_scan_threshold: usize,

    /// Exact scan also wins when k covers at least this fraction of the
    /// live rows.
    pub exact_coverage: f64,

    pub max_ef_search: usize,
    pub max_nprobe: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { exact_scan_threshold: 1000, exact_coverage: 0.5, max_ef_search: 512, max_nprobe: 64 }
    }
}

pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Plans a search of `k` over `live` rows. `base_ef` and `base_nprobe`
    /// come from the index configuration; a filtered query widens both,
    /// since filtering thins the candidate stream.
    pub fn plan(
        &self,
        kind: IndexKind,
        live: usize,
        k: usize,
        base_ef: usize,
        base_nprobe: usize,
        has_filter: bool,
    ) -> QueryPlan {
        let exact = match kind {
            IndexKind::Flat => true,
            _ => {
                live <= self.config.exact_scan_threshold
                    || (live > 0 && k as f64 / live as f64 >= self.config.exact_coverage)
            }
        };

        let widen = if has_filter { 2 } else { 1 };
        let ef_search = (base_ef.max(k) * widen).min(self.config.max_ef_search).max(1);
        let nprobe = (base_nprobe * widen).min(self.config.max_nprobe).max(1);
        QueryPlan { exact, ef_search, nprobe }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_collections_scan_exactly() {
        let opt = Optimizer::default();
        let plan = opt.plan(IndexKind::Hnsw, 100, 10, 50, 8, false);
        assert!(plan.exact);
    }

    #[test]
    fn large_collections_use_the_index() {
        let opt = Optimizer::default();
        let plan = opt.plan(IndexKind::Hnsw, 100_000, 10, 50, 8, false);
        assert!(!plan.exact);
        assert_eq!(plan.ef_search, 50);
    }

    #[test]
    fn k_covering_most_rows_goes_exact() {
        let opt = Optimizer::default();
        let plan = opt.plan(IndexKind::IvfPq, 10_000, 6_000, 50, 8, false);
        assert!(plan.exact);
    }

    #[test]
    fn filters_widen_the_beam() {
        let opt = Optimizer::default();
        let unfiltered = opt.plan(IndexKind::Hnsw, 100_000, 10, 50, 8, false);
        let filtered = opt.plan(IndexKind::Hnsw, 100_000, 10, 50, 8, true);
        assert!(filtered.ef_search > unfiltered.ef_search);
        assert!(filtered.nprobe > unfiltered.nprobe);
    }

    #[test]
    fn widths_are_clamped() {
        let opt = Optimizer::default();
        let plan = opt.plan(IndexKind::Hnsw, 100_000, 2_000, 50, 100, true);
        assert!(plan.ef_search <= 512);
        assert!(plan.nprobe <= 64);
    }

    #[test]
    fn flat_is_always_exact() {
        let opt = Optimizer::default();
        assert!(opt.plan(IndexKind::Flat, 1_000_000, 1, 50, 8, false).exact);
    }
}
