//! The index family.
//!
//! All indexes implement [`VectorIndex`] and are dispatched through the
//! [`Index`] sum type, one variant per implementation. An index owns no
//! vectors: it references storage by row index and reads vector data through
//! the store passed into each operation. Deleted rows never appear in any
//! result.

pub mod flat;
pub mod hnsw;
pub mod lsh;
pub mod pq;

use std::collections::BinaryHeap;
use std::io::{Read, Write};

use serde_derive::{Deserialize, Serialize};

use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::storage::store::VectorStore;

pub use flat::FlatIndex;
pub use hnsw::{HnswConfig, HnswIndex};
pub use lsh::{LshConfig, LshDedup};
pub use pq::{IvfPqConfig, IvfPqIndex, PqConfig, PqIndex};

/// The index implementations a database can be opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexKind {
    Flat = 0,
    Hnsw = 1,
    IvfPq = 2,
    Pq = 3,
    /// Reserved; constructing a sparse index is not supported.
    Sparse = 4,
}

impl IndexKind {
    pub fn from_u8(tag: u8) -> CResult<Self> {
        Ok(match tag {
            0 => IndexKind::Flat,
            1 => IndexKind::Hnsw,
            2 => IndexKind::IvfPq,
            3 => IndexKind::Pq,
            4 => IndexKind::Sparse,
            other => return Err(Error::Corrupted(format!("unknown index kind {}", other))),
        })
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Flat => "flat",
            IndexKind::Hnsw => "hnsw",
            IndexKind::IvfPq => "ivfpq",
            IndexKind::Pq => "pq",
            IndexKind::Sparse => "sparse",
        };
        write!(f, "{}", name)
    }
}

/// A search hit: a live row and its distance from the query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub row: u64,
    pub distance: f32,
}

/// A predicate applied to candidate rows before they are admitted to the
/// result heap.
pub type RowFilter<'a> = dyn Fn(u64) -> bool + 'a;

/// Shared operations across all index implementations.
pub trait VectorIndex {
    /// Adds a stored row to the index. The vector is read from the store.
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()>;

    /// Removes a row, by tombstone where the structure supports it.
    fn remove(&mut self, row: u64) -> CResult<()>;

    /// Re-links a row after its vector changed in the store.
    fn update(&mut self, store: &VectorStore, row: u64) -> CResult<()>;

    /// Returns up to `k` nearest live rows, ascending by distance, ties
    /// broken by smaller row index.
    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>>;

    /// Returns all live rows within `radius`, ascending by distance.
    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>>;

    /// The number of live rows in the index.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides training vectors. Only the quantized indexes implement this;
    /// the others accept and ignore it.
    fn train(&mut self, _vectors: &[Vec<f32>]) -> CResult<()> {
        Ok(())
    }

    fn is_trained(&self) -> bool {
        true
    }

    /// Reconstructs the index from the store's live rows, dropping
    /// tombstones. Called after a store compaction.
    fn rebuild(&mut self, store: &VectorStore) -> CResult<()>;

    /// Writes the index blob. Layout is index-specific and versioned by the
    /// snapshot header.
    fn save(&self, w: &mut dyn Write) -> CResult<()>;
}

/// Sum type over the index implementations.
pub enum Index {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
    IvfPq(IvfPqIndex),
    Pq(PqIndex),
}

/// Per-kind construction parameters, carried by the database config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    pub hnsw: HnswConfig,
    pub pq: PqConfig,
    pub ivfpq: IvfPqConfig,
}

impl Index {
    /// Builds an empty index of the requested kind.
    pub fn open(
        kind: IndexKind,
        dim: usize,
        metric: Distance,
        config: &IndexConfig,
    ) -> CResult<Self> {
        Ok(match kind {
            IndexKind::Flat => Index::Flat(FlatIndex::new(dim, metric)?),
            IndexKind::Hnsw => Index::Hnsw(HnswIndex::new(dim, metric, config.hnsw.clone())?),
            IndexKind::IvfPq => Index::IvfPq(IvfPqIndex::new(dim, metric, config.ivfpq.clone())?),
            IndexKind::Pq => Index::Pq(PqIndex::new(dim, metric, config.pq.clone())?),
            IndexKind::Sparse => {
                return Err(Error::InvalidInput("sparse indexes are not supported".into()))
            }
        })
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Index::Flat(_) => IndexKind::Flat,
            Index::Hnsw(_) => IndexKind::Hnsw,
            Index::IvfPq(_) => IndexKind::IvfPq,
            Index::Pq(_) => IndexKind::Pq,
        }
    }

    /// Reads an index blob written by [`VectorIndex::save`]. The store is
    /// needed by kinds whose save is header-only and whose membership is
    /// recovered from live rows.
    pub fn load(
        kind: IndexKind,
        r: &mut dyn Read,
        dim: usize,
        store: &VectorStore,
    ) -> CResult<Self> {
        Ok(match kind {
            IndexKind::Flat => Index::Flat(FlatIndex::load(r, dim, store)?),
            IndexKind::Hnsw => Index::Hnsw(HnswIndex::load(r, dim)?),
            IndexKind::IvfPq => Index::IvfPq(IvfPqIndex::load(r, dim)?),
            IndexKind::Pq => Index::Pq(PqIndex::load(r, dim)?),
            IndexKind::Sparse => {
                return Err(Error::Corrupted("sparse index blob in snapshot".into()))
            }
        })
    }
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Index::Flat($inner) => $body,
            Index::Hnsw($inner) => $body,
            Index::IvfPq($inner) => $body,
            Index::Pq($inner) => $body,
        }
    };
}

impl VectorIndex for Index {
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        dispatch!(self, inner => inner.insert(store, row))
    }

    fn remove(&mut self, row: u64) -> CResult<()> {
        dispatch!(self, inner => inner.remove(row))
    }

    fn update(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        dispatch!(self, inner => inner.update(store, row))
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        dispatch!(self, inner => inner.search(store, query, k, metric, filter))
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        dispatch!(self, inner => inner.range_search(store, query, radius, metric, filter))
    }

    fn len(&self) -> usize {
        dispatch!(self, inner => inner.len())
    }

    fn train(&mut self, vectors: &[Vec<f32>]) -> CResult<()> {
        dispatch!(self, inner => inner.train(vectors))
    }

    fn is_trained(&self) -> bool {
        dispatch!(self, inner => inner.is_trained())
    }

    fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        dispatch!(self, inner => inner.rebuild(store))
    }

    fn save(&self, w: &mut dyn Write) -> CResult<()> {
        dispatch!(self, inner => inner.save(w))
    }
}

/// A bounded max-heap keeping the k best (smallest) candidates seen so far.
/// On equal distance the smaller row index wins.
pub(crate) struct ResultHeap {
    k: usize,
    heap: BinaryHeap<HeapEntry>,
}

#[derive(PartialEq)]
struct HeapEntry {
    distance: f32,
    row: u64,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.row.cmp(&other.row))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl ResultHeap {
    pub fn new(k: usize) -> Self {
        Self { k, heap: BinaryHeap::with_capacity(k + 1) }
    }

    pub fn push(&mut self, row: u64, distance: f32) {
        if self.k == 0 {
            return;
        }
        self.heap.push(HeapEntry { distance, row });
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    /// Drains into an ascending-by-distance result list.
    pub fn into_sorted(self) -> Vec<Neighbor> {
        let mut out: Vec<Neighbor> = self
            .heap
            .into_iter()
            .map(|e| Neighbor { row: e.row, distance: e.distance })
            .collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generates common tests for any VectorIndex implementation. The setup
    /// closure receives the seed vectors (for training) and returns an
    /// empty, ready index with its store; the load closure reopens a saved
    /// blob against the store.
    macro_rules! test_index {
        ($setup:expr, $load:expr) => {
            fn seed_vectors() -> Vec<Vec<f32>> {
                vec![
                    vec![10.0, 0.0, 0.0, 0.0],
                    vec![0.0, 10.0, 0.0, 0.0],
                    vec![0.0, 0.0, 10.0, 0.0],
                    vec![0.0, 0.0, 0.0, 10.0],
                    vec![10.0, 10.0, 0.0, 0.0],
                    vec![0.0, 10.0, 10.0, 0.0],
                    vec![0.0, 0.0, 10.0, 10.0],
                    vec![10.0, 0.0, 0.0, 10.0],
                ]
            }

            fn seeded() -> crate::error::CResult<(
                crate::storage::store::VectorStore,
                impl crate::index::VectorIndex,
            )> {
                let vectors = seed_vectors();
                let (mut store, mut index) = ($setup)(&vectors)?;
                for v in &vectors {
                    let row = store.append(v)?;
                    index.insert(&store, row)?;
                }
                Ok((store, index))
            }

            #[test]
            /// Every seeded vector finds itself first.
            fn index_finds_inserted_rows() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                assert_eq!(index.len(), 8);
                for (i, v) in seed_vectors().iter().enumerate() {
                    let hits =
                        index.search(&store, v, 1, crate::distance::Distance::Euclidean, None)?;
                    assert_eq!(hits[0].row, i as u64, "query {}", i);
                    assert!(hits[0].distance < 0.5, "query {}: {}", i, hits[0].distance);
                }
                Ok(())
            }

            #[test]
            /// Removed rows never surface again, through any code path.
            fn index_removed_rows_stay_hidden() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (mut store, mut index) = seeded()?;
                let victim = seed_vectors()[3].clone();
                store.delete(3)?;
                index.remove(3)?;
                assert_eq!(index.len(), 7);

                let hits =
                    index.search(&store, &victim, 8, crate::distance::Distance::Euclidean, None)?;
                assert!(hits.iter().all(|n| n.row != 3));
                let near = index.range_search(
                    &store,
                    &victim,
                    1.0,
                    crate::distance::Distance::Euclidean,
                    None,
                )?;
                assert!(near.iter().all(|n| n.row != 3));
                Ok(())
            }

            #[test]
            /// Asking for more neighbors than live rows returns them all.
            fn index_k_exceeds_live_count() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                let hits = index.search(
                    &store,
                    &seed_vectors()[0],
                    100,
                    crate::distance::Distance::Euclidean,
                    None,
                )?;
                assert_eq!(hits.len(), 8);
                // Ascending by distance throughout.
                assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                Ok(())
            }

            #[test]
            fn index_zero_k_is_empty() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                assert!(index
                    .search(
                        &store,
                        &seed_vectors()[0],
                        0,
                        crate::distance::Distance::Euclidean,
                        None
                    )?
                    .is_empty());
                Ok(())
            }

            #[test]
            fn index_rejects_bad_dimension() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                assert!(matches!(
                    index.search(&store, &[1.0], 1, crate::distance::Distance::Euclidean, None),
                    Err(crate::error::Error::InvalidInput(_))
                ));
                Ok(())
            }

            #[test]
            /// An updated row is found at its new position.
            fn index_update_moves_row() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (mut store, mut index) = seeded()?;
                let target = seed_vectors()[7].clone();
                store.update(0, &target)?;
                index.update(&store, 0)?;
                let hits =
                    index.search(&store, &target, 2, crate::distance::Distance::Euclidean, None)?;
                assert!(hits.iter().any(|n| n.row == 0), "row 0 missing from {:?}", hits);
                Ok(())
            }

            #[test]
            /// The filter gates admission to the result heap.
            fn index_filter_gates_admission() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                let only_even = |row: u64| row % 2 == 0;
                let hits = index.search(
                    &store,
                    &seed_vectors()[1],
                    8,
                    crate::distance::Distance::Euclidean,
                    Some(&only_even),
                )?;
                assert!(!hits.is_empty());
                assert!(hits.iter().all(|n| n.row % 2 == 0));
                Ok(())
            }

            #[test]
            fn index_range_search_bounds_radius() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                let hits = index.range_search(
                    &store,
                    &seed_vectors()[0],
                    1.0,
                    crate::distance::Distance::Euclidean,
                    None,
                )?;
                assert_eq!(hits.iter().map(|n| n.row).collect::<Vec<_>>(), vec![0]);
                Ok(())
            }

            #[test]
            /// Save and reload preserves membership and answers.
            fn index_save_load_round_trip() -> crate::error::CResult<()> {
                use crate::index::VectorIndex;
                let (store, index) = seeded()?;
                let mut blob = Vec::new();
                index.save(&mut blob)?;
                let loaded = ($load)(&blob, &store)?;
                assert_eq!(loaded.len(), index.len());
                let hits = loaded.search(
                    &store,
                    &seed_vectors()[2],
                    1,
                    crate::distance::Distance::Euclidean,
                    None,
                )?;
                assert_eq!(hits[0].row, 2);
                Ok(())
            }
        };
    }

    pub(super) use test_index; // export for use in the index submodules

    #[test]
    fn heap_keeps_k_best() {
        let mut heap = ResultHeap::new(2);
        heap.push(0, 3.0);
        heap.push(1, 1.0);
        heap.push(2, 2.0);
        let out = heap.into_sorted();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].row, 1);
        assert_eq!(out[1].row, 2);
    }

    #[test]
    fn heap_ties_prefer_smaller_row() {
        let mut heap = ResultHeap::new(1);
        heap.push(9, 1.0);
        heap.push(3, 1.0);
        heap.push(7, 1.0);
        let out = heap.into_sorted();
        assert_eq!(out[0].row, 3);
    }

    #[test]
    fn zero_k() {
        let mut heap = ResultHeap::new(0);
        heap.push(1, 1.0);
        assert!(heap.into_sorted().is_empty());
    }

    #[test]
    fn sparse_kind_rejected() {
        let config = IndexConfig::default();
        assert!(Index::open(IndexKind::Sparse, 4, Distance::Euclidean, &config).is_err());
    }
}
