//! Exact linear-scan index, the correctness baseline for the family.
//!
//! Keeps only a membership set; every search scans the member rows and
//! accumulates the k smallest distances in a bounded heap. Deletion removes
//! the member outright, there is no tombstone structure to filter through.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::index::{Neighbor, ResultHeap, RowFilter, VectorIndex};
use crate::storage::store::VectorStore;

pub struct FlatIndex {
    dim: usize,
    metric: Distance,
    rows: BTreeSet<u64>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: Distance) -> CResult<Self> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be at least 1".into()));
        }
        Ok(Self { dim, metric, rows: BTreeSet::new() })
    }

    pub fn metric(&self) -> Distance {
        self.metric
    }

    fn check_query(&self, query: &[f32]) -> CResult<()> {
        if query.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Save is a header only; membership is recovered from storage on load.
    pub fn load(r: &mut dyn Read, dim: usize, store: &VectorStore) -> CResult<Self> {
        let saved_dim = r.read_u32::<LittleEndian>()? as usize;
        if saved_dim != dim {
            return Err(Error::Corrupted(format!(
                "flat index dimension {} does not match database dimension {}",
                saved_dim, dim
            )));
        }
        let metric = Distance::from_u8(r.read_u8()?)?;
        let mut index = Self::new(dim, metric)?;
        index.rows = store.live_indices().collect();
        Ok(index)
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        if store.dim() != self.dim {
            return Err(Error::InvalidInput("store dimension mismatch".into()));
        }
        self.rows.insert(row);
        Ok(())
    }

    fn remove(&mut self, row: u64) -> CResult<()> {
        if !self.rows.remove(&row) {
            return Err(Error::NotFound(format!("row {} not in index", row)));
        }
        Ok(())
    }

    fn update(&mut self, _store: &VectorStore, row: u64) -> CResult<()> {
        // No structure to re-link; the scan reads fresh data from the store.
        if !self.rows.contains(&row) {
            return Err(Error::NotFound(format!("row {} not in index", row)));
        }
        Ok(())
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_query(query)?;
        let mut heap = ResultHeap::new(k);
        for &row in &self.rows {
            if store.is_deleted(row) {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(row) {
                    continue;
                }
            }
            heap.push(row, metric.compute(query, store.raw(row)));
        }
        Ok(heap.into_sorted())
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_query(query)?;
        let mut out = Vec::new();
        for &row in &self.rows {
            if store.is_deleted(row) {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(row) {
                    continue;
                }
            }
            let distance = metric.compute(query, store.raw(row));
            if distance <= radius {
                out.push(Neighbor { row, distance });
            }
        }
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        Ok(out)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        self.rows = store.live_indices().collect();
        Ok(())
    }

    fn save(&self, w: &mut dyn Write) -> CResult<()> {
        w.write_u32::<LittleEndian>(self.dim as u32)?;
        w.write_u8(self.metric as u8)?;
        Ok(())
    }
}
