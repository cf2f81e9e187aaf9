//! Locality-sensitive duplicate probe.
//!
//! A cosine LSH over random hyperplane sign projections: each table hashes a
//! vector to a small bit signature, and vectors sharing a signature in any
//! table become duplicate candidates. Candidates are verified with the exact
//! metric before a duplicate is reported, so false bucket collisions cost
//! only a distance computation.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};

use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::storage::store::VectorStore;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LshConfig {
    /// Independent hash tables. More tables, higher recall.
    pub tables: usize,

    /// Hyperplanes (signature bits) per table. More bits, fewer collisions.
    pub bits: usize,

    /// Distance at or below which a candidate counts as a duplicate.
    pub epsilon: f32,

    pub seed: u64,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self { tables: 8, bits: 12, epsilon: 0.001, seed: 0x9e3779b9 }
    }
}

pub struct LshDedup {
    dim: usize,
    config: LshConfig,

    /// `tables * bits` hyperplane normals, each `dim` floats.
    hyperplanes: Vec<Vec<f32>>,

    /// Per table: signature to member rows.
    buckets: Vec<HashMap<u32, Vec<u64>>>,
}

impl LshDedup {
    pub fn new(dim: usize, config: LshConfig) -> CResult<Self> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be at least 1".into()));
        }
        if config.tables == 0 || config.bits == 0 || config.bits > 32 {
            return Err(Error::InvalidInput("lsh tables and bits must be in range".into()));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hyperplanes = (0..config.tables * config.bits)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect();
        let buckets = vec![HashMap::new(); config.tables];
        Ok(Self { dim, config, hyperplanes, buckets })
    }

    pub fn epsilon(&self) -> f32 {
        self.config.epsilon
    }

    fn signature(&self, table: usize, vector: &[f32]) -> u32 {
        let mut sig = 0u32;
        for bit in 0..self.config.bits {
            let plane = &self.hyperplanes[table * self.config.bits + bit];
            let dot: f32 = plane.iter().zip(vector.iter()).map(|(p, v)| p * v).sum();
            if dot >= 0.0 {
                sig |= 1 << bit;
            }
        }
        sig
    }

    fn check_dim(&self, vector: &[f32]) -> CResult<()> {
        if vector.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "vector dimension {} does not match probe dimension {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(())
    }

    pub fn insert(&mut self, row: u64, vector: &[f32]) -> CResult<()> {
        self.check_dim(vector)?;
        for table in 0..self.config.tables {
            let sig = self.signature(table, vector);
            self.buckets[table].entry(sig).or_default().push(row);
        }
        Ok(())
    }

    pub fn remove(&mut self, row: u64, vector: &[f32]) -> CResult<()> {
        self.check_dim(vector)?;
        for table in 0..self.config.tables {
            let sig = self.signature(table, vector);
            if let Some(bucket) = self.buckets[table].get_mut(&sig) {
                bucket.retain(|&r| r != row);
                if bucket.is_empty() {
                    self.buckets[table].remove(&sig);
                }
            }
        }
        Ok(())
    }

    /// Probes the buckets for a live row within `epsilon` of the vector,
    /// verifying candidates exactly. The smallest-distance duplicate wins.
    pub fn find_duplicate(&self, store: &VectorStore, vector: &[f32]) -> CResult<Option<u64>> {
        self.check_dim(vector)?;
        let mut best: Option<(f32, u64)> = None;
        for table in 0..self.config.tables {
            let sig = self.signature(table, vector);
            let bucket = match self.buckets[table].get(&sig) {
                Some(bucket) => bucket,
                None => continue,
            };
            for &row in bucket {
                if store.is_deleted(row) {
                    continue;
                }
                let d = Distance::Euclidean.compute(vector, store.raw(row));
                if d <= self.config.epsilon {
                    match best {
                        Some((bd, br)) if (bd, br) <= (d, row) => {}
                        _ => best = Some((d, row)),
                    }
                }
            }
        }
        Ok(best.map(|(_, row)| row))
    }

    pub fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        for table in &mut self.buckets {
            table.clear();
        }
        for row in store.live_indices() {
            let vector = store.get(row)?.to_vec();
            self.insert(row, &vector)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LshConfig {
        LshConfig { tables: 8, bits: 12, epsilon: 0.001, seed: 11 }
    }

    #[test]
    fn detects_near_duplicate() -> CResult<()> {
        let mut store = VectorStore::new(8)?;
        let mut lsh = LshDedup::new(8, config())?;
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..100 {
            let v: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            let row = store.append(&v)?;
            lsh.insert(row, &v)?;
        }
        let mut probe = store.get(42)?.to_vec();
        probe[0] += 1e-5;
        assert_eq!(lsh.find_duplicate(&store, &probe)?, Some(42));
        Ok(())
    }

    #[test]
    fn distinct_vector_is_not_duplicate() -> CResult<()> {
        let mut store = VectorStore::new(8)?;
        let mut lsh = LshDedup::new(8, config())?;
        let row = store.append(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])?;
        lsh.insert(row, store.get(row)?.to_vec().as_slice())?;
        let far = [0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(lsh.find_duplicate(&store, &far)?, None);
        Ok(())
    }

    #[test]
    fn deleted_rows_ignored() -> CResult<()> {
        let mut store = VectorStore::new(4)?;
        let mut lsh = LshDedup::new(4, config())?;
        let v = [0.5, 0.5, 0.5, 0.5];
        let row = store.append(&v)?;
        lsh.insert(row, &v)?;
        store.delete(row)?;
        assert_eq!(lsh.find_duplicate(&store, &v)?, None);
        Ok(())
    }

    #[test]
    fn remove_clears_buckets() -> CResult<()> {
        let mut store = VectorStore::new(4)?;
        let mut lsh = LshDedup::new(4, config())?;
        let v = [0.1, 0.2, 0.3, 0.4];
        let row = store.append(&v)?;
        lsh.insert(row, &v)?;
        lsh.remove(row, &v)?;
        assert_eq!(lsh.find_duplicate(&store, &v)?, None);
        Ok(())
    }
}
