//! Struct-of-arrays vector storage.
//!
//! Vectors live in one contiguous `f32` buffer of `capacity * dim` entries;
//! per-row attributes (tombstone flag, version counter, timestamps, expiry,
//! metadata bag) live in parallel arrays indexed by row. Row indices are
//! assigned densely at append time and never change; deletion only sets the
//! tombstone flag. Compaction rewrites the store and is only driven by the
//! database during a coordinated index rebuild.

use std::collections::BTreeMap;

use crate::error::{CResult, Error};
use crate::storage::{now_micros, Status};
use crate::value::{Metadata, Value};

/// The SoA columnar store. One instance backs one database.
pub struct VectorStore {
    dim: usize,

    /// Packed row-major vector data, `rows * dim` floats long.
    data: Vec<f32>,

    /// Tombstone flags, one per row.
    deleted: Vec<bool>,

    /// Per-row version counters. 0 at insert, strictly increasing on every
    /// mutation targeting the row.
    versions: Vec<u64>,

    created_at: Vec<u64>,
    updated_at: Vec<u64>,

    /// Absolute expiry in microseconds, 0 meaning no expiry.
    expires_at: Vec<u64>,

    metadata: Vec<Metadata>,

    tombstones: usize,
}

impl VectorStore {
    /// Creates an empty store for vectors of the given dimension.
    pub fn new(dim: usize) -> CResult<Self> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be at least 1".into()));
        }
        Ok(Self {
            dim,
            data: Vec::new(),
            deleted: Vec::new(),
            versions: Vec::new(),
            created_at: Vec::new(),
            updated_at: Vec::new(),
            expires_at: Vec::new(),
            metadata: Vec::new(),
            tombstones: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total rows, tombstoned included. Row indices are dense in `[0, len)`.
    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.len() - self.tombstones
    }

    pub fn deleted_count(&self) -> usize {
        self.tombstones
    }

    fn check_dim(&self, vector: &[f32]) -> CResult<()> {
        if vector.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "vector dimension {} does not match store dimension {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(())
    }

    fn check_row(&self, row: u64) -> CResult<usize> {
        let idx = row as usize;
        if idx >= self.len() {
            return Err(Error::InvalidInput(format!("row {} out of range", row)));
        }
        Ok(idx)
    }

    /// A live (not tombstoned) row, or an error.
    fn check_live(&self, row: u64) -> CResult<usize> {
        let idx = self.check_row(row)?;
        if self.deleted[idx] {
            return Err(Error::NotFound(format!("row {} is deleted", row)));
        }
        Ok(idx)
    }

    /// Appends a vector, returning its assigned row index.
    pub fn append(&mut self, vector: &[f32]) -> CResult<u64> {
        self.check_dim(vector)?;
        let row = self.len() as u64;
        self.reserve_row();
        self.data.extend_from_slice(vector);
        self.deleted.push(false);
        self.versions.push(0);
        let now = now_micros();
        self.created_at.push(now);
        self.updated_at.push(now);
        self.expires_at.push(0);
        self.metadata.push(BTreeMap::new());
        Ok(row)
    }

    /// Appends a vector together with its initial metadata bag. The bag is
    /// part of the insert, so the row's version stays 0.
    pub fn append_with_metadata(&mut self, vector: &[f32], meta: Metadata) -> CResult<u64> {
        for key in meta.keys() {
            if key.is_empty() {
                return Err(Error::InvalidInput("metadata keys must be non-empty".into()));
            }
        }
        let row = self.append(vector)?;
        self.metadata[row as usize] = meta;
        Ok(row)
    }

    /// Grows the backing buffers by doubling when a row append would spill
    /// over the current capacity.
    fn reserve_row(&mut self) {
        if self.data.len() + self.dim > self.data.capacity() {
            let rows = (self.len() * 2).max(16);
            self.data.reserve(rows * self.dim - self.data.len());
        }
        if self.deleted.len() == self.deleted.capacity() {
            let rows = (self.len() * 2).max(16);
            self.deleted.reserve(rows - self.deleted.len());
        }
    }

    /// Returns a live row's vector.
    pub fn get(&self, row: u64) -> CResult<&[f32]> {
        let idx = self.check_live(row)?;
        Ok(&self.data[idx * self.dim..(idx + 1) * self.dim])
    }

    /// Returns a row's vector regardless of tombstone state. Index
    /// traversals need tombstoned vectors for graph connectivity.
    pub(crate) fn raw(&self, row: u64) -> &[f32] {
        let idx = row as usize;
        &self.data[idx * self.dim..(idx + 1) * self.dim]
    }

    /// Whether the row is tombstoned. Out-of-range rows count as deleted.
    pub fn is_deleted(&self, row: u64) -> bool {
        self.deleted.get(row as usize).copied().unwrap_or(true)
    }

    /// Tombstones a live row and bumps its version.
    pub fn delete(&mut self, row: u64) -> CResult<()> {
        let idx = self.check_live(row)?;
        self.deleted[idx] = true;
        self.tombstones += 1;
        self.touch(idx);
        Ok(())
    }

    /// Replaces a live row's vector in place.
    pub fn update(&mut self, row: u64, vector: &[f32]) -> CResult<()> {
        self.check_dim(vector)?;
        let idx = self.check_live(row)?;
        self.data[idx * self.dim..(idx + 1) * self.dim].copy_from_slice(vector);
        self.touch(idx);
        Ok(())
    }

    fn touch(&mut self, idx: usize) {
        self.versions[idx] += 1;
        self.updated_at[idx] = now_micros();
    }

    /// Replaces a live row's whole metadata bag.
    pub fn set_metadata(&mut self, row: u64, meta: Metadata) -> CResult<()> {
        let idx = self.check_live(row)?;
        for key in meta.keys() {
            if key.is_empty() {
                return Err(Error::InvalidInput("metadata keys must be non-empty".into()));
            }
        }
        self.metadata[idx] = meta;
        self.touch(idx);
        Ok(())
    }

    /// Sets a single metadata key on a live row.
    pub fn attach_metadata(&mut self, row: u64, key: &str, value: Value) -> CResult<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("metadata keys must be non-empty".into()));
        }
        let idx = self.check_live(row)?;
        self.metadata[idx].insert(key.to_string(), value);
        self.touch(idx);
        Ok(())
    }

    /// A live row's metadata bag.
    pub fn metadata(&self, row: u64) -> CResult<&Metadata> {
        let idx = self.check_live(row)?;
        Ok(&self.metadata[idx])
    }

    /// A row's metadata regardless of tombstone state.
    pub(crate) fn metadata_raw(&self, row: u64) -> &Metadata {
        &self.metadata[row as usize]
    }

    /// A row's version counter. Valid for tombstoned rows too, so CAS
    /// callers can observe the final version of a deleted row.
    pub fn version(&self, row: u64) -> CResult<u64> {
        let idx = self.check_row(row)?;
        Ok(self.versions[idx])
    }

    pub fn created_at(&self, row: u64) -> CResult<u64> {
        let idx = self.check_row(row)?;
        Ok(self.created_at[idx])
    }

    pub fn updated_at(&self, row: u64) -> CResult<u64> {
        let idx = self.check_row(row)?;
        Ok(self.updated_at[idx])
    }

    pub fn expires_at(&self, row: u64) -> CResult<u64> {
        let idx = self.check_row(row)?;
        Ok(self.expires_at[idx])
    }

    pub fn set_expires_at(&mut self, row: u64, expires_at: u64) -> CResult<()> {
        let idx = self.check_live(row)?;
        self.expires_at[idx] = expires_at;
        Ok(())
    }

    /// Iterates over live row indices in ascending order.
    pub fn live_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.deleted
            .iter()
            .enumerate()
            .filter(|(_, deleted)| !**deleted)
            .map(|(idx, _)| idx as u64)
    }

    /// Re-appends a row with explicit attributes. Used by snapshot load and
    /// WAL replay, which must reproduce versions and timestamps exactly.
    pub(crate) fn restore_row(
        &mut self,
        vector: &[f32],
        deleted: bool,
        version: u64,
        created_at: u64,
        updated_at: u64,
        metadata: Metadata,
    ) -> CResult<u64> {
        self.check_dim(vector)?;
        let row = self.len() as u64;
        self.data.extend_from_slice(vector);
        self.deleted.push(deleted);
        if deleted {
            self.tombstones += 1;
        }
        self.versions.push(version);
        self.created_at.push(created_at);
        self.updated_at.push(updated_at);
        self.expires_at.push(0);
        self.metadata.push(metadata);
        Ok(row)
    }

    /// Replay variants of the mutations: the record's timestamp becomes the
    /// row's `updated_at` instead of the clock, so replay is idempotent
    /// against a snapshot that already contains the mutation.
    pub(crate) fn replay_delete(&mut self, row: u64, timestamp: u64) -> CResult<()> {
        let idx = self.check_live(row)?;
        self.deleted[idx] = true;
        self.tombstones += 1;
        self.versions[idx] += 1;
        self.updated_at[idx] = timestamp;
        Ok(())
    }

    pub(crate) fn replay_update(&mut self, row: u64, vector: &[f32], timestamp: u64) -> CResult<()> {
        self.check_dim(vector)?;
        let idx = self.check_live(row)?;
        self.data[idx * self.dim..(idx + 1) * self.dim].copy_from_slice(vector);
        self.versions[idx] += 1;
        self.updated_at[idx] = timestamp;
        Ok(())
    }

    pub(crate) fn replay_set_metadata(
        &mut self,
        row: u64,
        meta: Metadata,
        timestamp: u64,
    ) -> CResult<()> {
        let idx = self.check_live(row)?;
        self.metadata[idx] = meta;
        self.versions[idx] += 1;
        self.updated_at[idx] = timestamp;
        Ok(())
    }

    pub fn status(&self) -> Status {
        Status {
            dimension: self.dim,
            rows: self.len(),
            live_rows: self.live_count(),
            deleted_rows: self.tombstones,
            vector_bytes: self.live_count() * self.dim * std::mem::size_of::<f32>(),
        }
    }

    /// Rewrites the store keeping only live rows and returns the old-to-new
    /// row mapping. The caller must rebuild every index over this store
    /// before serving queries again.
    pub fn compact(&mut self) -> Vec<Option<u64>> {
        let mut mapping = vec![None; self.len()];
        let mut next = 0usize;
        for old in 0..self.len() {
            if self.deleted[old] {
                continue;
            }
            if next != old {
                let (dst, src) = (next * self.dim, old * self.dim);
                self.data.copy_within(src..src + self.dim, dst);
                self.versions[next] = self.versions[old];
                self.created_at[next] = self.created_at[old];
                self.updated_at[next] = self.updated_at[old];
                self.expires_at[next] = self.expires_at[old];
                self.metadata.swap(next, old);
            }
            mapping[old] = Some(next as u64);
            next += 1;
        }
        self.data.truncate(next * self.dim);
        self.deleted.truncate(next);
        self.deleted.iter_mut().for_each(|d| *d = false);
        self.versions.truncate(next);
        self.created_at.truncate(next);
        self.updated_at.truncate(next);
        self.expires_at.truncate(next);
        self.metadata.truncate(next);
        let reclaimed = self.tombstones;
        self.tombstones = 0;
        log::info!("compacted store, reclaimed {} tombstoned rows", reclaimed);
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VectorStore {
        VectorStore::new(2).unwrap()
    }

    #[test]
    fn append_and_get() -> CResult<()> {
        let mut s = store();
        let r0 = s.append(&[1.0, 2.0])?;
        let r1 = s.append(&[3.0, 4.0])?;
        assert_eq!((r0, r1), (0, 1));
        assert_eq!(s.get(0)?, &[1.0, 2.0]);
        assert_eq!(s.get(1)?, &[3.0, 4.0]);
        assert_eq!(s.version(0)?, 0);
        Ok(())
    }

    #[test]
    fn dimension_mismatch() {
        let mut s = store();
        assert!(matches!(s.append(&[1.0]), Err(Error::InvalidInput(_))));
        assert!(matches!(VectorStore::new(0), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn delete_is_logical() -> CResult<()> {
        let mut s = store();
        s.append(&[1.0, 2.0])?;
        s.append(&[3.0, 4.0])?;
        s.delete(0)?;
        assert_eq!(s.len(), 2);
        assert_eq!(s.live_count(), 1);
        assert!(s.is_deleted(0));
        assert!(matches!(s.get(0), Err(Error::NotFound(_))));
        // Version still readable and bumped by the delete.
        assert_eq!(s.version(0)?, 1);
        // Double delete errors.
        assert!(matches!(s.delete(0), Err(Error::NotFound(_))));
        assert_eq!(s.live_indices().collect::<Vec<_>>(), vec![1]);
        Ok(())
    }

    #[test]
    fn versions_strictly_increase() -> CResult<()> {
        let mut s = store();
        s.append(&[0.0, 0.0])?;
        assert_eq!(s.version(0)?, 0);
        s.update(0, &[1.0, 1.0])?;
        assert_eq!(s.version(0)?, 1);
        s.attach_metadata(0, "k", Value::Integer(1))?;
        assert_eq!(s.version(0)?, 2);
        s.set_metadata(0, Metadata::new())?;
        assert_eq!(s.version(0)?, 3);
        s.delete(0)?;
        assert_eq!(s.version(0)?, 4);
        Ok(())
    }

    #[test]
    fn metadata_keys_non_empty() {
        let mut s = store();
        s.append(&[0.0, 0.0]).unwrap();
        assert!(s.attach_metadata(0, "", Value::Null).is_err());
    }

    #[test]
    fn out_of_range() {
        let s = store();
        assert!(matches!(s.get(3), Err(Error::InvalidInput(_))));
        assert!(s.is_deleted(3));
    }

    #[test]
    fn compact_remaps_rows() -> CResult<()> {
        let mut s = store();
        for i in 0..4 {
            s.append(&[i as f32, 0.0])?;
        }
        s.delete(0)?;
        s.delete(2)?;
        let mapping = s.compact();
        assert_eq!(mapping, vec![None, Some(0), None, Some(1)]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.live_count(), 2);
        assert_eq!(s.get(0)?, &[1.0, 0.0]);
        assert_eq!(s.get(1)?, &[3.0, 0.0]);
        Ok(())
    }

    #[test]
    fn status_counts() -> CResult<()> {
        let mut s = store();
        s.append(&[1.0, 2.0])?;
        s.append(&[3.0, 4.0])?;
        s.delete(1)?;
        let status = s.status();
        assert_eq!(status.rows, 2);
        assert_eq!(status.live_rows, 1);
        assert_eq!(status.deleted_rows, 1);
        assert_eq!(status.vector_bytes, 8);
        Ok(())
    }
}
