//! The database façade.
//!
//! Composes the SoA store, the chosen index, the payload index, the WAL,
//! the duplicate probe, TTL tracking, and the CDC stream behind one handle.
//! A single readers-writer lock guards the core: searches run in parallel
//! under the read lock, mutations are exclusive, and a write flows
//! WAL -> store -> index -> payload -> CDC, with subscriber callbacks firing
//! only after the core lock is released.
//!
//! Opening with a path loads the snapshot if one exists, then replays the
//! WAL; [`Database::save`] writes a fresh snapshot atomically and resets
//! the log.

mod open;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, RwLockReadGuard, RwLockWriteGuard};

use serde_derive::{Deserialize, Serialize};

use crate::cdc::{CdcCursor, CdcStatus, CdcStream, ChangeEvent, ChangeKind};
use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::filter::{self, Expr};
use crate::index::{Index, IndexKind, Neighbor, ResultHeap, VectorIndex};
use crate::storage::snapshot::write_snapshot;
use crate::storage::wal::{Wal, WalRecordKind};
use crate::storage::{now_micros, Status};
use crate::ttl::TtlStatus;
use crate::value::{Metadata, Value};

pub use open::DatabaseConfig;
pub(crate) use open::{Core, Shared};

/// Aggregate statistics across all components.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbStats {
    pub storage: Status,
    pub index_kind: IndexKind,
    pub indexed_rows: usize,
    pub metric: Distance,
    pub wal_bytes: Option<u64>,
    pub cdc: Option<CdcStatus>,
    pub ttl: TtlStatus,
}

/// An embeddable vector database handle. Cheap to clone; all clones share
/// the same engine, and the engine shuts down when the last clone is
/// dropped or [`Database::close`] is called.
pub struct Database {
    pub(crate) shared: Arc<Shared>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Database { shared: self.shared.clone() }
    }
}

impl Database {
    /// Opens a database persisted at `path` with default configuration.
    pub fn open(path: impl Into<PathBuf>, dimension: usize, index: IndexKind) -> CResult<Self> {
        Self::open_with_config(Some(path.into()), DatabaseConfig::new(dimension, index))
    }

    /// Opens a purely in-memory database.
    pub fn open_in_memory(dimension: usize, index: IndexKind) -> CResult<Self> {
        Self::open_with_config(None, DatabaseConfig::new(dimension, index))
    }

    pub fn open_with_config(path: Option<PathBuf>, config: DatabaseConfig) -> CResult<Self> {
        open::open(path, config)
    }

    /// Appends a vector, returning its row index.
    pub fn add_vector(&self, vector: &[f32]) -> CResult<u64> {
        self.shared.add_vector(vector, None)
    }

    /// Appends a vector with its initial metadata bag.
    pub fn add_vector_with_metadata(&self, vector: &[f32], meta: Metadata) -> CResult<u64> {
        self.shared.add_vector(vector, Some(meta))
    }

    /// Reads a live row's vector. Lazily-expired rows read as gone.
    pub fn get_vector(&self, row: u64) -> CResult<Vec<f32>> {
        self.shared.check_open()?;
        let core = self.shared.read_core();
        self.shared.check_not_expired(row)?;
        Ok(core.store.get(row)?.to_vec())
    }

    pub fn get_metadata(&self, row: u64) -> CResult<Metadata> {
        self.shared.check_open()?;
        let core = self.shared.read_core();
        self.shared.check_not_expired(row)?;
        Ok(core.store.metadata(row)?.clone())
    }

    pub fn get_version(&self, row: u64) -> CResult<u64> {
        self.shared.check_open()?;
        self.shared.read_core().store.version(row)
    }

    /// K-nearest search with the given metric.
    pub fn search(&self, query: &[f32], k: usize, metric: Distance) -> CResult<Vec<Neighbor>> {
        self.shared.search(query, k, metric, None)
    }

    /// K-nearest search restricted to rows matching a filter expression,
    /// e.g. `color == "red" AND rank > 3`.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: &str,
    ) -> CResult<Vec<Neighbor>> {
        let expr = filter::parse(filter)?;
        self.shared.search(query, k, metric, Some(&expr))
    }

    /// All live rows within `radius` of the query.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        metric: Distance,
    ) -> CResult<Vec<Neighbor>> {
        self.shared.range_search(query, radius, metric, None)
    }

    pub fn range_search_filtered(
        &self,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: &str,
    ) -> CResult<Vec<Neighbor>> {
        let expr = filter::parse(filter)?;
        self.shared.range_search(query, radius, metric, Some(&expr))
    }

    /// Tombstones a row.
    pub fn delete(&self, row: u64) -> CResult<()> {
        self.shared.check_open()?;
        let old = {
            let mut core = self.shared.write_core();
            self.shared.delete_row_locked(&mut core, row)?
        };
        self.shared.publish(ChangeKind::Delete, row, Some(&old), None);
        Ok(())
    }

    /// Deletes every row matching a filter expression, atomically with
    /// respect to concurrent writers. Returns the number of deleted rows.
    pub fn delete_by_filter(&self, filter: &str) -> CResult<usize> {
        self.shared.check_open()?;
        let expr = filter::parse(filter)?;
        let deleted = {
            let mut core = self.shared.write_core();
            let matching: Vec<u64> = match core.payload.candidates(&expr) {
                Some(rows) => rows
                    .into_iter()
                    .filter(|&row| {
                        !core.store.is_deleted(row) && expr.matches(core.store.metadata_raw(row))
                    })
                    .collect(),
                None => core
                    .store
                    .live_indices()
                    .filter(|&row| expr.matches(core.store.metadata_raw(row)))
                    .collect(),
            };
            let mut deleted = Vec::with_capacity(matching.len());
            for row in matching {
                let old = self.shared.delete_row_locked(&mut core, row)?;
                deleted.push((row, old));
            }
            deleted
        };
        for (row, old) in &deleted {
            self.shared.publish(ChangeKind::Delete, *row, Some(old), None);
        }
        Ok(deleted.len())
    }

    /// Replaces a row's vector.
    pub fn update_vector(&self, row: u64, vector: &[f32]) -> CResult<()> {
        self.shared.check_open()?;
        {
            let mut core = self.shared.write_core();
            self.shared.update_vector_locked(&mut core, row, vector)?;
        }
        self.shared.publish(ChangeKind::UpdateVector, row, Some(vector), None);
        Ok(())
    }

    /// Replaces a row's whole metadata bag.
    pub fn update_metadata(&self, row: u64, meta: Metadata) -> CResult<()> {
        self.shared.check_open()?;
        {
            let mut core = self.shared.write_core();
            self.shared.update_metadata_locked(&mut core, row, meta.clone())?;
        }
        self.shared.publish(ChangeKind::UpdateMetadata, row, None, Some(&meta));
        Ok(())
    }

    /// Sets a single metadata key on a row.
    pub fn attach_metadata(&self, row: u64, key: &str, value: Value) -> CResult<()> {
        self.shared.check_open()?;
        let meta = {
            let mut core = self.shared.write_core();
            let mut meta = core.store.metadata(row)?.clone();
            meta.insert(key.to_string(), value);
            self.shared.update_metadata_locked(&mut core, row, meta.clone())?;
            meta
        };
        self.shared.publish(ChangeKind::UpdateMetadata, row, None, Some(&meta));
        Ok(())
    }

    /// Sets a row's TTL in seconds from now; 0 clears any expiry.
    pub fn set_ttl(&self, row: u64, ttl_seconds: u64) -> CResult<()> {
        self.shared.check_open()?;
        let mut core = self.shared.write_core();
        let now = now_micros();
        let expires_at =
            if ttl_seconds == 0 { 0 } else { now + ttl_seconds.saturating_mul(1_000_000) };
        core.store.set_expires_at(row, expires_at)?;
        self.shared.ttl.set_ttl(row, ttl_seconds, now)
    }

    /// Trains a quantized index with the given vectors. A no-op for index
    /// kinds that do not train.
    pub fn train_index(&self, vectors: &[Vec<f32>]) -> CResult<()> {
        self.shared.check_open()?;
        self.shared.write_core().index.train(vectors)
    }

    /// Probes for a live row within the dedup epsilon of the vector.
    pub fn find_duplicate(&self, vector: &[f32]) -> CResult<Option<u64>> {
        self.shared.check_open()?;
        let core = self.shared.read_core();
        core.dedup.find_duplicate(&core.store, vector)
    }

    /// Declares a metadata field for payload indexing and backfills it from
    /// existing rows.
    pub fn register_payload_field(&self, name: &str) -> CResult<()> {
        self.shared.check_open()?;
        let mut core = self.shared.write_core();
        let core = &mut *core;
        core.payload.add_field(name);
        for row in core.store.live_indices() {
            if let Some(value) = core.store.metadata_raw(row).get(name) {
                core.payload.insert(row, name, value);
            }
        }
        Ok(())
    }

    /// Writes a snapshot to the open path and resets the WAL.
    pub fn save(&self) -> CResult<()> {
        self.shared.check_open()?;
        let path = self
            .shared
            .path
            .clone()
            .ok_or_else(|| Error::InvalidInput("in-memory database has no snapshot path".into()))?;
        let mut core = self.shared.write_core();
        write_snapshot(&path, &core.store, &core.index)?;
        if let Some(wal) = core.wal.as_mut() {
            wal.reset()?;
            wal.append(WalRecordKind::Checkpoint, 0, &[])?;
        }
        Ok(())
    }

    /// Attaches (or replaces) the WAL file. Subsequent writes are logged.
    pub fn set_wal(&self, path: impl Into<PathBuf>) -> CResult<()> {
        self.shared.check_open()?;
        let wal = Wal::new(path.into())?;
        self.shared.write_core().wal = Some(wal);
        Ok(())
    }

    pub fn disable_wal(&self) -> CResult<()> {
        self.shared.check_open()?;
        self.shared.write_core().wal = None;
        Ok(())
    }

    /// Rewrites the store without tombstones and rebuilds every index over
    /// it. Row indices are remapped; the old-to-new mapping is returned.
    /// Requires the write lock for the whole rebuild, so no traversal can
    /// observe stale indices.
    pub fn compact(&self) -> CResult<Vec<Option<u64>>> {
        self.shared.check_open()?;
        let mut core = self.shared.write_core();
        let core = &mut *core;
        let mapping = core.store.compact();
        core.index.rebuild(&core.store)?;
        core.payload.rebuild(&core.store);
        core.dedup.rebuild(&core.store)?;
        self.shared.ttl.remap(&mapping);
        // The log's row indices are stale now; the snapshot becomes the
        // recovery point.
        if let Some(path) = &self.shared.path {
            write_snapshot(path, &core.store, &core.index)?;
        }
        if let Some(wal) = core.wal.as_mut() {
            wal.reset()?;
            wal.append(WalRecordKind::Checkpoint, 0, &[])?;
        }
        Ok(mapping)
    }

    /// Subscribes a callback to CDC events matching the kind mask.
    pub fn subscribe<F>(&self, mask: u32, callback: F) -> CResult<u64>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.cdc()?.subscribe(mask, callback)
    }

    pub fn unsubscribe(&self, id: u64) -> CResult<()> {
        self.cdc()?.unsubscribe(id)
    }

    /// Polls up to `max` CDC events from the cursor onward.
    pub fn poll(&self, cursor: &mut CdcCursor, max: usize) -> CResult<Vec<ChangeEvent>> {
        Ok(self.cdc()?.poll(cursor, max))
    }

    pub fn cdc_pending(&self, cursor: &CdcCursor) -> CResult<u64> {
        Ok(self.cdc()?.pending(cursor))
    }

    fn cdc(&self) -> CResult<&CdcStream> {
        self.shared
            .cdc
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("change capture is not enabled".into()))
    }

    pub fn stats(&self) -> CResult<DbStats> {
        self.shared.check_open()?;
        let core = self.shared.read_core();
        Ok(DbStats {
            storage: core.store.status(),
            index_kind: core.index.kind(),
            indexed_rows: core.index.len(),
            metric: self.shared.config.metric,
            wal_bytes: core.wal.as_ref().map(|w| w.size()).transpose()?,
            cdc: self.shared.cdc.as_ref().map(|c| c.status()),
            ttl: self.shared.ttl.status(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.shared.config.dimension
    }

    /// Flushes the WAL, joins the TTL cleaner, and marks the handle closed.
    /// Further operations error. Idempotent.
    pub fn close(&self) -> CResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop_cleaner();
        let mut core = self.shared.write_core();
        if let Some(wal) = core.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }
}

/// Best-effort close when the last handle goes away.
impl Drop for Database {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) == 1 {
            if let Err(error) = self.close() {
                log::error!("failed to close database: {}", error);
            }
        }
    }
}

impl Shared {
    pub(crate) fn check_open(&self) -> CResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("database is closed".into()));
        }
        Ok(())
    }

    pub(crate) fn read_core(&self) -> RwLockReadGuard<'_, Core> {
        self.core.read().expect("core lock poisoned")
    }

    pub(crate) fn write_core(&self) -> RwLockWriteGuard<'_, Core> {
        self.core.write().expect("core lock poisoned")
    }

    fn check_not_expired(&self, row: u64) -> CResult<()> {
        if self.config.ttl.lazy_expiration && self.ttl.is_expired(row, now_micros()) {
            return Err(Error::NotFound(format!("row {} is expired", row)));
        }
        Ok(())
    }

    pub(crate) fn publish(
        &self,
        kind: ChangeKind,
        row: u64,
        vector: Option<&[f32]>,
        meta: Option<&Metadata>,
    ) {
        if let Some(cdc) = &self.cdc {
            cdc.publish(kind, row, vector, meta);
        }
    }

    pub(crate) fn add_vector(&self, vector: &[f32], meta: Option<Metadata>) -> CResult<u64> {
        self.check_open()?;
        let row = {
            let mut guard = self.write_core();
            let core = &mut *guard;
            if vector.len() != core.store.dim() {
                return Err(Error::InvalidInput(format!(
                    "vector dimension {} does not match database dimension {}",
                    vector.len(),
                    core.store.dim()
                )));
            }
            if !core.index.is_trained() {
                return Err(Error::Untrained);
            }
            if let Some(m) = &meta {
                if m.keys().any(|key| key.is_empty()) {
                    return Err(Error::InvalidInput("metadata keys must be non-empty".into()));
                }
            }
            let next_row = core.store.len() as u64;
            if let Some(wal) = core.wal.as_mut() {
                let (kind, payload) = match &meta {
                    Some(meta) => (
                        WalRecordKind::InsertVectorWithMeta,
                        open::encode_vector_meta_payload(vector, meta)?,
                    ),
                    None => (WalRecordKind::InsertVector, open::encode_vector_payload(vector)),
                };
                wal.append(kind, next_row, &payload)?;
            }
            let row = match &meta {
                Some(m) => core.store.append_with_metadata(vector, m.clone())?,
                None => core.store.append(vector)?,
            };
            core.index.insert(&core.store, row)?;
            if let Some(m) = &meta {
                core.payload.insert_row(row, m);
            }
            core.dedup.insert(row, vector)?;
            if self.config.ttl.default_ttl_seconds > 0 {
                let now = now_micros();
                self.ttl.set_ttl(row, self.config.ttl.default_ttl_seconds, now)?;
                core.store.set_expires_at(
                    row,
                    now + self.config.ttl.default_ttl_seconds.saturating_mul(1_000_000),
                )?;
            }
            row
        };
        self.publish(ChangeKind::Insert, row, Some(vector), meta.as_ref());
        Ok(row)
    }

    /// Tombstones a row with the write lock already held; returns the old
    /// vector for the caller's CDC event.
    pub(crate) fn delete_row_locked(&self, guard: &mut Core, row: u64) -> CResult<Vec<f32>> {
        let old = guard.store.get(row)?.to_vec();
        if let Some(wal) = guard.wal.as_mut() {
            wal.append(WalRecordKind::Delete, row, &[])?;
        }
        guard.store.delete(row)?;
        guard.index.remove(row)?;
        guard.payload.remove_row(row);
        guard.dedup.remove(row, &old)?;
        self.ttl.remove(row);
        // Tombstoned graph nodes still route traffic; past the threshold a
        // rebuild from live rows reclaims them.
        if let Index::Hnsw(hnsw) = &guard.index {
            if hnsw.tombstone_fraction() > self.config.index_config.hnsw.rebuild_threshold {
                guard.index.rebuild(&guard.store)?;
            }
        }
        Ok(old)
    }

    pub(crate) fn update_vector_locked(
        &self,
        guard: &mut Core,
        row: u64,
        vector: &[f32],
    ) -> CResult<()> {
        let old = guard.store.get(row)?.to_vec();
        if vector.len() != guard.store.dim() {
            return Err(Error::InvalidInput(format!(
                "vector dimension {} does not match database dimension {}",
                vector.len(),
                guard.store.dim()
            )));
        }
        if let Some(wal) = guard.wal.as_mut() {
            wal.append(WalRecordKind::UpdateVector, row, &open::encode_vector_payload(vector))?;
        }
        guard.store.update(row, vector)?;
        guard.index.update(&guard.store, row)?;
        guard.dedup.remove(row, &old)?;
        guard.dedup.insert(row, vector)?;
        Ok(())
    }

    pub(crate) fn update_metadata_locked(
        &self,
        guard: &mut Core,
        row: u64,
        meta: Metadata,
    ) -> CResult<()> {
        guard.store.metadata(row)?;
        if meta.keys().any(|key| key.is_empty()) {
            return Err(Error::InvalidInput("metadata keys must be non-empty".into()));
        }
        if let Some(wal) = guard.wal.as_mut() {
            wal.append(WalRecordKind::UpdateMetadata, row, &open::encode_meta_payload(&meta)?)?;
        }
        guard.store.set_metadata(row, meta)?;
        let meta = guard.store.metadata(row)?.clone();
        guard.payload.update_row(row, &meta);
        Ok(())
    }

    fn check_query(&self, core: &Core, query: &[f32]) -> CResult<()> {
        if query.len() != core.store.dim() {
            return Err(Error::InvalidInput(format!(
                "query dimension {} does not match database dimension {}",
                query.len(),
                core.store.dim()
            )));
        }
        Ok(())
    }

    pub(crate) fn search(
        &self,
        query: &[f32],
        k: usize,
        metric: Distance,
        expr: Option<&Expr>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_open()?;
        let guard = self.read_core();
        let core = &*guard;
        self.check_query(core, query)?;
        if !core.index.is_trained() {
            return Err(Error::Untrained);
        }

        let now = now_micros();
        let candidates = expr.and_then(|e| core.payload.candidates(e));
        let filter = |row: u64| -> bool {
            if self.config.ttl.lazy_expiration && self.ttl.is_expired(row, now) {
                return false;
            }
            if let Some(candidates) = &candidates {
                if candidates.binary_search(&row).is_err() {
                    return false;
                }
            }
            match expr {
                Some(e) => e.matches(core.store.metadata_raw(row)),
                None => true,
            }
        };

        let (base_ef, base_nprobe) = (
            self.config.index_config.hnsw.ef_search,
            self.config.index_config.ivfpq.nprobe,
        );
        let plan = self.optimizer.plan(
            core.index.kind(),
            core.store.live_count(),
            k,
            base_ef,
            base_nprobe,
            expr.is_some(),
        );

        if plan.exact {
            let mut heap = ResultHeap::new(k);
            for row in core.store.live_indices() {
                if filter(row) {
                    heap.push(row, metric.compute(query, core.store.raw(row)));
                }
            }
            return Ok(heap.into_sorted());
        }
        match &core.index {
            Index::Hnsw(hnsw) => {
                hnsw.search_with_ef(&core.store, query, k, metric, plan.ef_search, Some(&filter))
            }
            Index::IvfPq(ivf) => ivf.search_with_nprobe(
                &core.store,
                query,
                k,
                metric,
                plan.nprobe,
                Some(&filter),
            ),
            other => other.search(&core.store, query, k, metric, Some(&filter)),
        }
    }

    pub(crate) fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        metric: Distance,
        expr: Option<&Expr>,
    ) -> CResult<Vec<Neighbor>> {
        self.check_open()?;
        let guard = self.read_core();
        let core = &*guard;
        self.check_query(core, query)?;

        let now = now_micros();
        let filter = |row: u64| -> bool {
            if self.config.ttl.lazy_expiration && self.ttl.is_expired(row, now) {
                return false;
            }
            match expr {
                Some(e) => e.matches(core.store.metadata_raw(row)),
                None => true,
            }
        };
        core.index.range_search(&core.store, query, radius, metric, Some(&filter))
    }

    /// Spawns the background TTL cleaner. Expired rows are deleted through
    /// the normal write path so every component observes the deletion.
    pub(crate) fn spawn_cleaner(self: &Arc<Self>) {
        let interval = self.config.ttl.cleanup_interval_seconds;
        if interval == 0 {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let period = std::time::Duration::from_secs(interval);
        let max = self.config.ttl.max_expired_per_cleanup;
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(period) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                _ => return,
            }
            let shared = match weak.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let rows = shared.ttl.collect_expired(now_micros(), max);
            let expired = rows.len();
            for row in rows {
                let result = {
                    let mut core = shared.write_core();
                    shared.delete_row_locked(&mut core, row)
                };
                match result {
                    Ok(old) => shared.publish(ChangeKind::Delete, row, Some(&old), None),
                    // Deleted by someone else in the meantime.
                    Err(Error::NotFound(_)) => {}
                    Err(err) => {
                        shared.ttl.record_cleanup_error();
                        log::error!("ttl cleaner failed to delete row {}: {}", row, err);
                    }
                }
            }
            if expired > 0 {
                log::info!("ttl cleaner removed {} expired rows", expired);
            }
        });
        *self.cleaner.lock().expect("cleaner lock poisoned") = Some(CleanerHandle { tx, handle });
    }

    pub(crate) fn stop_cleaner(&self) {
        let handle = self.cleaner.lock().expect("cleaner lock poisoned").take();
        if let Some(CleanerHandle { tx, handle }) = handle {
            drop(tx);
            if handle.join().is_err() {
                log::error!("ttl cleaner thread panicked");
            }
        }
    }
}

pub(crate) struct CleanerHandle {
    tx: mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dimension", &self.shared.config.dimension)
            .field("index", &self.shared.config.index)
            .finish()
    }
}
