use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::mvcc::transaction::Transaction;
use crate::mvcc::TxnId;

/// One version record: an owned vector copy plus its creation and deletion
/// stamps. `delete_txn == 0` means live.
pub(crate) struct VersionRecord {
    pub(crate) create_txn: TxnId,
    pub(crate) delete_txn: TxnId,
    pub(crate) data: Vec<f32>,
}

/// Per-transaction bookkeeping while the transaction is active.
pub(crate) struct TxnMeta {
    /// The snapshot this transaction reads at, `id - 1`.
    pub(crate) snapshot: TxnId,

    /// Transactions that were active (uncommitted) at begin. Their writes
    /// stay invisible even though their ids are below the snapshot.
    pub(crate) active_at_begin: BTreeSet<TxnId>,

    /// Version slots this transaction created, for rollback.
    pub(crate) added: Vec<usize>,

    /// Version slots this transaction stamped deleted, for rollback.
    pub(crate) deleted: Vec<usize>,
}

pub(crate) struct MvccInner {
    pub(crate) dim: usize,

    /// Version records indexed by row; a reclaimed slot is None.
    pub(crate) versions: Vec<Option<VersionRecord>>,

    pub(crate) next_txn: TxnId,

    /// Active transaction ids, sorted so the minimum is O(log n).
    pub(crate) active: BTreeSet<TxnId>,

    pub(crate) txns: HashMap<TxnId, TxnMeta>,

    /// Transactions that have committed or rolled back; their stamps are
    /// final.
    pub(crate) resolved: HashSet<TxnId>,
}

impl MvccInner {
    /// Whether a version is visible to the given transaction.
    pub(crate) fn visible(&self, txn: TxnId, meta: &TxnMeta, record: &VersionRecord) -> bool {
        let created_visible = record.create_txn == txn
            || (record.create_txn <= meta.snapshot
                && !meta.active_at_begin.contains(&record.create_txn));
        if !created_visible {
            return false;
        }
        let deleted_invisible = record.delete_txn != 0
            && (record.delete_txn == txn
                || (record.delete_txn <= meta.snapshot
                    && !meta.active_at_begin.contains(&record.delete_txn)));
        !deleted_invisible
    }

    pub(crate) fn meta(&self, txn: TxnId) -> CResult<&TxnMeta> {
        self.txns.get(&txn).ok_or_else(|| Error::NotFound(format!("transaction {} not active", txn)))
    }
}

/// MVCC engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MvccStatus {
    /// Version records currently held, reclaimed slots excluded.
    pub versions: u64,

    /// Currently active transactions.
    pub active_txns: u64,

    /// The next transaction id to be assigned.
    pub next_txn: u64,
}

/// An MVCC-managed vector store. Cheap to clone; all clones share state.
pub struct MvccStore {
    pub(crate) inner: Arc<Mutex<MvccInner>>,
}

impl MvccStore {
    pub fn new(dim: usize) -> CResult<Self> {
        if dim == 0 {
            return Err(Error::InvalidInput("dimension must be at least 1".into()));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(MvccInner {
                dim,
                versions: Vec::new(),
                next_txn: 1,
                active: BTreeSet::new(),
                txns: HashMap::new(),
                resolved: HashSet::new(),
            })),
        })
    }

    /// Begins a read-write transaction at the next id, snapshotting the
    /// current active set.
    pub fn begin(&self) -> Transaction {
        let mut inner = self.inner.lock().expect("mvcc lock poisoned");
        let id = inner.next_txn;
        inner.next_txn += 1;
        let meta = TxnMeta {
            snapshot: id - 1,
            active_at_begin: inner.active.clone(),
            added: Vec::new(),
            deleted: Vec::new(),
        };
        inner.active.insert(id);
        inner.txns.insert(id, meta);
        Transaction::new(self.inner.clone(), id)
    }

    /// Reclaims versions invisible to every active and future transaction.
    /// Returns the number of reclaimed version records.
    pub fn gc(&self) -> usize {
        let mut inner = self.inner.lock().expect("mvcc lock poisoned");
        let min_active = inner.active.iter().next().copied().unwrap_or(TxnId::MAX);
        let mut reclaim = Vec::new();
        for (slot, record) in inner.versions.iter().enumerate() {
            let record = match record {
                Some(record) => record,
                None => continue,
            };
            if record.delete_txn == 0
                || record.delete_txn >= min_active
                || !inner.resolved.contains(&record.delete_txn)
            {
                continue;
            }
            // The deleter resolved below every active id, but an active
            // transaction that saw the deleter live at begin still reads
            // this version; keep it for them.
            let pinned = inner.txns.values().any(|meta| {
                meta.active_at_begin.contains(&record.delete_txn)
                    || record.delete_txn > meta.snapshot
            });
            if !pinned {
                reclaim.push(slot);
            }
        }
        for slot in &reclaim {
            inner.versions[*slot] = None;
        }
        if !reclaim.is_empty() {
            log::info!("mvcc gc reclaimed {} versions", reclaim.len());
        }
        reclaim.len()
    }

    pub fn status(&self) -> MvccStatus {
        let inner = self.inner.lock().expect("mvcc lock poisoned");
        MvccStatus {
            versions: inner.versions.iter().filter(|v| v.is_some()).count() as u64,
            active_txns: inner.active.len() as u64,
            next_txn: inner.next_txn,
        }
    }
}

impl Clone for MvccStore {
    fn clone(&self) -> Self {
        MvccStore { inner: self.inner.clone() }
    }
}
