use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::mvcc::store::{MvccInner, VersionRecord};
use crate::mvcc::TxnId;

/// An MVCC transaction. Exactly one of [`Transaction::commit`] or
/// [`Transaction::rollback`] must conclude it; dropping an unconcluded
/// transaction rolls it back.
pub struct Transaction {
    /// The shared engine state, held by all transactions.
    inner: Arc<Mutex<MvccInner>>,

    id: TxnId,

    /// Set once the transaction has committed or rolled back.
    done: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<Mutex<MvccInner>>, id: TxnId) -> Self {
        Self { inner, id, done: false }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Inserts a vector, returning its row. The row is visible to this
    /// transaction immediately and to others only after commit.
    pub fn insert(&self, vector: &[f32]) -> CResult<u64> {
        let mut inner = self.inner.lock().expect("mvcc lock poisoned");
        if vector.len() != inner.dim {
            return Err(Error::InvalidInput(format!(
                "vector dimension {} does not match store dimension {}",
                vector.len(),
                inner.dim
            )));
        }
        inner.meta(self.id)?;
        let row = inner.versions.len();
        inner.versions.push(Some(VersionRecord {
            create_txn: self.id,
            delete_txn: 0,
            data: vector.to_vec(),
        }));
        inner
            .txns
            .get_mut(&self.id)
            .expect("meta checked above")
            .added
            .push(row);
        Ok(row as u64)
    }

    /// Deletes the row's visible version. Conflicts if another transaction
    /// has already stamped it.
    pub fn delete(&self, row: u64) -> CResult<()> {
        let mut inner = self.inner.lock().expect("mvcc lock poisoned");
        let slot = row as usize;
        if slot >= inner.versions.len() {
            return Err(Error::InvalidInput(format!("row {} out of range", row)));
        }
        let meta = inner.meta(self.id)?;
        let record = match &inner.versions[slot] {
            Some(record) if inner.visible(self.id, meta, record) => record,
            _ => return Err(Error::NotFound(format!("row {} not visible", row))),
        };
        if record.delete_txn != 0 {
            // Visible but already stamped: the stamper is concurrent with us
            // or committed after our snapshot. First writer wins.
            return Err(Error::WriteConflict);
        }
        inner.versions[slot].as_mut().expect("checked above").delete_txn = self.id;
        inner
            .txns
            .get_mut(&self.id)
            .expect("meta checked above")
            .deleted
            .push(slot);
        Ok(())
    }

    /// Reads the row's visible version.
    pub fn get(&self, row: u64) -> CResult<Vec<f32>> {
        let inner = self.inner.lock().expect("mvcc lock poisoned");
        let slot = row as usize;
        if slot >= inner.versions.len() {
            return Err(Error::InvalidInput(format!("row {} out of range", row)));
        }
        let meta = inner.meta(self.id)?;
        match &inner.versions[slot] {
            Some(record) if inner.visible(self.id, meta, record) => Ok(record.data.clone()),
            _ => Err(Error::NotFound(format!("row {} not visible", row))),
        }
    }

    /// Counts the rows visible to this transaction.
    pub fn count(&self) -> CResult<usize> {
        let inner = self.inner.lock().expect("mvcc lock poisoned");
        let meta = inner.meta(self.id)?;
        Ok(inner
            .versions
            .iter()
            .flatten()
            .filter(|record| inner.visible(self.id, meta, record))
            .count())
    }

    /// Commits: removes this transaction from the active set, making its
    /// stamps permanent and atomically visible to later transactions.
    pub fn commit(mut self) -> CResult<()> {
        self.resolve(true)
    }

    /// Rolls back: added versions are stamped deleted by this transaction
    /// and its delete stamps are cleared.
    pub fn rollback(mut self) -> CResult<()> {
        self.resolve(false)
    }

    fn resolve(&mut self, commit: bool) -> CResult<()> {
        let mut inner = self.inner.lock().expect("mvcc lock poisoned");
        let meta = inner
            .txns
            .remove(&self.id)
            .ok_or_else(|| Error::NotFound(format!("transaction {} not active", self.id)))?;
        if !commit {
            for slot in meta.added {
                if let Some(record) = inner.versions[slot].as_mut() {
                    record.delete_txn = self.id;
                }
            }
            for slot in meta.deleted {
                if let Some(record) = inner.versions[slot].as_mut() {
                    if record.delete_txn == self.id {
                        record.delete_txn = 0;
                    }
                }
            }
        }
        inner.active.remove(&self.id);
        inner.resolved.insert(self.id);
        self.done = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(error) = self.resolve(false) {
                log::error!("failed to roll back transaction {}: {}", self.id, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::MvccStore;

    #[test]
    fn ids_are_sequential() -> CResult<()> {
        let mvcc = MvccStore::new(4)?;
        let t1 = mvcc.begin();
        let t2 = mvcc.begin();
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        t1.commit()?;
        t2.rollback()?;
        Ok(())
    }

    #[test]
    fn own_writes_visible() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let t1 = mvcc.begin();
        let row = t1.insert(&[1.0, 2.0])?;
        assert_eq!(t1.get(row)?, vec![1.0, 2.0]);
        assert_eq!(t1.count()?, 1);
        t1.commit()?;
        Ok(())
    }

    #[test]
    fn snapshot_isolation() -> CResult<()> {
        let mvcc = MvccStore::new(4)?;
        let t1 = mvcc.begin();
        t1.insert(&[1.0, 1.0, 1.0, 1.0])?;

        // T2 began while T1 was active: T1's insert stays invisible even
        // after T1 commits.
        let t2 = mvcc.begin();
        assert_eq!(t2.count()?, 0);
        t1.commit()?;
        assert_eq!(t2.count()?, 0);

        // A transaction begun after the commit sees the row.
        let t3 = mvcc.begin();
        assert_eq!(t3.count()?, 1);
        t2.commit()?;
        t3.commit()?;
        Ok(())
    }

    #[test]
    fn uncommitted_writes_invisible_to_later_txn() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let t1 = mvcc.begin();
        let row = t1.insert(&[5.0, 5.0])?;
        let t2 = mvcc.begin();
        assert!(matches!(t2.get(row), Err(Error::NotFound(_))));
        t1.commit()?;
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn concurrent_delete_conflicts_once() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let setup = mvcc.begin();
        let row = setup.insert(&[1.0, 1.0])?;
        setup.commit()?;

        let t1 = mvcc.begin();
        let t2 = mvcc.begin();
        t1.delete(row)?;
        assert_eq!(t2.delete(row), Err(Error::WriteConflict));
        t1.commit()?;
        t2.rollback()?;
        Ok(())
    }

    #[test]
    fn delete_after_committed_delete() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let setup = mvcc.begin();
        let row = setup.insert(&[1.0, 1.0])?;
        setup.commit()?;

        let t1 = mvcc.begin();
        t1.delete(row)?;
        t1.commit()?;

        // The deleter committed before this snapshot: the version is simply
        // gone, not a conflict.
        let t2 = mvcc.begin();
        assert!(matches!(t2.delete(row), Err(Error::NotFound(_))));
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn own_delete_suppresses_row() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let setup = mvcc.begin();
        let row = setup.insert(&[1.0, 1.0])?;
        setup.commit()?;

        let t1 = mvcc.begin();
        t1.delete(row)?;
        assert_eq!(t1.count()?, 0);
        assert!(matches!(t1.get(row), Err(Error::NotFound(_))));
        // Deleting again is NotFound on our own snapshot, not a conflict.
        assert!(matches!(t1.delete(row), Err(Error::NotFound(_))));
        t1.commit()?;
        Ok(())
    }

    #[test]
    fn rollback_discards_insert() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let t1 = mvcc.begin();
        t1.insert(&[1.0, 1.0])?;
        t1.rollback()?;
        let t2 = mvcc.begin();
        assert_eq!(t2.count()?, 0);
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn rollback_restores_delete() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let setup = mvcc.begin();
        let row = setup.insert(&[1.0, 1.0])?;
        setup.commit()?;

        let t1 = mvcc.begin();
        t1.delete(row)?;
        t1.rollback()?;

        let t2 = mvcc.begin();
        assert_eq!(t2.get(row)?, vec![1.0, 1.0]);
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn drop_rolls_back() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        {
            let t1 = mvcc.begin();
            t1.insert(&[1.0, 1.0])?;
            // Dropped without commit.
        }
        let t2 = mvcc.begin();
        assert_eq!(t2.count()?, 0);
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn gc_reclaims_resolved_deletes() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let t1 = mvcc.begin();
        let row = t1.insert(&[1.0, 1.0])?;
        t1.commit()?;
        let t2 = mvcc.begin();
        t2.delete(row)?;
        t2.commit()?;

        assert_eq!(mvcc.gc(), 1);
        assert_eq!(mvcc.status().versions, 0);
        Ok(())
    }

    #[test]
    fn gc_respects_active_snapshots() -> CResult<()> {
        let mvcc = MvccStore::new(2)?;
        let t1 = mvcc.begin();
        let row = t1.insert(&[1.0, 1.0])?;
        t1.commit()?;

        // T2 deletes while T3 (begun before T2 commits) can still see the
        // row; the version must survive GC until T3 resolves.
        let t2 = mvcc.begin();
        t2.delete(row)?;
        let t3 = mvcc.begin();
        t2.commit()?;
        assert_eq!(t3.get(row)?, vec![1.0, 1.0]);

        assert_eq!(mvcc.gc(), 0);
        assert_eq!(t3.get(row)?, vec![1.0, 1.0]);
        t3.commit()?;

        assert_eq!(mvcc.gc(), 1);
        Ok(())
    }

    #[test]
    fn dimension_checked() -> CResult<()> {
        let mvcc = MvccStore::new(4)?;
        let t1 = mvcc.begin();
        assert!(matches!(t1.insert(&[1.0]), Err(Error::InvalidInput(_))));
        t1.rollback()?;
        Ok(())
    }
}
