//! Multi-version concurrency control over vectors.
//!
//! This module provides snapshot isolation: multiple concurrent transactions
//! read and write the same store, each seeing a consistent snapshot as of
//! its begin, with write-write conflicts on the same row surfaced as errors.
//!
//! VERSIONS
//! ========
//! Every transactional insert creates a version record stamped with the
//! creating transaction id (`create_txn`); a delete stamps the record's
//! `delete_txn`. A transaction `T` takes snapshot `S = T - 1` and a copy of
//! the set of transactions active at its begin. A version is visible to `T`
//! iff it was created by `T` itself, or created at or before `S` by a
//! transaction that was not still active when `T` began; and it is not
//! deleted under the same rule (a delete by `T` itself suppresses the
//! version for `T` immediately).
//!
//! Committing removes `T` from the active set, making its stamps permanent
//! and atomically visible to transactions that begin afterwards. Rolling
//! back stamps every version `T` added with `delete_txn = T` and clears the
//! delete stamps `T` placed, which makes its work invisible to every later
//! snapshot without any physical unwind.
//!
//! Two concurrent deletes of the same row conflict: the second one to reach
//! the version finds a foreign delete stamp and returns `WriteConflict`.
//!
//! GC reclaims versions whose delete stamp belongs to a resolved
//! transaction and is invisible to every active snapshot.

mod store;
mod transaction;

pub use store::{MvccStatus, MvccStore};
pub use transaction::Transaction;

/// A transaction id, also serving as a logical timestamp. The first
/// transaction is 1; id 0 never occurs and doubles as the "not deleted"
/// stamp.
pub type TxnId = u64;
