//! Conditional (compare-and-swap) mutations.
//!
//! The manager wraps a database handle and applies mutations only when every
//! listed condition holds, all under one acquisition of the database write
//! lock: locate the row, evaluate the conditions in order, apply, bump the
//! version. Batches evaluate each row independently; an applied row is
//! committed regardless of later failures in the same batch.

use crate::cdc::ChangeKind;
use crate::db::Database;
use crate::error::{CResult, Error};
use crate::value::{Metadata, Value};

/// A precondition evaluated against the row's current state.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// The row's version counter equals the expected value.
    VersionEquals(u64),

    /// The row's version counter is strictly below the bound; equality
    /// fails.
    VersionLessThan(u64),

    /// The metadata key exists and deep-equals the value.
    MetadataEquals(String, Value),

    MetadataExists(String),
    MetadataAbsent(String),

    /// The row is not tombstoned.
    NotDeleted,
}

/// The mutation applied once every condition holds.
#[derive(Clone, Debug, PartialEq)]
pub enum CasMutation {
    UpdateVector(Vec<f32>),
    UpdateMetadata(Metadata),
    Delete,
}

/// One entry of a [`ConditionalManager::batch_update`].
#[derive(Clone, Debug)]
pub struct BatchOp {
    pub row: u64,
    pub conditions: Vec<Condition>,
    pub mutation: CasMutation,
}

/// The per-row outcome of a batch. Successful rows carry their new version.
pub type BatchResult = (u64, CResult<u64>);

pub struct ConditionalManager {
    db: Database,
}

impl ConditionalManager {
    pub fn new(db: &Database) -> Self {
        Self { db: db.clone() }
    }

    /// Replaces a row's vector if every condition holds. Returns the new
    /// version.
    pub fn update_vector(
        &self,
        row: u64,
        vector: &[f32],
        conditions: &[Condition],
    ) -> CResult<u64> {
        self.apply(row, conditions, CasMutation::UpdateVector(vector.to_vec()))
    }

    /// Replaces a row's metadata if every condition holds.
    pub fn update_metadata(
        &self,
        row: u64,
        meta: Metadata,
        conditions: &[Condition],
    ) -> CResult<u64> {
        self.apply(row, conditions, CasMutation::UpdateMetadata(meta))
    }

    /// Tombstones a row if every condition holds.
    pub fn delete(&self, row: u64, conditions: &[Condition]) -> CResult<u64> {
        self.apply(row, conditions, CasMutation::Delete)
    }

    /// The row's current version counter, readable for tombstoned rows too.
    pub fn get_version(&self, row: u64) -> CResult<u64> {
        self.db.get_version(row).map_err(|err| match err {
            Error::InvalidInput(s) => Error::NotFound(s),
            other => other,
        })
    }

    /// Version-checked vector replacement: the common optimistic pattern of
    /// re-embedding a row against its observed version.
    pub fn migrate_embedding(&self, row: u64, vector: &[f32], expected_version: u64) -> CResult<u64> {
        self.update_vector(row, vector, &[Condition::VersionEquals(expected_version)])
    }

    /// Applies each entry independently under one lock acquisition. There is
    /// no rollback: a row that was applied stays applied even if a later
    /// entry fails.
    pub fn batch_update(&self, ops: Vec<BatchOp>) -> CResult<Vec<BatchResult>> {
        let shared = self.db.shared.as_ref();
        shared.check_open()?;
        let mut results = Vec::with_capacity(ops.len());
        let mut events = Vec::new();
        {
            let mut core = shared.write_core();
            for op in ops {
                let result = apply_locked(shared, &mut core, op.row, &op.conditions, &op.mutation);
                if let Ok((version, event)) = &result {
                    events.push((op.row, event.clone()));
                    results.push((op.row, Ok(*version)));
                } else {
                    results.push((op.row, result.map(|(v, _)| v)));
                }
            }
        }
        for (row, event) in events {
            publish_event(shared, row, event);
        }
        Ok(results)
    }

    fn apply(&self, row: u64, conditions: &[Condition], mutation: CasMutation) -> CResult<u64> {
        let shared = self.db.shared.as_ref();
        shared.check_open()?;
        let (version, event) = {
            let mut core = shared.write_core();
            apply_locked(shared, &mut core, row, conditions, &mutation)?
        };
        publish_event(shared, row, event);
        Ok(version)
    }
}

/// What to publish after the lock is released.
#[derive(Clone)]
enum CasEvent {
    Vector(Vec<f32>),
    Metadata(Metadata),
    Deleted(Vec<f32>),
}

fn publish_event(shared: &crate::db::Shared, row: u64, event: CasEvent) {
    match event {
        CasEvent::Vector(vector) => {
            shared.publish(ChangeKind::UpdateVector, row, Some(&vector), None)
        }
        CasEvent::Metadata(meta) => {
            shared.publish(ChangeKind::UpdateMetadata, row, None, Some(&meta))
        }
        CasEvent::Deleted(old) => shared.publish(ChangeKind::Delete, row, Some(&old), None),
    }
}

fn apply_locked(
    shared: &crate::db::Shared,
    core: &mut crate::db::Core,
    row: u64,
    conditions: &[Condition],
    mutation: &CasMutation,
) -> CResult<(u64, CasEvent)> {
    // Locate.
    if row >= core.store.len() as u64 {
        return Err(Error::NotFound(format!("row {} does not exist", row)));
    }
    // Evaluate in order; the first false condition fails the mutation.
    for condition in conditions {
        if !holds(core, row, condition)? {
            return Err(Error::ConditionFailed(format!("{:?}", condition)));
        }
    }
    // Apply. The underlying mutation bumps the version and the update
    // timestamp.
    let event = match mutation {
        CasMutation::UpdateVector(vector) => {
            shared.update_vector_locked(core, row, vector)?;
            CasEvent::Vector(vector.clone())
        }
        CasMutation::UpdateMetadata(meta) => {
            shared.update_metadata_locked(core, row, meta.clone())?;
            CasEvent::Metadata(meta.clone())
        }
        CasMutation::Delete => {
            let old = shared.delete_row_locked(core, row)?;
            CasEvent::Deleted(old)
        }
    };
    Ok((core.store.version(row)?, event))
}

fn holds(core: &crate::db::Core, row: u64, condition: &Condition) -> CResult<bool> {
    Ok(match condition {
        Condition::VersionEquals(expected) => core.store.version(row)? == *expected,
        Condition::VersionLessThan(bound) => core.store.version(row)? < *bound,
        Condition::MetadataEquals(key, value) => {
            core.store.metadata_raw(row).get(key) == Some(value)
        }
        Condition::MetadataExists(key) => core.store.metadata_raw(row).contains_key(key),
        Condition::MetadataAbsent(key) => !core.store.metadata_raw(row).contains_key(key),
        Condition::NotDeleted => !core.store.is_deleted(row),
    })
}
