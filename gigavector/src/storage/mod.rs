pub mod snapshot;
pub mod store;
pub mod wal;

use serde_derive::{Deserialize, Serialize};

/// Storage status counters, reported through the database stats surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The dimensionality of stored vectors.
    pub dimension: usize,

    /// Total rows, tombstoned included.
    pub rows: usize,

    /// Rows that are live (not tombstoned).
    pub live_rows: usize,

    /// Tombstoned rows awaiting compaction.
    pub deleted_rows: usize,

    /// The logical size of live vector data in bytes.
    pub vector_bytes: usize,
}

/// Microseconds since the Unix epoch. Row timestamps and WAL records use
/// this resolution throughout.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
