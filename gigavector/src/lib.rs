//! `gigavector` is an embeddable vector database: an in-process engine that
//! stores float32 vectors with typed key/value metadata, answers exact and
//! approximate nearest-neighbor queries over several index families, and
//! carries the machinery needed to run such a store reliably: a write-ahead
//! log with crash-consistent replay, binary snapshots, snapshot-isolation
//! MVCC, conditional (compare-and-swap) mutations, an ordered change-data-
//! capture stream, per-row TTL, and a payload index for metadata filters.
//!
//! ## Getting started
//!
//! ```rust
//! use gigavector::db::Database;
//! use gigavector::distance::Distance;
//! use gigavector::index::IndexKind;
//! use gigavector::value::{Metadata, Value};
//!
//! fn main() -> Result<(), gigavector::error::Error> {
//!     let db = Database::open_in_memory(4, IndexKind::Flat)?;
//!
//!     db.add_vector(&[1.0, 0.0, 0.0, 0.0])?;
//!     db.add_vector_with_metadata(
//!         &[0.0, 1.0, 0.0, 0.0],
//!         Metadata::from([("color".to_string(), Value::String("blue".into()))]),
//!     )?;
//!
//!     let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 2, Distance::Euclidean)?;
//!     assert_eq!(hits[0].row, 0);
//!     assert_eq!(hits[0].distance, 0.0);
//!
//!     let blue = db.search_filtered(
//!         &[0.0, 1.0, 0.0, 0.0],
//!         1,
//!         Distance::Euclidean,
//!         r#"color == "blue""#,
//!     )?;
//!     assert_eq!(blue[0].row, 1);
//!
//!     db.close()?;
//!     Ok(())
//! }
//! ```

pub mod cdc;
pub mod conditional;
pub mod db;
pub mod distance;
pub mod error;
pub mod filter;
pub mod index;
pub mod mvcc;
pub mod optimizer;
pub mod payload;
pub mod storage;
pub mod ttl;
pub mod value;

pub use crate::db::{Database, DatabaseConfig, DbStats};
pub use crate::distance::Distance;
pub use crate::error::{CResult, Error};
pub use crate::index::{IndexKind, Neighbor};
pub use crate::value::{Metadata, Value};
