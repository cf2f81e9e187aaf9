//! Typed payload (secondary) index over metadata fields.
//!
//! Each declared field keeps a `(value, row)` array sorted by value, so
//! single-field comparisons resolve by binary search and AND-compositions by
//! sorted-set intersection. The arrays hold copies of small typed values
//! keyed by row index; the metadata bags in storage stay authoritative, and
//! so does the filter evaluator: anything returned here is a candidate list
//! that equals the filter semantics for single conditions over indexed
//! fields and is a superset otherwise.

use std::collections::BTreeMap;

use crate::filter::{compare_values, CompareOp, Expr};
use crate::value::{Metadata, Value};

const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;

pub struct PayloadIndex {
    /// Field name to its sorted `(value, row)` entries.
    fields: BTreeMap<String, Vec<(Value, u64)>>,
}

impl PayloadIndex {
    pub fn new() -> Self {
        Self { fields: BTreeMap::new() }
    }

    /// Declares a field for indexing. Idempotent.
    pub fn add_field(&mut self, name: &str) {
        self.fields.entry(name.to_string()).or_default();
    }

    pub fn is_indexed(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|s| s.as_str())
    }

    /// Indexes one key of a row's metadata, if the field is declared.
    /// Keeps the array sorted under insertion.
    pub fn insert(&mut self, row: u64, key: &str, value: &Value) {
        if let Some(entries) = self.fields.get_mut(key) {
            let probe = (value.clone(), row);
            let at = entries
                .partition_point(|(v, r)| match v.sort_cmp(value) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => *r < row,
                    std::cmp::Ordering::Greater => false,
                });
            entries.insert(at, probe);
        }
    }

    /// Indexes every declared field present in a metadata bag.
    pub fn insert_row(&mut self, row: u64, meta: &Metadata) {
        for (key, value) in meta {
            self.insert(row, key, value);
        }
    }

    /// Purges a row from every field array. Rare relative to queries, so the
    /// linear scan per field is acceptable.
    pub fn remove_row(&mut self, row: u64) {
        for entries in self.fields.values_mut() {
            entries.retain(|(_, r)| *r != row);
        }
    }

    /// Replaces a row's entries after a metadata update.
    pub fn update_row(&mut self, row: u64, meta: &Metadata) {
        self.remove_row(row);
        self.insert_row(row, meta);
    }

    /// The contiguous run of entries whose value carries the given type tag.
    fn run(entries: &[(Value, u64)], tag: u8) -> &[(Value, u64)] {
        let start = entries.partition_point(|(v, _)| v.type_tag() < tag);
        let end = entries.partition_point(|(v, _)| v.type_tag() <= tag);
        &entries[start..end]
    }

    /// Resolves a single-field comparison, or None if the field is not
    /// indexed. Result rows are sorted ascending and deduplicated.
    pub fn query(&self, field: &str, op: CompareOp, literal: &Value) -> Option<Vec<u64>> {
        let entries = self.fields.get(field)?;
        let mut rows: Vec<u64> = match op {
            CompareOp::Eq | CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let mut rows = Self::ordered_query(Self::run(entries, literal.type_tag()), op, literal);
                // Numeric coercion: an integer literal also matches float
                // values and vice versa. The twin run is scanned exactly.
                let twin = match literal.type_tag() {
                    TAG_INT => Some(TAG_FLOAT),
                    TAG_FLOAT => Some(TAG_INT),
                    _ => None,
                };
                if let Some(tag) = twin {
                    for (value, row) in Self::run(entries, tag) {
                        if compare_values(op, value, literal) {
                            rows.push(*row);
                        }
                    }
                }
                rows
            }
            CompareOp::StartsWith => Self::prefix_query(entries, literal),
            CompareOp::Ne | CompareOp::Contains => entries
                .iter()
                .filter(|(value, _)| compare_values(op, value, literal))
                .map(|(_, row)| *row)
                .collect(),
        };
        rows.sort_unstable();
        rows.dedup();
        Some(rows)
    }

    /// Binary-searched bounds within a same-type run.
    fn ordered_query(run: &[(Value, u64)], op: CompareOp, literal: &Value) -> Vec<u64> {
        use std::cmp::Ordering::*;
        let lower = run.partition_point(|(v, _)| v.sort_cmp(literal) == Less);
        let upper = run.partition_point(|(v, _)| {
            matches!(v.sort_cmp(literal), Less | Equal)
        });
        let slice = match op {
            CompareOp::Eq => &run[lower..upper],
            CompareOp::Lt => &run[..lower],
            CompareOp::Le => &run[..upper],
            CompareOp::Gt => &run[upper..],
            CompareOp::Ge => &run[lower..],
            _ => &[],
        };
        slice.iter().map(|(_, row)| *row).collect()
    }

    /// String prefix: binary search to the first candidate, walk while the
    /// prefix holds.
    fn prefix_query(entries: &[(Value, u64)], literal: &Value) -> Vec<u64> {
        let prefix = match literal {
            Value::String(s) => s.as_str(),
            _ => return Vec::new(),
        };
        let run = Self::run(entries, literal.type_tag());
        let start = run.partition_point(|(v, _)| match v {
            Value::String(s) => s.as_str() < prefix,
            _ => false,
        });
        let mut rows = Vec::new();
        for (value, row) in &run[start..] {
            match value {
                Value::String(s) if s.starts_with(prefix) => rows.push(*row),
                _ => break,
            }
        }
        rows
    }

    /// Drops all entries and re-indexes the store's live rows, keeping the
    /// declared fields. Used after a store compaction renumbers rows.
    pub fn rebuild(&mut self, store: &crate::storage::store::VectorStore) {
        for entries in self.fields.values_mut() {
            entries.clear();
        }
        for row in store.live_indices() {
            self.insert_row(row, store.metadata_raw(row));
        }
    }

    /// Sorted intersection of two candidate lists.
    pub fn and_merge(a: &[u64], b: &[u64]) -> Vec<u64> {
        let mut out = Vec::with_capacity(a.len().min(b.len()));
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out
    }

    /// Candidate rows for a whole expression, when the index can help:
    /// single comparisons over indexed fields and AND-compositions of them.
    /// None means the caller must fall back to evaluating every row.
    pub fn candidates(&self, expr: &Expr) -> Option<Vec<u64>> {
        match expr {
            Expr::Compare { field, op, literal } => self.query(field, *op, literal),
            Expr::And(a, b) => match (self.candidates(a), self.candidates(b)) {
                (Some(ca), Some(cb)) => Some(Self::and_merge(&ca, &cb)),
                // One side indexed still narrows the scan; the filter
                // evaluator remains authoritative on the other side.
                (Some(ca), None) => Some(ca),
                (None, Some(cb)) => Some(cb),
                (None, None) => None,
            },
            Expr::Or(_, _) | Expr::Not(_) => None,
        }
    }
}

impl Default for PayloadIndex {
    fn default() -> Self {
        Self::new()
    }
}
