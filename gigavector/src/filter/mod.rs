//! The metadata filter language: a small boolean expression language lexed
//! with logos, parsed by recursive descent, and evaluated against a row's
//! metadata bag. The payload index accelerates some shapes, but evaluation
//! here is always the authoritative answer.

pub mod parser;
pub mod token_kind;
pub mod tokenizer;

use std::cmp::Ordering;

pub use parser::{parse, CompareOp, Expr};

use crate::value::{Metadata, Value};

impl Expr {
    /// Evaluates the expression against a metadata bag. A comparison whose
    /// field is missing, or whose types cannot be compared, does not match.
    pub fn matches(&self, meta: &Metadata) -> bool {
        match self {
            Expr::And(a, b) => a.matches(meta) && b.matches(meta),
            Expr::Or(a, b) => a.matches(meta) || b.matches(meta),
            Expr::Not(inner) => !inner.matches(meta),
            Expr::Compare { field, op, literal } => match meta.get(field) {
                Some(value) => compare_values(*op, value, literal),
                None => false,
            },
        }
    }
}

/// Applies a comparison operator between a stored value and a literal.
/// Integer and float compare numerically; any other cross-type comparison is
/// rejected, meaning the row does not match.
pub(crate) fn compare_values(op: CompareOp, value: &Value, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => value.cmp_same_type(literal) == Some(Ordering::Equal),
        CompareOp::Ne => matches!(
            value.cmp_same_type(literal),
            Some(Ordering::Less) | Some(Ordering::Greater)
        ),
        CompareOp::Lt => value.cmp_same_type(literal) == Some(Ordering::Less),
        CompareOp::Le => matches!(
            value.cmp_same_type(literal),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        CompareOp::Gt => value.cmp_same_type(literal) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            value.cmp_same_type(literal),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        CompareOp::Contains => match (value, literal) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => {
                items.iter().any(|item| item.cmp_same_type(needle) == Some(Ordering::Equal))
            }
            _ => false,
        },
        CompareOp::StartsWith => match (value, literal) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;

    fn meta() -> Metadata {
        Metadata::from([
            ("color".to_string(), Value::String("dark red".into())),
            ("rank".to_string(), Value::Integer(5)),
            ("score".to_string(), Value::Float(0.75)),
            ("active".to_string(), Value::Bool(true)),
            (
                "tags".to_string(),
                Value::Array(vec![Value::String("a".into()), Value::String("b".into())]),
            ),
        ])
    }

    #[test]
    fn equality_and_ordering() -> CResult<()> {
        let m = meta();
        assert!(parse(r#"color == "dark red""#)?.matches(&m));
        assert!(parse("rank > 3")?.matches(&m));
        assert!(parse("rank <= 5")?.matches(&m));
        assert!(!parse("rank < 5")?.matches(&m));
        assert!(parse("score >= 0.5")?.matches(&m));
        assert!(parse("active == TRUE")?.matches(&m));
        Ok(())
    }

    #[test]
    fn int_float_coercion() -> CResult<()> {
        let m = meta();
        assert!(parse("rank == 5.0")?.matches(&m));
        assert!(parse("score < 1")?.matches(&m));
        Ok(())
    }

    #[test]
    fn cross_type_rejected() -> CResult<()> {
        let m = meta();
        // String vs number never matches, not even for !=.
        assert!(!parse("color == 5")?.matches(&m));
        assert!(!parse("color != 5")?.matches(&m));
        assert!(!parse("rank == \"5\"")?.matches(&m));
        Ok(())
    }

    #[test]
    fn missing_field_does_not_match() -> CResult<()> {
        let m = meta();
        assert!(!parse("ghost == 1")?.matches(&m));
        assert!(!parse("ghost != 1")?.matches(&m));
        // NOT of a missing-field comparison does match.
        assert!(parse("NOT ghost == 1")?.matches(&m));
        Ok(())
    }

    #[test]
    fn contains_and_startswith() -> CResult<()> {
        let m = meta();
        assert!(parse(r#"color CONTAINS "dark""#)?.matches(&m));
        assert!(parse(r#"color STARTSWITH "dark""#)?.matches(&m));
        assert!(!parse(r#"color STARTSWITH "red""#)?.matches(&m));
        assert!(parse(r#"tags CONTAINS "a""#)?.matches(&m));
        assert!(!parse(r#"tags CONTAINS "z""#)?.matches(&m));
        Ok(())
    }

    #[test]
    fn boolean_composition() -> CResult<()> {
        let m = meta();
        assert!(parse(r#"rank > 3 AND color STARTSWITH "dark""#)?.matches(&m));
        assert!(parse("rank > 100 OR score > 0.5")?.matches(&m));
        assert!(!parse("rank > 100 AND score > 0.5")?.matches(&m));
        assert!(parse("NOT (rank > 100)")?.matches(&m));
        Ok(())
    }
}
