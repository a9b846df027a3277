use crate::error::TidedbError;
use crate::types::Scalar;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    fn parse(s: &str) -> Option<Comparator> {
        match s {
            "eq" => Some(Comparator::Eq),
            "gt" => Some(Comparator::Gt),
            "gte" => Some(Comparator::Gte),
            "lt" => Some(Comparator::Lt),
            "lte" => Some(Comparator::Lte),
            _ => None,
        }
    }
}

/// A single-field filter `{ field, comparator, value }`.
///
/// A condition yields both an index range descriptor and an in-memory
/// predicate; the two agree on every input, which is the invariant the
/// property tests pin down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    pub value: Scalar,
}

impl Condition {
    pub fn new(field: impl Into<String>, comparator: Comparator, value: impl Into<Scalar>) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }

    /// Parse a `where` clause of the shape `{field: {comparator: value}}`.
    /// Exactly one field with exactly one comparator; anything else is a
    /// malformed condition.
    pub fn from_where(clause: &Value) -> Result<Condition, TidedbError> {
        let obj = clause.as_object().ok_or_else(|| {
            TidedbError::InvalidCondition("where clause must be an object".into())
        })?;
        if obj.len() != 1 {
            return Err(TidedbError::InvalidCondition(format!(
                "where clause must name exactly one field, got {}",
                obj.len()
            )));
        }
        let (field, spec) = obj.iter().next().expect("len checked above");
        let spec_obj = spec.as_object().ok_or_else(|| {
            TidedbError::InvalidCondition(format!("filter for '{field}' must be an object"))
        })?;
        if spec_obj.len() != 1 {
            return Err(TidedbError::InvalidCondition(format!(
                "filter for '{field}' must name exactly one comparator, got {}",
                spec_obj.len()
            )));
        }
        let (op, raw) = spec_obj.iter().next().expect("len checked above");
        let comparator = Comparator::parse(op).ok_or_else(|| {
            TidedbError::InvalidCondition(format!("unknown comparator '{op}'"))
        })?;
        let value = Scalar::from_value(raw).ok_or_else(|| {
            TidedbError::InvalidCondition(format!(
                "value for '{field}' must be a string or number"
            ))
        })?;
        Ok(Condition {
            field: field.clone(),
            comparator,
            value,
        })
    }

    /// Range descriptor driving a secondary-index scan.
    pub fn range(&self) -> (Bound<Scalar>, Bound<Scalar>) {
        match self.comparator {
            Comparator::Eq => (
                Bound::Included(self.value.clone()),
                Bound::Included(self.value.clone()),
            ),
            Comparator::Gt => (Bound::Excluded(self.value.clone()), Bound::Unbounded),
            Comparator::Gte => (Bound::Included(self.value.clone()), Bound::Unbounded),
            Comparator::Lt => (Bound::Unbounded, Bound::Excluded(self.value.clone())),
            Comparator::Lte => (Bound::Unbounded, Bound::Included(self.value.clone())),
        }
    }

    /// Whether a candidate index entry falls inside [`Condition::range`].
    pub fn contains(&self, candidate: &Scalar) -> bool {
        match self.comparator {
            Comparator::Eq => candidate.cmp(&self.value) == Ordering::Equal,
            Comparator::Gt => candidate.cmp(&self.value) == Ordering::Greater,
            Comparator::Gte => candidate.cmp(&self.value) != Ordering::Less,
            Comparator::Lt => candidate.cmp(&self.value) == Ordering::Less,
            Comparator::Lte => candidate.cmp(&self.value) != Ordering::Greater,
        }
    }

    /// In-memory predicate over a document. Documents whose field is
    /// missing or not a scalar never match.
    pub fn satisfies(&self, document: &Value) -> bool {
        document
            .get(&self.field)
            .and_then(Scalar::from_value)
            .is_some_and(|v| self.contains(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::{Comparator, Condition};
    use crate::error::TidedbError;
    use crate::types::Scalar;
    use serde_json::json;

    #[test]
    fn parses_single_field_single_comparator() {
        let c = Condition::from_where(&json!({"status": {"eq": "open"}})).expect("valid");
        assert_eq!(c.field, "status");
        assert_eq!(c.comparator, Comparator::Eq);
        assert_eq!(c.value, Scalar::Text("open".into()));
    }

    #[test]
    fn rejects_zero_or_many_fields() {
        assert!(matches!(
            Condition::from_where(&json!({})),
            Err(TidedbError::InvalidCondition(_))
        ));
        assert!(matches!(
            Condition::from_where(&json!({"a": {"eq": 1}, "b": {"eq": 2}})),
            Err(TidedbError::InvalidCondition(_))
        ));
    }

    #[test]
    fn rejects_multiple_comparators_and_unknown_ops() {
        assert!(Condition::from_where(&json!({"a": {"gt": 1, "lt": 5}})).is_err());
        assert!(Condition::from_where(&json!({"a": {"neq": 1}})).is_err());
        assert!(Condition::from_where(&json!({"a": {"eq": [1]}})).is_err());
    }

    #[test]
    fn satisfies_matches_numbers_and_strings() {
        let c = Condition::new("amount", Comparator::Gte, 50.0);
        assert!(c.satisfies(&json!({"amount": 50})));
        assert!(c.satisfies(&json!({"amount": 90.5})));
        assert!(!c.satisfies(&json!({"amount": 49})));
        assert!(!c.satisfies(&json!({"amount": "50"})));
        assert!(!c.satisfies(&json!({"other": 99})));
    }

    #[test]
    fn missing_or_non_scalar_fields_never_match() {
        let c = Condition::new("status", Comparator::Eq, "open");
        assert!(!c.satisfies(&json!({})));
        assert!(!c.satisfies(&json!({"status": null})));
        assert!(!c.satisfies(&json!({"status": {"nested": true}})));
    }

    #[test]
    fn predicate_agrees_with_range_contains() {
        let candidates = [
            Scalar::Number(-1.0),
            Scalar::Number(0.0),
            Scalar::Number(10.0),
            Scalar::Text("a".into()),
            Scalar::Text("z".into()),
        ];
        for comparator in [
            Comparator::Eq,
            Comparator::Gt,
            Comparator::Gte,
            Comparator::Lt,
            Comparator::Lte,
        ] {
            let c = Condition::new("f", comparator, 0.0);
            for candidate in &candidates {
                let doc = json!({"f": candidate.to_value()});
                assert_eq!(
                    c.satisfies(&doc),
                    c.contains(candidate),
                    "comparator {comparator:?} disagrees on {candidate:?}"
                );
            }
        }
    }
}
