//! Metadata filter language.
//!
//! A filter is either a leaf comparison over one metadata field or an
//! and/or combination of child filters. Evaluation short-circuits. A leaf
//! over a field the record does not carry evaluates false for every
//! operator.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Comparison operator of a leaf filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Membership on array fields, substring on string fields.
    Contains,
    /// Field value must be a member of the given array.
    In,
}

/// Combinator of a compound filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompoundOp {
    And,
    Or,
}

/// Recursive filter over record metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryFilter {
    Compound {
        op: CompoundOp,
        children: Vec<QueryFilter>,
    },
    Leaf {
        field: String,
        op: FilterOp,
        value: Value,
    },
}

impl QueryFilter {
    pub fn leaf(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        QueryFilter::Leaf {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, FilterOp::Eq, value)
    }

    pub fn and(children: Vec<QueryFilter>) -> Self {
        QueryFilter::Compound {
            op: CompoundOp::And,
            children,
        }
    }

    pub fn or(children: Vec<QueryFilter>) -> Self {
        QueryFilter::Compound {
            op: CompoundOp::Or,
            children,
        }
    }

    /// Evaluate against a record's metadata.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            QueryFilter::Compound { op, children } => match op {
                CompoundOp::And => children.iter().all(|c| c.matches(metadata)),
                CompoundOp::Or => children.iter().any(|c| c.matches(metadata)),
            },
            QueryFilter::Leaf { field, op, value } => {
                let Some(actual) = metadata.get(field) else {
                    return false;
                };
                eval_leaf(actual, *op, value)
            }
        }
    }
}

fn eval_leaf(actual: &Value, op: FilterOp, expected: &Value) -> bool {
    match op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::Ne => !values_equal(actual, expected),
        FilterOp::Gt => matches!(compare(actual, expected), Some(Ordering::Greater)),
        FilterOp::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => matches!(compare(actual, expected), Some(Ordering::Less)),
        FilterOp::Lte => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Contains => match actual {
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            Value::String(haystack) => expected
                .as_str()
                .map(|needle| haystack.contains(needle))
                .unwrap_or(false),
            _ => false,
        },
        FilterOp::In => match expected {
            Value::Array(items) => items.iter().any(|item| values_equal(item, actual)),
            _ => false,
        },
    }
}

/// Equality that treats 1 and 1.0 as the same number, unlike raw
/// `Value::eq` which distinguishes integer and float representations.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers (as f64) and strings. Mixed or non-orderable types
/// yield `None`, which fails the leaf.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        let mut m = Map::new();
        if let Value::Object(obj) = value {
            m = obj;
        }
        m
    }

    #[test]
    fn eq_and_ne() {
        let m = meta(json!({"cat": "A", "n": 3}));
        assert!(QueryFilter::eq("cat", "A").matches(&m));
        assert!(!QueryFilter::eq("cat", "B").matches(&m));
        assert!(QueryFilter::leaf("cat", FilterOp::Ne, "B").matches(&m));
        assert!(QueryFilter::eq("n", 3.0).matches(&m), "1 == 1.0 numerically");
    }

    #[test]
    fn ordering_on_numbers_and_strings() {
        let m = meta(json!({"score": 10, "name": "beta"}));
        assert!(QueryFilter::leaf("score", FilterOp::Gte, 10).matches(&m));
        assert!(QueryFilter::leaf("score", FilterOp::Gt, 9.5).matches(&m));
        assert!(!QueryFilter::leaf("score", FilterOp::Lt, 10).matches(&m));
        assert!(QueryFilter::leaf("name", FilterOp::Gt, "alpha").matches(&m));
        // Mixed types never order.
        assert!(!QueryFilter::leaf("name", FilterOp::Gt, 5).matches(&m));
    }

    #[test]
    fn missing_field_fails_every_operator() {
        let m = meta(json!({"present": 1}));
        for op in [
            FilterOp::Eq,
            FilterOp::Ne,
            FilterOp::Gt,
            FilterOp::Gte,
            FilterOp::Lt,
            FilterOp::Lte,
            FilterOp::Contains,
            FilterOp::In,
        ] {
            assert!(
                !QueryFilter::leaf("absent", op, 1).matches(&m),
                "{op:?} over a missing field must fail"
            );
        }
    }

    #[test]
    fn contains_on_arrays_and_strings() {
        let m = meta(json!({"tags": ["rust", "db"], "title": "vector database"}));
        assert!(QueryFilter::leaf("tags", FilterOp::Contains, "rust").matches(&m));
        assert!(!QueryFilter::leaf("tags", FilterOp::Contains, "go").matches(&m));
        assert!(QueryFilter::leaf("title", FilterOp::Contains, "base").matches(&m));
        assert!(!QueryFilter::leaf("title", FilterOp::Contains, 7).matches(&m));
    }

    #[test]
    fn in_requires_array_value() {
        let m = meta(json!({"cat": "B"}));
        assert!(QueryFilter::leaf("cat", FilterOp::In, json!(["A", "B"])).matches(&m));
        assert!(!QueryFilter::leaf("cat", FilterOp::In, json!(["A", "C"])).matches(&m));
        assert!(!QueryFilter::leaf("cat", FilterOp::In, "B").matches(&m));
    }

    #[test]
    fn compound_short_circuits() {
        let m = meta(json!({"cat": "A", "score": 10}));
        let and = QueryFilter::and(vec![
            QueryFilter::eq("cat", "A"),
            QueryFilter::leaf("score", FilterOp::Gte, 10),
        ]);
        assert!(and.matches(&m));

        let or = QueryFilter::or(vec![
            QueryFilter::eq("cat", "Z"),
            QueryFilter::leaf("score", FilterOp::Gt, 5),
        ]);
        assert!(or.matches(&m));

        let nested = QueryFilter::and(vec![or, QueryFilter::eq("cat", "A")]);
        assert!(nested.matches(&m));
    }

    #[test]
    fn filters_deserialize_from_json() {
        let leaf: QueryFilter =
            serde_json::from_value(json!({"field": "cat", "op": "eq", "value": "A"})).unwrap();
        assert!(matches!(leaf, QueryFilter::Leaf { .. }));

        let compound: QueryFilter = serde_json::from_value(json!({
            "op": "and",
            "children": [
                {"field": "cat", "op": "eq", "value": "A"},
                {"field": "score", "op": "gte", "value": 10}
            ]
        }))
        .unwrap();
        assert!(matches!(
            compound,
            QueryFilter::Compound {
                op: CompoundOp::And,
                ..
            }
        ));
    }
}
