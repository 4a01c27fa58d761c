//! Value normalization for field comparison.
//!
//! Backends and forms disagree about how "nothing" is spelled: a column may
//! come back as `null`, be missing from the payload, or hold an empty string.
//! All of these compare equal here. JSON numbers compare by value, so `5` and
//! `5.0` are the same amount. Text is never coerced: `"01234"` and `"1234"`
//! are different values.

use serde_json::{Number, Value};

#[derive(Debug, PartialEq)]
enum Normalized<'a> {
    Empty,
    Number(&'a Number),
    Other(&'a Value),
}

fn normalize(value: Option<&Value>) -> Normalized<'_> {
    match value {
        None | Some(Value::Null) => Normalized::Empty,
        Some(Value::String(text)) if text.trim().is_empty() => Normalized::Empty,
        Some(Value::Number(number)) => Normalized::Number(number),
        Some(other) => Normalized::Other(other),
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
        _ => a == b,
    }
}

/// Whether two field values are the same after normalization
pub fn values_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (normalize(left), normalize(right)) {
        (Normalized::Number(a), Normalized::Number(b)) => numbers_equal(a, b),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_spellings_are_equal() {
        let empty = json!("");
        let blank = json!("   ");
        let null = Value::Null;
        assert!(values_equal(None, Some(&empty)));
        assert!(values_equal(Some(&null), Some(&blank)));
        assert!(values_equal(Some(&empty), None));
    }

    #[test]
    fn numbers_compare_numerically() {
        assert!(values_equal(Some(&json!(5)), Some(&json!(5.0))));
        assert!(values_equal(Some(&json!(12.50)), Some(&json!(12.5))));
        assert!(!values_equal(Some(&json!(5)), Some(&json!(6))));
        assert!(!values_equal(Some(&json!(u64::MAX)), Some(&json!(u64::MAX - 1))));
    }

    #[test]
    fn numeric_looking_text_is_compared_as_text() {
        for (left, right) in [("01234", "1234"), ("+1", "1"), ("1e3", "1000"), ("1.50", "1.5")] {
            assert!(
                !values_equal(Some(&json!(left)), Some(&json!(right))),
                "{left} should differ from {right}"
            );
        }
        assert!(!values_equal(Some(&json!("5")), Some(&json!(5))));
        assert!(values_equal(Some(&json!("01234")), Some(&json!("01234"))));
    }

    #[test]
    fn text_is_compared_exactly() {
        assert!(!values_equal(Some(&json!("Lamp ")), Some(&json!("Lamp"))));
        assert!(!values_equal(Some(&json!("lamp")), Some(&json!("Lamp"))));
        assert!(!values_equal(Some(&json!("Lamp")), None));
    }

    #[test]
    fn structured_values_compare_exactly() {
        assert!(values_equal(Some(&json!([1, 2])), Some(&json!([1, 2]))));
        assert!(!values_equal(Some(&json!(true)), Some(&json!(false))));
        assert!(!values_equal(Some(&json!({"a": 1})), None));
    }
}
