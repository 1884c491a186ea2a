use std::cmp::Ordering;

use crate::core::Value;
use crate::evaluator::ComparisonOptions;
use crate::query::Operator;

/// Binary comparison and string-match operators over two evaluated operands.
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    pub fn compare(&self, left: &Value, right: &Value, op: Operator, options: &ComparisonOptions) -> bool {
        match op {
            Operator::Equals => Self::equals(left, right, options),
            Operator::NotEquals => !Self::equals(left, right, options),
            Operator::LessThan => Self::order(left, right, options) == Some(Ordering::Less),
            Operator::LessThanOrEqual => matches!(
                Self::order(left, right, options),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::GreaterThan => Self::order(left, right, options) == Some(Ordering::Greater),
            Operator::GreaterThanOrEqual => matches!(
                Self::order(left, right, options),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::StartsWith => Self::string_match(left, right, options, |a, b| a.starts_with(b)),
            Operator::EndsWith => Self::string_match(left, right, options, |a, b| a.ends_with(b)),
            Operator::Contains => Self::string_match(left, right, options, |a, b| a.contains(b)),
            _ => false,
        }
    }

    fn equals(left: &Value, right: &Value, options: &ComparisonOptions) -> bool {
        match (left, right) {
            (Value::String(a), Value::String(b)) => options.normalize(a) == options.normalize(b),
            _ => left == right,
        }
    }

    /// Ordering between two non-null values; null on either side never orders.
    fn order(left: &Value, right: &Value, options: &ComparisonOptions) -> Option<Ordering> {
        match (left, right) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::String(a), Value::String(b)) => {
                Some(options.normalize(a).cmp(&options.normalize(b)))
            }
            _ => left.compare(right),
        }
    }

    fn string_match(
        left: &Value,
        right: &Value,
        options: &ComparisonOptions,
        f: impl Fn(&str, &str) -> bool,
    ) -> bool {
        match (left, right) {
            (Value::String(a), Value::String(b)) => f(&options.normalize(a), &options.normalize(b)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn check(left: impl Into<Value>, op: Operator, right: impl Into<Value>) -> bool {
        ComparisonEvaluator.compare(&left.into(), &right.into(), op, &ComparisonOptions::default())
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(check(120.5, Operator::GreaterThan, 100));
        assert!(check(100, Operator::GreaterThanOrEqual, 100.0));
        assert!(!check(Value::Null, Operator::LessThan, 5));
        assert!(check(Value::Null, Operator::Equals, Value::Null));
    }

    #[test]
    fn test_string_policy() {
        assert!(check("Berlin ", Operator::Equals, "berlin"));
        assert!(check("Alfreds Futterkiste", Operator::StartsWith, "alf"));
        assert!(check("Alfreds Futterkiste", Operator::Contains, "FUTTER"));
        let strict = ComparisonOptions::case_sensitive_non_sql();
        assert!(!ComparisonEvaluator.compare(
            &Value::from("Berlin"),
            &Value::from("berlin"),
            Operator::Equals,
            &strict
        ));
    }

    #[test]
    fn test_dates_compare_by_instant() {
        let a = Utc.with_ymd_and_hms(1996, 7, 4, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(1996, 7, 4, 0, 0, 0).unwrap();
        assert!(check(a, Operator::Equals, b));
        assert!(check(
            chrono::Duration::minutes(90),
            Operator::GreaterThan,
            chrono::Duration::hours(1)
        ));
    }
}
