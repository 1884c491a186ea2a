use std::collections::HashMap;

use chrono::{Datelike, Timelike};
use lazy_static::lazy_static;

use crate::core::{DataType, Value};

/// Signature of a built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub result_type: DataType,
}

const fn def(name: &'static str, min_args: usize, max_args: usize, result_type: DataType) -> FunctionDef {
    FunctionDef {
        name,
        min_args,
        max_args,
        result_type,
    }
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, FunctionDef> = [
        def("toupper", 1, 1, DataType::String),
        def("tolower", 1, 1, DataType::String),
        def("trim", 1, 1, DataType::String),
        def("length", 1, 1, DataType::Int32),
        def("substring", 2, 3, DataType::String),
        def("substringof", 2, 2, DataType::Boolean),
        def("startswith", 2, 2, DataType::Boolean),
        def("endswith", 2, 2, DataType::Boolean),
        def("indexof", 2, 2, DataType::Int32),
        def("concat", 2, 2, DataType::String),
        def("replace", 3, 3, DataType::String),
        def("year", 1, 1, DataType::Int32),
        def("month", 1, 1, DataType::Int32),
        def("day", 1, 1, DataType::Int32),
        def("hour", 1, 1, DataType::Int32),
        def("minute", 1, 1, DataType::Int32),
        def("second", 1, 1, DataType::Int32),
        def("round", 1, 1, DataType::Double),
        def("floor", 1, 1, DataType::Double),
        def("ceiling", 1, 1, DataType::Double),
    ]
    .into_iter()
    .map(|f| (f.name, f))
    .collect();
}

/// Evaluates built-in string, date and math functions.
///
/// Arity is checked when an expression is parsed, so `apply` only deals
/// with operand kinds; mismatched or null operands produce null.
pub struct FunctionEvaluator;

impl FunctionEvaluator {
    /// Case-insensitive lookup of a function signature.
    pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
        FUNCTIONS.get(name.to_ascii_lowercase().as_str())
    }

    pub fn apply(&self, name: &str, args: &[Value]) -> Value {
        match name {
            "toupper" => self.map_str(args, |s| s.to_uppercase().into()),
            "tolower" => self.map_str(args, |s| s.to_lowercase().into()),
            "trim" => self.map_str(args, |s| s.trim().into()),
            "length" => self.map_str(args, |s| Value::Integer(s.chars().count() as i64)),
            "substring" => self.substring(args),
            "substringof" => match (str_arg(args, 0), str_arg(args, 1)) {
                (Some(needle), Some(haystack)) => Value::Boolean(haystack.contains(needle)),
                _ => Value::Null,
            },
            "startswith" => self.str_pair(args, |a, b| Value::Boolean(a.starts_with(b))),
            "endswith" => self.str_pair(args, |a, b| Value::Boolean(a.ends_with(b))),
            "indexof" => self.str_pair(args, |a, b| {
                Value::Integer(a.find(b).map(|i| a[..i].chars().count() as i64).unwrap_or(-1))
            }),
            "concat" => match (args.first(), args.get(1)) {
                (Some(Value::Null), _) | (_, Some(Value::Null)) | (None, _) | (_, None) => Value::Null,
                (Some(a), Some(b)) => Value::String(format!("{}{}", a, b)),
            },
            "replace" => match (str_arg(args, 0), str_arg(args, 1), str_arg(args, 2)) {
                (Some(s), Some(find), Some(with)) => Value::String(s.replace(find, with)),
                _ => Value::Null,
            },
            "year" => self.date_part(args, |d| d.year() as i64),
            "month" => self.date_part(args, |d| d.month() as i64),
            "day" => self.date_part(args, |d| d.day() as i64),
            "hour" => self.date_part(args, |d| d.hour() as i64),
            "minute" => self.date_part(args, |d| d.minute() as i64),
            "second" => self.date_part(args, |d| d.second() as i64),
            "round" => self.math(args, f64::round),
            "floor" => self.math(args, f64::floor),
            "ceiling" => self.math(args, f64::ceil),
            _ => Value::Null,
        }
    }

    fn map_str(&self, args: &[Value], f: impl Fn(&str) -> Value) -> Value {
        str_arg(args, 0).map(f).unwrap_or(Value::Null)
    }

    fn str_pair(&self, args: &[Value], f: impl Fn(&str, &str) -> Value) -> Value {
        match (str_arg(args, 0), str_arg(args, 1)) {
            (Some(a), Some(b)) => f(a, b),
            _ => Value::Null,
        }
    }

    fn substring(&self, args: &[Value]) -> Value {
        let (Some(s), Some(start)) = (str_arg(args, 0), args.get(1).and_then(Value::as_i64)) else {
            return Value::Null;
        };
        let start = start.max(0) as usize;
        let chars = s.chars().skip(start);
        match args.get(2).and_then(Value::as_i64) {
            Some(len) => Value::String(chars.take(len.max(0) as usize).collect()),
            None => Value::String(chars.collect()),
        }
    }

    fn date_part(&self, args: &[Value], f: impl Fn(&chrono::DateTime<chrono::Utc>) -> i64) -> Value {
        match args.first() {
            Some(Value::DateTime(d)) => Value::Integer(f(d)),
            _ => Value::Null,
        }
    }

    fn math(&self, args: &[Value], f: impl Fn(f64) -> f64) -> Value {
        args.first()
            .and_then(Value::as_f64)
            .map(|n| Value::Double(f(n)))
            .unwrap_or(Value::Null)
    }
}

fn str_arg(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_registry_lookup() {
        let f = FunctionEvaluator::lookup("ToUpper").unwrap();
        assert_eq!(f.result_type, DataType::String);
        assert_eq!(FunctionEvaluator::lookup("length").unwrap().result_type, DataType::Int32);
        assert!(FunctionEvaluator::lookup("coalesce").is_none());
    }

    #[test]
    fn test_string_functions() {
        let ev = FunctionEvaluator;
        assert_eq!(ev.apply("toupper", &["abc".into()]), Value::from("ABC"));
        assert_eq!(ev.apply("substring", &["Futterkiste".into(), 2.into(), 3.into()]), Value::from("tte"));
        assert_eq!(ev.apply("substringof", &["kist".into(), "Futterkiste".into()]), Value::Boolean(true));
        assert_eq!(ev.apply("indexof", &["Berlin".into(), "rl".into()]), Value::Integer(2));
        assert_eq!(ev.apply("length", &[Value::Null]), Value::Null);
    }

    #[test]
    fn test_date_and_math_functions() {
        let ev = FunctionEvaluator;
        let d = Value::DateTime(Utc.with_ymd_and_hms(1997, 3, 14, 9, 30, 5).unwrap());
        assert_eq!(ev.apply("year", &[d.clone()]), Value::Integer(1997));
        assert_eq!(ev.apply("minute", &[d]), Value::Integer(30));
        assert_eq!(ev.apply("ceiling", &[Value::Double(1.2)]), Value::Double(2.0));
    }
}
