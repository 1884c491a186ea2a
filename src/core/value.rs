use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::types::format_datetime;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Duration(chrono::Duration),
    Guid(Uuid),
    Binary(Vec<u8>),
    /// Value of a complex-typed property, keyed by property name.
    Complex(BTreeMap<String, Value>),
}

impl Value {
    /// Natural ordering between two values.
    ///
    /// Numbers compare across integer/double, dates by instant, durations by
    /// elapsed seconds. Returns `None` for incomparable kinds; `Null` sorts first.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),

            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Double(a), Self::Double(b)) => Some(compare_f64(*a, *b)),
            (Self::Integer(a), Self::Double(b)) => Some(compare_f64(*a as f64, *b)),
            (Self::Double(a), Self::Integer(b)) => Some(compare_f64(*a, *b as f64)),

            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Duration(a), Self::Duration(b)) => {
                Some(duration_seconds(a).cmp(&duration_seconds(b)))
            }
            (Self::Guid(a), Self::Guid(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Boolean(_) => "BOOLEAN",
            Self::Integer(_) => "INTEGER",
            Self::Double(_) => "DOUBLE",
            Self::String(_) => "STRING",
            Self::DateTime(_) => "DATETIME",
            Self::Duration(_) => "DURATION",
            Self::Guid(_) => "GUID",
            Self::Binary(_) => "BINARY",
            Self::Complex(_) => "COMPLEX",
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Double(f) => *f != 0.0 && !f.is_nan(),
            Self::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Double(f) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Double(_))
    }

    /// Plain JSON rendering used for export and save payloads.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Boolean(b) => Json::Bool(*b),
            Self::Integer(i) => Json::from(*i),
            Self::Double(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
            Self::DateTime(d) => Json::String(format_datetime(d)),
            Self::Duration(d) => Json::String(format_duration(d)),
            Self::Guid(g) => Json::String(g.to_string()),
            Self::Binary(_) => Json::String(self.to_string()),
            Self::Complex(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Best-effort conversion of untyped JSON, used for projected rows.
    pub fn from_json(raw: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match raw {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Double(n.as_f64().unwrap_or(0.0)),
            },
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::Complex(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Self::from_json(v)))
                    .collect(),
            ),
            Json::Object(map) => Self::Complex(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn duration_seconds(d: &chrono::Duration) -> i64 {
    d.num_seconds()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Double(a), Self::Double(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                (a - b).abs() < f64::EPSILON
            }
            (Self::Integer(i), Self::Double(f)) | (Self::Double(f), Self::Integer(i)) => {
                (*i as f64 - f).abs() < f64::EPSILON
            }
            (Self::Complex(a), Self::Complex(b)) => a == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0u8.hash(state),
            Self::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // Integers and integral doubles must hash alike since they compare equal.
            Self::Integer(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Self::Double(f) if f.fract() == 0.0 && f.is_finite() => {
                2u8.hash(state);
                (*f as i64).hash(state);
            }
            Self::Double(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Self::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Self::DateTime(d) => {
                5u8.hash(state);
                d.hash(state);
            }
            Self::Duration(d) => {
                6u8.hash(state);
                d.num_seconds().hash(state);
            }
            Self::Guid(g) => {
                7u8.hash(state);
                g.hash(state);
            }
            Self::Binary(b) => {
                8u8.hash(state);
                b.hash(state);
            }
            Self::Complex(map) => {
                9u8.hash(state);
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Double(fl) => write!(f, "{}", fl),
            Self::String(s) => write!(f, "{}", s),
            Self::DateTime(d) => write!(f, "{}", format_datetime(d)),
            Self::Duration(d) => write!(f, "{}", format_duration(d)),
            Self::Guid(g) => write!(f, "{}", g),
            Self::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
            Self::Complex(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Double(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::DateTime(d)
    }
}

impl From<Uuid> for Value {
    fn from(g: Uuid) -> Self {
        Self::Guid(g)
    }
}

impl From<chrono::Duration> for Value {
    fn from(d: chrono::Duration) -> Self {
        Self::Duration(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

// Values travel as plain JSON; typed readers coerce them through `DataType`.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(&raw))
    }
}

/// ISO 8601 duration text, e.g. `PT1H30M` or `P2DT4S`.
pub fn format_duration(d: &chrono::Duration) -> String {
    let mut total_ms = d.num_milliseconds();
    let sign = if total_ms < 0 { "-" } else { "" };
    total_ms = total_ms.abs();
    let days = total_ms / 86_400_000;
    let hours = (total_ms / 3_600_000) % 24;
    let minutes = (total_ms / 60_000) % 60;
    let millis = total_ms % 60_000;

    let mut out = format!("{}P", sign);
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || millis > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if millis > 0 || (hours == 0 && minutes == 0) {
            if millis % 1000 == 0 {
                out.push_str(&format!("{}S", millis / 1000));
            } else {
                out.push_str(&format!("{}.{:03}S", millis / 1000, millis % 1000));
            }
        }
    }
    out
}

/// Parses the day-time subset of ISO 8601 durations (`[-]PnDTnHnMn.nS`).
pub fn parse_duration(s: &str) -> Option<chrono::Duration> {
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let rest = rest.strip_prefix('P')?;
    let mut total_ms: f64 = 0.0;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_unit = false;

    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number.parse().ok()?;
                number.clear();
                let scale = match (unit, in_time) {
                    ('D', false) => 86_400_000.0,
                    ('W', false) => 7.0 * 86_400_000.0,
                    ('H', true) => 3_600_000.0,
                    ('M', true) => 60_000.0,
                    ('S', true) => 1_000.0,
                    _ => return None,
                };
                total_ms += n * scale;
                seen_unit = true;
            }
        }
    }
    if !number.is_empty() || !seen_unit {
        return None;
    }
    let ms = total_ms.round() as i64;
    Some(chrono::Duration::milliseconds(if negative { -ms } else { ms }))
}
