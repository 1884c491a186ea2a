use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::{format_duration, parse_duration};
use super::{CacheError, Result, Value};

/// Scalar data types a data property can carry.
///
/// Complex-typed properties are described by `DataProperty::complex_type_name`
/// and carry `DataType::Undefined` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int64,
    Int32,
    Int16,
    Byte,
    Decimal,
    Double,
    Single,
    Boolean,
    DateTime,
    DateTimeOffset,
    Time,
    Guid,
    Binary,
    Undefined,
}

impl DataType {
    /// Resolve a data type by name. Accepts `Edm.`-prefixed names and is case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let bare = name.strip_prefix("Edm.").unwrap_or(name);
        let dt = match bare.to_ascii_lowercase().as_str() {
            "string" => Self::String,
            "int64" => Self::Int64,
            "int32" => Self::Int32,
            "int16" => Self::Int16,
            "byte" | "sbyte" => Self::Byte,
            "decimal" => Self::Decimal,
            "double" => Self::Double,
            "single" => Self::Single,
            "boolean" => Self::Boolean,
            "datetime" => Self::DateTime,
            "datetimeoffset" => Self::DateTimeOffset,
            "time" | "duration" => Self::Time,
            "guid" => Self::Guid,
            "binary" => Self::Binary,
            "undefined" => Self::Undefined,
            _ => return None,
        };
        Some(dt)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int64
                | Self::Int32
                | Self::Int16
                | Self::Byte
                | Self::Decimal
                | Self::Double
                | Self::Single
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int64 | Self::Int32 | Self::Int16 | Self::Byte)
    }

    pub fn is_date(&self) -> bool {
        matches!(self, Self::DateTime | Self::DateTimeOffset)
    }

    /// Value a non-nullable property takes when nothing else was assigned.
    pub fn default_value(&self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Int64 | Self::Int32 | Self::Int16 | Self::Byte => Value::Integer(0),
            Self::Decimal | Self::Double | Self::Single => Value::Double(0.0),
            Self::Boolean => Value::Boolean(false),
            Self::DateTime | Self::DateTimeOffset => Utc
                .with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
                .single()
                .map(Value::DateTime)
                .unwrap_or(Value::Null),
            Self::Time => Value::Duration(chrono::Duration::zero()),
            Self::Guid => Value::Guid(Uuid::nil()),
            Self::Binary | Self::Undefined => Value::Null,
        }
    }

    /// Convert a raw JSON scalar into a value of this type.
    pub fn parse_json(&self, raw: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;
        match raw {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => self.coerce(Value::Boolean(*b)),
            Json::Number(n) => {
                let v = match n.as_i64() {
                    Some(i) => Value::Integer(i),
                    None => Value::Double(n.as_f64().unwrap_or(0.0)),
                };
                self.coerce(v)
            }
            Json::String(s) => self.coerce(Value::String(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(CacheError::TypeMismatch(format!(
                "Cannot read {} from structured JSON",
                self
            ))),
        }
    }

    /// Coerce a value into this data type, parsing strings where needed.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |v: &Value| {
            CacheError::TypeMismatch(format!("Cannot convert {} to {}", v.type_name(), self))
        };
        let coerced = match (self, value) {
            (Self::Undefined, v) => v,
            (Self::String, Value::String(s)) => Value::String(s),
            (Self::String, v @ (Value::Integer(_) | Value::Double(_) | Value::Guid(_))) => {
                Value::String(v.to_string())
            }
            (dt, Value::Integer(i)) if dt.is_integer() => Value::Integer(i),
            (dt, Value::Double(f)) if dt.is_integer() && f.fract() == 0.0 => {
                Value::Integer(f as i64)
            }
            (dt, Value::Integer(i)) if dt.is_numeric() => Value::Double(i as f64),
            (dt, Value::Double(f)) if dt.is_numeric() => Value::Double(f),
            (dt, Value::String(s)) if dt.is_integer() => Value::Integer(
                s.trim_end_matches(['L', 'l'])
                    .parse()
                    .map_err(|_| mismatch(&Value::String(s.clone())))?,
            ),
            (dt, Value::String(s)) if dt.is_numeric() => Value::Double(
                s.trim_end_matches(['m', 'M', 'f', 'F', 'd', 'D'])
                    .parse()
                    .map_err(|_| mismatch(&Value::String(s.clone())))?,
            ),
            (Self::Boolean, Value::Boolean(b)) => Value::Boolean(b),
            (Self::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(mismatch(&Value::String(s))),
            },
            (dt, Value::DateTime(d)) if dt.is_date() => Value::DateTime(d),
            (dt, Value::String(s)) if dt.is_date() => {
                Value::DateTime(parse_datetime(&s).ok_or_else(|| mismatch(&Value::String(s.clone())))?)
            }
            (Self::Time, Value::Duration(d)) => Value::Duration(d),
            (Self::Time, Value::String(s)) => {
                Value::Duration(parse_duration(&s).ok_or_else(|| mismatch(&Value::String(s.clone())))?)
            }
            (Self::Time, Value::Integer(ms)) => Value::Duration(chrono::Duration::milliseconds(ms)),
            (Self::Guid, Value::Guid(g)) => Value::Guid(g),
            (Self::Guid, Value::String(s)) => {
                Value::Guid(Uuid::parse_str(&s).map_err(|_| mismatch(&Value::String(s.clone())))?)
            }
            (Self::Binary, Value::Binary(b)) => Value::Binary(b),
            (Self::Binary, Value::String(s)) => {
                Value::Binary(decode_hex(&s).ok_or_else(|| mismatch(&Value::String(s.clone())))?)
            }
            (_, v) => return Err(mismatch(&v)),
        };
        Ok(coerced)
    }

    /// Render a value as a remote filter literal for this type.
    pub fn format_odata(&self, value: &Value) -> String {
        if value.is_null() {
            return "null".to_string();
        }
        match (self, value) {
            (Self::String, v) => format!("'{}'", v.to_string().replace('\'', "''")),
            (Self::Int64, Value::Integer(i)) => format!("{}L", i),
            (Self::Decimal, v) => format!("{}m", v),
            (Self::Single, v) => format!("{}f", v),
            (Self::DateTime, Value::DateTime(d)) => format!("datetime'{}'", format_datetime(d)),
            (Self::DateTimeOffset, Value::DateTime(d)) => {
                format!("datetimeoffset'{}'", format_datetime(d))
            }
            (Self::Time, Value::Duration(d)) => format!("time'{}'", format_duration(d)),
            (Self::Guid, Value::Guid(g)) => format!("guid'{}'", g),
            (Self::Binary, Value::Binary(b)) => format!("binary'{}'", encode_hex(b)),
            (Self::Undefined, v) => Self::for_value(v).format_odata(v),
            (_, v) => v.to_string(),
        }
    }

    /// The natural data type of an untyped value.
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Null | Value::Complex(_) => Self::Undefined,
            Value::Boolean(_) => Self::Boolean,
            Value::Integer(_) => Self::Int32,
            Value::Double(_) => Self::Double,
            Value::String(_) => Self::String,
            Value::DateTime(_) => Self::DateTime,
            Value::Duration(_) => Self::Time,
            Value::Guid(_) => Self::Guid,
            Value::Binary(_) => Self::Binary,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "String",
            Self::Int64 => "Int64",
            Self::Int32 => "Int32",
            Self::Int16 => "Int16",
            Self::Byte => "Byte",
            Self::Decimal => "Decimal",
            Self::Double => "Double",
            Self::Single => "Single",
            Self::Boolean => "Boolean",
            Self::DateTime => "DateTime",
            Self::DateTimeOffset => "DateTimeOffset",
            Self::Time => "Time",
            Self::Guid => "Guid",
            Self::Binary => "Binary",
            Self::Undefined => "Undefined",
        };
        write!(f, "{}", name)
    }
}

pub fn format_datetime(d: &DateTime<Utc>) -> String {
    d.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Accepts RFC 3339, naive date-times (read as UTC) and bare dates.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(n) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&n));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
