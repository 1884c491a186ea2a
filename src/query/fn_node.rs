// ============================================================================
// Expression nodes
// ============================================================================
//
// Parses the property-path / function-call mini language used on the left
// side of predicates (and on the right when comparing two expressions):
//
//   Freight
//   Customer.CompanyName
//   toupper(substring(CompanyName, 1, 3))
//   year(OrderDate)
//
// Quoted literals are lifted out first, then the innermost parenthesized
// groups are replaced by positional tokens until no parentheses remain. Each
// remaining segment is then classified as a literal, a property path or a
// function application.
//
// ============================================================================

use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::core::{parse_datetime, parse_duration, CacheError, DataType, Result, Value};
use crate::entity::Entity;
use crate::evaluator::plugins::FunctionEvaluator;
use crate::evaluator::EvaluationContext;
use crate::metadata::MetadataStore;

/// Compiled local form of an expression node.
pub type LocalFn = Arc<dyn Fn(&Entity, &EvaluationContext<'_>) -> Value + Send + Sync>;

lazy_static! {
    static ref INNER_GROUP: Regex = Regex::new(r"\(([^()]*)\)").unwrap();
    static ref FUNCTION_CALL: Regex = Regex::new(r"^([A-Za-z_]\w*)\s*@G(\d+)$").unwrap();
    static ref GROUP_TOKEN: Regex = Regex::new(r"^@G(\d+)$").unwrap();
    static ref STRING_TOKEN: Regex = Regex::new(r"^@S(\d+)$").unwrap();
    static ref TYPED_LITERAL: Regex =
        Regex::new(r"^(?i)(datetime|datetimeoffset|guid|time|binary)@S(\d+)$").unwrap();
    static ref NUMBER: Regex = Regex::new(r"^-?\d+(\.\d+)?([eE][+-]?\d+)?[mMdDfFlL]?$").unwrap();
    static ref DATE_SHAPED: Regex =
        Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?)?$").unwrap();
    static ref PROPERTY_PATH: Regex = Regex::new(r"^[A-Za-z_]\w*([./][A-Za-z_]\w*)*$").unwrap();
}

/// True when `s` could name a property path.
pub fn is_property_path(s: &str) -> bool {
    let s = s.trim();
    PROPERTY_PATH.is_match(s)
        && !matches!(s.to_ascii_lowercase().as_str(), "true" | "false" | "null")
}

/// One node of an expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FnNode {
    Literal { value: Value, data_type: DataType },
    Property { path: String },
    Function { name: String, args: Vec<FnNode> },
}

impl FnNode {
    pub fn literal(value: impl Into<Value>) -> Self {
        let value = value.into();
        let data_type = DataType::for_value(&value);
        Self::Literal { value, data_type }
    }

    pub fn property(path: impl Into<String>) -> Self {
        Self::Property { path: path.into() }
    }

    /// Parse an expression. Property paths are not checked here; use
    /// [`FnNode::validate`] once a type is known.
    pub fn parse(source: &str) -> Result<Self> {
        let (text, strings) = extract_strings(source)?;
        let mut text = text;
        let mut groups: Vec<String> = Vec::new();
        while let Some(captures) = INNER_GROUP.captures(&text) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                break;
            };
            let range = whole.range();
            let token = format!("@G{}", groups.len());
            groups.push(inner.as_str().to_string());
            text.replace_range(range, &token);
        }
        if text.contains(['(', ')']) {
            return Err(CacheError::InvalidExpression(format!(
                "Unbalanced parentheses in '{}'",
                source
            )));
        }
        let parser = SegmentParser {
            source,
            strings: &strings,
            groups: &groups,
        };
        parser.parse(&text)
    }

    /// Check property paths against `type_name`.
    pub fn validate(&self, store: &MetadataStore, type_name: &str) -> Result<()> {
        match self {
            Self::Literal { .. } => Ok(()),
            Self::Property { path } => store.resolve_property_path(type_name, path).map(|_| ()),
            Self::Function { args, .. } => args.iter().try_for_each(|a| a.validate(store, type_name)),
        }
    }

    /// Data type of the node's value when evaluated against `type_name`.
    pub fn data_type(&self, store: &MetadataStore, type_name: Option<&str>) -> DataType {
        match self {
            Self::Literal { data_type, .. } => *data_type,
            Self::Property { path } => type_name
                .and_then(|t| store.resolve_property_path(t, path).ok())
                .map(|p| p.data_type())
                .unwrap_or(DataType::Undefined),
            Self::Function { name, .. } => FunctionEvaluator::lookup(name)
                .map(|f| f.result_type)
                .unwrap_or(DataType::Undefined),
        }
    }

    /// Remote filter fragment. Property paths are validated first when a
    /// type is given; `prefix` is the lambda variable inside any/all.
    pub fn to_odata(&self, store: &MetadataStore, type_name: Option<&str>, prefix: Option<&str>) -> Result<String> {
        match self {
            Self::Literal { value, data_type } => Ok(data_type.format_odata(value)),
            Self::Property { path } => {
                if let Some(t) = type_name {
                    store.resolve_property_path(t, path)?;
                }
                let server_path = store.naming_convention().path_to_server(path, "/");
                Ok(match prefix {
                    Some(var) => format!("{}/{}", var, server_path),
                    None => server_path,
                })
            }
            Self::Function { name, args } => {
                let rendered = args
                    .iter()
                    .map(|a| a.to_odata(store, type_name, prefix))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{}({})", name, rendered.join(",")))
            }
        }
    }

    /// Compile into a closure returning this node's value for an entity.
    pub fn to_local_fn(&self) -> LocalFn {
        match self {
            Self::Literal { value, .. } => {
                let value = value.clone();
                Arc::new(move |_: &Entity, _: &EvaluationContext<'_>| value.clone())
            }
            Self::Property { path } => {
                let parts: Vec<String> = path.split(['.', '/']).map(|p| p.trim().to_string()).collect();
                Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    ctx.property_value(entity, &parts)
                })
            }
            Self::Function { name, args } => {
                let name = name.clone();
                let args: Vec<LocalFn> = args.iter().map(FnNode::to_local_fn).collect();
                Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    let values: Vec<Value> = args.iter().map(|f| f(entity, ctx)).collect();
                    FunctionEvaluator.apply(&name, &values)
                })
            }
        }
    }
}

impl fmt::Display for FnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal { value: Value::String(s), .. } => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Literal { value, .. } => write!(f, "{}", value),
            Self::Property { path } => write!(f, "{}", path),
            Self::Function { name, args } => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{}({})", name, args.join(","))
            }
        }
    }
}

/// Replace quoted literals by `@S<n>` tokens. A doubled quote escapes a quote.
fn extract_strings(source: &str) -> Result<(String, Vec<String>)> {
    let mut text = String::with_capacity(source.len());
    let mut strings = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            text.push(c);
            continue;
        }
        let mut literal = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    literal.push('\'');
                } else {
                    closed = true;
                    break;
                }
            } else {
                literal.push(c);
            }
        }
        if !closed {
            return Err(CacheError::InvalidExpression(format!(
                "Unterminated string literal in '{}'",
                source
            )));
        }
        text.push_str(&format!("@S{}", strings.len()));
        strings.push(literal);
    }
    Ok((text, strings))
}

struct SegmentParser<'a> {
    source: &'a str,
    strings: &'a [String],
    groups: &'a [String],
}

impl SegmentParser<'_> {
    fn invalid(&self, detail: &str) -> CacheError {
        CacheError::InvalidExpression(format!("{} in '{}'", detail, self.source))
    }

    fn token_index(&self, captures: &regex::Captures<'_>, group: usize) -> Result<usize> {
        captures
            .get(group)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| self.invalid("Bad token"))
    }

    fn string(&self, index: usize) -> Result<&str> {
        self.strings
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.invalid("Bad string token"))
    }

    fn group(&self, index: usize) -> Result<&str> {
        self.groups
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.invalid("Bad group token"))
    }

    fn parse(&self, segment: &str) -> Result<FnNode> {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(self.invalid("Empty expression"));
        }

        if let Some(c) = STRING_TOKEN.captures(segment) {
            let s = self.string(self.token_index(&c, 1)?)?;
            return Ok(FnNode::Literal {
                value: Value::String(s.to_string()),
                data_type: DataType::String,
            });
        }
        if let Some(c) = TYPED_LITERAL.captures(segment) {
            let kind = c.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
            let raw = self.string(self.token_index(&c, 2)?)?;
            return self.typed_literal(&kind, raw);
        }
        if let Some(c) = FUNCTION_CALL.captures(segment) {
            let name = c.get(1).map(|m| m.as_str()).unwrap_or_default();
            let inner = self.group(self.token_index(&c, 2)?)?;
            return self.function(name, inner);
        }
        if let Some(c) = GROUP_TOKEN.captures(segment) {
            let inner = self.group(self.token_index(&c, 1)?)?;
            return self.parse(inner);
        }
        if let Some(value) = bare_literal(segment) {
            let data_type = DataType::for_value(&value);
            return Ok(FnNode::Literal { value, data_type });
        }
        if is_property_path(segment) {
            return Ok(FnNode::Property {
                path: segment.to_string(),
            });
        }
        Err(self.invalid(&format!("Cannot parse '{}'", segment)))
    }

    fn function(&self, name: &str, inner: &str) -> Result<FnNode> {
        let def = FunctionEvaluator::lookup(name)
            .ok_or_else(|| CacheError::UnknownFunction(name.to_string()))?;
        let args = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|arg| self.parse(arg))
                .collect::<Result<Vec<_>>>()?
        };
        if args.len() < def.min_args || args.len() > def.max_args {
            return Err(self.invalid(&format!(
                "Function '{}' takes {}..={} arguments, got {}",
                def.name,
                def.min_args,
                def.max_args,
                args.len()
            )));
        }
        Ok(FnNode::Function {
            name: def.name.to_string(),
            args,
        })
    }

    fn typed_literal(&self, kind: &str, raw: &str) -> Result<FnNode> {
        let (value, data_type) = match kind {
            "datetime" | "datetimeoffset" => (
                parse_datetime(raw).map(Value::DateTime),
                if kind == "datetime" {
                    DataType::DateTime
                } else {
                    DataType::DateTimeOffset
                },
            ),
            "guid" => (Uuid::parse_str(raw).ok().map(Value::Guid), DataType::Guid),
            "time" => (parse_duration(raw).map(Value::Duration), DataType::Time),
            _ => (DataType::Binary.coerce(Value::from(raw)).ok(), DataType::Binary),
        };
        let value = value.ok_or_else(|| self.invalid(&format!("Bad {} literal '{}'", kind, raw)))?;
        Ok(FnNode::Literal { value, data_type })
    }
}

fn bare_literal(segment: &str) -> Option<Value> {
    match segment.to_ascii_lowercase().as_str() {
        "true" => return Some(Value::Boolean(true)),
        "false" => return Some(Value::Boolean(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if NUMBER.is_match(segment) {
        let digits = segment.trim_end_matches(['m', 'M', 'd', 'D', 'f', 'F', 'l', 'L']);
        if let Ok(i) = digits.parse::<i64>() {
            return Some(Value::Integer(i));
        }
        return digits.parse::<f64>().ok().map(Value::Double);
    }
    if DATE_SHAPED.is_match(segment) {
        return parse_datetime(segment).map(Value::DateTime);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ComparisonOptions, NoLookup};

    #[test]
    fn test_parse_shapes() {
        assert_eq!(FnNode::parse("Freight").unwrap(), FnNode::property("Freight"));
        assert_eq!(FnNode::parse("'O''Brien'").unwrap(), FnNode::literal("O'Brien"));
        assert_eq!(FnNode::parse("42").unwrap(), FnNode::literal(42i64));
        assert_eq!(FnNode::parse("1.5m").unwrap(), FnNode::literal(1.5));

        let node = FnNode::parse("toupper(substring(CompanyName, 1, 3))").unwrap();
        assert_eq!(node.to_string(), "toupper(substring(CompanyName,1,3))");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            FnNode::parse("frobnicate(Name)"),
            Err(CacheError::UnknownFunction(_))
        ));
        assert!(matches!(
            FnNode::parse("toupper(Name"),
            Err(CacheError::InvalidExpression(_))
        ));
        assert!(matches!(
            FnNode::parse("substring(Name)"),
            Err(CacheError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_typed_literals() {
        let node = FnNode::parse("datetime'1998-01-01T00:00:00Z'").unwrap();
        assert!(matches!(node, FnNode::Literal { data_type: DataType::DateTime, .. }));
        let node = FnNode::parse("guid'c5a0b67a-0a9d-4a33-a1a0-6b1e4a9d8c11'").unwrap();
        assert!(matches!(node, FnNode::Literal { data_type: DataType::Guid, .. }));
    }

    #[test]
    fn test_local_function() {
        let node = FnNode::parse("length(trim(Name))").unwrap();
        let f = node.to_local_fn();
        let entity = Entity::new("Customer").with_value("Name", "  Alfreds ");
        let options = ComparisonOptions::default();
        let ctx = EvaluationContext::new(&NoLookup, &options);
        assert_eq!(f(&entity, &ctx), Value::Integer(7));
    }

    #[test]
    fn test_property_path_shape() {
        assert!(is_property_path("Customer.CompanyName"));
        assert!(is_property_path("Customer/CompanyName"));
        assert!(!is_property_path("Berlin Mitte"));
        assert!(!is_property_path("true"));
    }
}
