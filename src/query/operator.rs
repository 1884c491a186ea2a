use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;

use crate::core::CacheError;

/// Canonical predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    StartsWith,
    EndsWith,
    Contains,
    Any,
    All,
    And,
    Or,
    Not,
}

const ALL_OPERATORS: [Operator; 14] = [
    Operator::Equals,
    Operator::NotEquals,
    Operator::LessThan,
    Operator::LessThanOrEqual,
    Operator::GreaterThan,
    Operator::GreaterThanOrEqual,
    Operator::StartsWith,
    Operator::EndsWith,
    Operator::Contains,
    Operator::Any,
    Operator::All,
    Operator::And,
    Operator::Or,
    Operator::Not,
];

lazy_static! {
    /// Lower-cased symbol, name and alias to operator.
    static ref OPERATOR_ALIASES: HashMap<String, Operator> = {
        let mut map = HashMap::new();
        for op in ALL_OPERATORS {
            map.insert(op.odata_symbol().to_string(), op);
            map.insert(format!("{:?}", op).to_lowercase(), op);
            for alias in op.aliases() {
                map.insert(alias.to_lowercase(), op);
            }
        }
        map
    };
}

impl Operator {
    /// Token used in remote filter expressions.
    pub fn odata_symbol(&self) -> &'static str {
        match self {
            Self::Equals => "eq",
            Self::NotEquals => "ne",
            Self::LessThan => "lt",
            Self::LessThanOrEqual => "le",
            Self::GreaterThan => "gt",
            Self::GreaterThanOrEqual => "ge",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Contains => "substringof",
            Self::Any => "any",
            Self::All => "all",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Equals => &["==", "Equals"],
            Self::NotEquals => &["!=", "~=", "NotEquals"],
            Self::LessThan => &["<", "LessThan"],
            Self::LessThanOrEqual => &["<=", "LessThanOrEqual"],
            Self::GreaterThan => &[">", "GreaterThan"],
            Self::GreaterThanOrEqual => &[">=", "GreaterThanOrEqual"],
            Self::Contains => &["contains"],
            Self::And => &["&&"],
            Self::Or => &["||"],
            Self::Not => &["~", "!"],
            Self::StartsWith | Self::EndsWith | Self::Any | Self::All => &[],
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    /// String-match operators render as boolean function calls remotely.
    pub fn is_string_match(&self) -> bool {
        matches!(self, Self::StartsWith | Self::EndsWith | Self::Contains)
    }

    /// Operators whose right-hand side is always a value, never a property.
    pub fn is_literal_only(&self) -> bool {
        self.is_string_match()
    }

    pub fn is_any_all(&self) -> bool {
        matches!(self, Self::Any | Self::All)
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Not)
    }
}

impl FromStr for Operator {
    type Err = CacheError;

    /// Case-insensitive lookup by symbol, name or alias.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OPERATOR_ALIASES
            .get(&s.trim().to_lowercase())
            .copied()
            .ok_or_else(|| CacheError::UnknownOperator(s.to_string()))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.odata_symbol())
    }
}
