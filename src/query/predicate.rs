// ============================================================================
// Predicates
// ============================================================================
//
// A predicate is an immutable tree shared through `Arc`. Combinators return
// new trees that reuse the unchanged children. Every node can be rendered as
// a remote `$filter` fragment or compiled into a local closure; both forms
// validate property paths against the target type first.
//
// Leaf binding (type checks, literal coercion, operand interpretation) is
// computed once per leaf and type and cached.
//
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use im::Vector;
use uuid::Uuid;

use super::fn_node::{is_property_path, FnNode};
use super::Operator;
use crate::core::{CacheError, DataType, Result, Value};
use crate::entity::Entity;
use crate::evaluator::plugins::{ComparisonEvaluator, LogicalEvaluator};
use crate::evaluator::EvaluationContext;
use crate::metadata::MetadataStore;

/// Compiled local form of a predicate.
pub type LocalPredicate = Arc<dyn Fn(&Entity, &EvaluationContext<'_>) -> bool + Send + Sync>;

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Always a value, even when it looks like a property name.
    Literal(Value),
    /// Always an expression (property path or function call).
    Expression(String),
    /// A bare string: treated as a property path when it names one on the
    /// target type and the operator accepts expressions, otherwise a value.
    Inferred(String),
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn expression(source: impl Into<String>) -> Self {
        Self::Expression(source.into())
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Self::Inferred(s.to_string())
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Self::Inferred(s)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

macro_rules! literal_operand {
    ($($t:ty),*) => {
        $(impl From<$t> for Operand {
            fn from(v: $t) -> Self {
                Self::Literal(Value::from(v))
            }
        })*
    };
}

literal_operand!(i64, i32, f64, bool, DateTime<Utc>, Uuid, chrono::Duration);

#[derive(Debug, Clone)]
struct BoundLeaf {
    type_name: String,
    right: FnNode,
}

#[derive(Debug)]
struct Leaf {
    left: FnNode,
    operator: Operator,
    right: Operand,
    bound: OnceLock<BoundLeaf>,
}

#[derive(Debug)]
enum PredicateNode {
    Leaf(Leaf),
    And(Vector<Predicate>),
    Or(Vector<Predicate>),
    Not(Predicate),
    Lambda {
        operator: Operator,
        path: String,
        predicate: Predicate,
    },
    OData(String),
}

/// Immutable filter expression.
///
/// ```
/// use entitycache::query::Predicate;
///
/// let p = Predicate::new("Freight", "gt", 100).unwrap()
///     .and(&Predicate::new("ShipCity", "startswith", "B").unwrap());
/// assert_eq!(p.children().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Predicate {
    node: Arc<PredicateNode>,
}

impl Predicate {
    fn from_node(node: PredicateNode) -> Self {
        Self { node: Arc::new(node) }
    }

    /// Comparison or string-match leaf. `operator` accepts symbols, names
    /// and aliases (`gt`, `>`, `GreaterThan`).
    pub fn new(left: &str, operator: &str, right: impl Into<Operand>) -> Result<Self> {
        let operator: Operator = operator.parse()?;
        Self::with_operator(left, operator, right)
    }

    pub fn with_operator(left: &str, operator: Operator, right: impl Into<Operand>) -> Result<Self> {
        if !(operator.is_comparison() || operator.is_string_match()) {
            return Err(CacheError::InvalidExpression(format!(
                "'{}' cannot be used in a comparison",
                operator
            )));
        }
        let left = FnNode::parse(left)?;
        let right = right.into();
        if let Operand::Expression(source) = &right {
            FnNode::parse(source)?;
        }
        Ok(Self::from_node(PredicateNode::Leaf(Leaf {
            left,
            operator,
            right,
            bound: OnceLock::new(),
        })))
    }

    /// True if any element of the collection at `path` matches.
    pub fn any(path: impl Into<String>, predicate: Predicate) -> Self {
        Self::from_node(PredicateNode::Lambda {
            operator: Operator::Any,
            path: path.into(),
            predicate,
        })
    }

    /// True if every element of the collection at `path` matches.
    pub fn all(path: impl Into<String>, predicate: Predicate) -> Self {
        Self::from_node(PredicateNode::Lambda {
            operator: Operator::All,
            path: path.into(),
            predicate,
        })
    }

    /// A raw filter fragment sent as-is. Cannot be evaluated locally.
    pub fn odata(text: impl Into<String>) -> Self {
        Self::from_node(PredicateNode::OData(text.into()))
    }

    pub fn and(&self, other: &Predicate) -> Self {
        match self.node.as_ref() {
            PredicateNode::And(children) => {
                let mut children = children.clone();
                children.push_back(other.clone());
                Self::from_node(PredicateNode::And(children))
            }
            _ => Self::from_node(PredicateNode::And(Vector::from(vec![self.clone(), other.clone()]))),
        }
    }

    pub fn or(&self, other: &Predicate) -> Self {
        match self.node.as_ref() {
            PredicateNode::Or(children) => {
                let mut children = children.clone();
                children.push_back(other.clone());
                Self::from_node(PredicateNode::Or(children))
            }
            _ => Self::from_node(PredicateNode::Or(Vector::from(vec![self.clone(), other.clone()]))),
        }
    }

    pub fn not(&self) -> Self {
        Self::from_node(PredicateNode::Not(self.clone()))
    }

    /// AND of all predicates; `None` when empty, the predicate itself when single.
    pub fn and_all(predicates: impl IntoIterator<Item = Predicate>) -> Option<Self> {
        Self::combine(predicates, PredicateNode::And)
    }

    pub fn or_all(predicates: impl IntoIterator<Item = Predicate>) -> Option<Self> {
        Self::combine(predicates, PredicateNode::Or)
    }

    fn combine(
        predicates: impl IntoIterator<Item = Predicate>,
        node: fn(Vector<Predicate>) -> PredicateNode,
    ) -> Option<Self> {
        let children: Vector<Predicate> = predicates.into_iter().collect();
        match children.len() {
            0 => None,
            1 => children.front().cloned(),
            _ => Some(Self::from_node(node(children))),
        }
    }

    /// Operator at the root of this tree. `None` for raw fragments.
    pub fn operator(&self) -> Option<Operator> {
        match self.node.as_ref() {
            PredicateNode::Leaf(leaf) => Some(leaf.operator),
            PredicateNode::And(_) => Some(Operator::And),
            PredicateNode::Or(_) => Some(Operator::Or),
            PredicateNode::Not(_) => Some(Operator::Not),
            PredicateNode::Lambda { operator, .. } => Some(*operator),
            PredicateNode::OData(_) => None,
        }
    }

    pub fn children(&self) -> Vec<Predicate> {
        match self.node.as_ref() {
            PredicateNode::And(children) | PredicateNode::Or(children) => children.iter().cloned().collect(),
            PredicateNode::Not(child) => vec![child.clone()],
            PredicateNode::Lambda { predicate, .. } => vec![predicate.clone()],
            PredicateNode::Leaf(_) | PredicateNode::OData(_) => Vec::new(),
        }
    }

    /// True when both handles point at the same tree node.
    pub fn ptr_eq(&self, other: &Predicate) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Check every property path against `type_name`. The result is cached
    /// per leaf, so repeated validation is cheap.
    pub fn validate(&self, store: &MetadataStore, type_name: &str) -> Result<()> {
        match self.node.as_ref() {
            PredicateNode::Leaf(leaf) => leaf.bind(store, Some(type_name)).map(|_| ()),
            PredicateNode::And(children) | PredicateNode::Or(children) => {
                children.iter().try_for_each(|c| c.validate(store, type_name))
            }
            PredicateNode::Not(child) => child.validate(store, type_name),
            PredicateNode::Lambda { path, predicate, .. } => {
                let target = lambda_target(store, type_name, path)?;
                predicate.validate(store, &target)
            }
            PredicateNode::OData(_) => Ok(()),
        }
    }

    /// Render as a remote filter fragment. With no type the paths are
    /// rendered unchecked and bare strings are taken as values.
    pub fn to_odata(&self, store: &MetadataStore, type_name: Option<&str>) -> Result<String> {
        if let Some(t) = type_name {
            self.validate(store, t)?;
        }
        self.render(store, type_name, None, 0)
    }

    fn render(&self, store: &MetadataStore, type_name: Option<&str>, prefix: Option<&str>, depth: usize) -> Result<String> {
        match self.node.as_ref() {
            PredicateNode::Leaf(leaf) => {
                let bound = leaf.bind(store, type_name)?;
                let left = leaf.left.to_odata(store, type_name, prefix)?;
                let right = bound.right.to_odata(store, type_name, prefix)?;
                Ok(match leaf.operator {
                    Operator::StartsWith | Operator::EndsWith => {
                        format!("{}({},{}) eq true", leaf.operator, left, right)
                    }
                    Operator::Contains => format!("substringof({},{}) eq true", right, left),
                    op => format!("{} {} {}", left, op, right),
                })
            }
            PredicateNode::And(children) | PredicateNode::Or(children) => {
                let joiner = match self.node.as_ref() {
                    PredicateNode::And(_) => " and ",
                    _ => " or ",
                };
                let parts = children
                    .iter()
                    .map(|c| c.render(store, type_name, prefix, depth).map(|s| format!("({})", s)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(parts.join(joiner))
            }
            PredicateNode::Not(child) => Ok(format!("not ({})", child.render(store, type_name, prefix, depth)?)),
            PredicateNode::Lambda { operator, path, predicate } => {
                let target = match type_name {
                    Some(t) => Some(lambda_target(store, t, path)?),
                    None => None,
                };
                let variable = format!("x{}", depth + 1);
                let inner = predicate.render(store, target.as_deref(), Some(&variable), depth + 1)?;
                let server_path = store.naming_convention().path_to_server(path, "/");
                let server_path = match prefix {
                    Some(p) => format!("{}/{}", p, server_path),
                    None => server_path,
                };
                Ok(format!("{}/{}({}: {})", server_path, operator, variable, inner))
            }
            PredicateNode::OData(text) => Ok(text.clone()),
        }
    }

    /// Compile into a closure over one candidate entity.
    pub fn to_local_fn(&self, store: &MetadataStore, type_name: &str) -> Result<LocalPredicate> {
        self.validate(store, type_name)?;
        self.compile(store, type_name)
    }

    fn compile(&self, store: &MetadataStore, type_name: &str) -> Result<LocalPredicate> {
        match self.node.as_ref() {
            PredicateNode::Leaf(leaf) => {
                let bound = leaf.bind(store, Some(type_name))?;
                let left = leaf.left.to_local_fn();
                let right = bound.right.to_local_fn();
                let op = leaf.operator;
                Ok(Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    ComparisonEvaluator.compare(&left(entity, ctx), &right(entity, ctx), op, ctx.options())
                }))
            }
            PredicateNode::And(children) | PredicateNode::Or(children) => {
                let op = self.operator().unwrap_or(Operator::And);
                let compiled = children
                    .iter()
                    .map(|c| c.compile(store, type_name))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    LogicalEvaluator.evaluate(op, &compiled, entity, ctx)
                }))
            }
            PredicateNode::Not(child) => {
                let compiled = vec![child.compile(store, type_name)?];
                Ok(Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    LogicalEvaluator.evaluate(Operator::Not, &compiled, entity, ctx)
                }))
            }
            PredicateNode::Lambda { operator, path, predicate } => {
                let target = lambda_target(store, type_name, path)?;
                let inner = predicate.compile(store, &target)?;
                let parts: Vec<String> = path.split(['.', '/']).map(|p| p.trim().to_string()).collect();
                let is_any = *operator == Operator::Any;
                Ok(Arc::new(move |entity: &Entity, ctx: &EvaluationContext<'_>| {
                    let items = ctx.related_collection(entity, &parts);
                    if is_any {
                        items.into_iter().any(|item| inner(item, ctx))
                    } else {
                        items.into_iter().all(|item| inner(item, ctx))
                    }
                }))
            }
            PredicateNode::OData(text) => Err(CacheError::UnsupportedOperation(format!(
                "Raw filter '{}' cannot be evaluated locally",
                text
            ))),
        }
    }
}

impl Leaf {
    fn bind(&self, store: &MetadataStore, type_name: Option<&str>) -> Result<BoundLeaf> {
        if let (Some(t), Some(bound)) = (type_name, self.bound.get())
            && bound.type_name == t
        {
            return Ok(bound.clone());
        }

        if let Some(t) = type_name {
            self.left.validate(store, t)?;
        }
        let left_type = self.left.data_type(store, type_name);
        let right = match &self.right {
            Operand::Literal(value) => literal_node(value.clone(), left_type)?,
            Operand::Expression(source) => {
                let node = FnNode::parse(source)?;
                if let Some(t) = type_name {
                    node.validate(store, t)?;
                }
                node
            }
            Operand::Inferred(text) => {
                let names_property = !self.operator.is_literal_only()
                    && is_property_path(text)
                    && type_name.is_some_and(|t| store.resolve_property_path(t, text.trim()).is_ok());
                if names_property {
                    FnNode::property(text.trim())
                } else {
                    literal_node(Value::String(text.clone()), left_type)?
                }
            }
        };

        let bound = BoundLeaf {
            type_name: type_name.unwrap_or_default().to_string(),
            right,
        };
        if type_name.is_some() && self.bound.get().is_none() {
            let _ = self.bound.set(bound.clone());
        }
        Ok(bound)
    }
}

fn literal_node(value: Value, left_type: DataType) -> Result<FnNode> {
    if left_type == DataType::Undefined {
        return Ok(FnNode::literal(value));
    }
    Ok(FnNode::Literal {
        value: left_type.coerce(value)?,
        data_type: left_type,
    })
}

/// Element type of the collection navigation at `path`.
fn lambda_target(store: &MetadataStore, type_name: &str, path: &str) -> Result<String> {
    let resolved = store.resolve_property_path(type_name, path)?;
    match resolved.last_navigation() {
        Some(nav) if !nav.is_scalar => Ok(nav.entity_type_name.clone()),
        _ => Err(CacheError::InvalidExpression(format!(
            "'{}' is not a collection navigation on '{}'",
            path, type_name
        ))),
    }
}

impl fmt::Display for Predicate {
    /// Unchecked rendering for diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.as_ref() {
            PredicateNode::Leaf(leaf) => {
                let right = match &leaf.right {
                    Operand::Literal(v) => FnNode::literal(v.clone()).to_string(),
                    Operand::Expression(s) | Operand::Inferred(s) => s.clone(),
                };
                write!(f, "{} {} {}", leaf.left, leaf.operator, right)
            }
            PredicateNode::And(children) | PredicateNode::Or(children) => {
                let joiner = if matches!(self.node.as_ref(), PredicateNode::And(_)) { " and " } else { " or " };
                let parts: Vec<String> = children.iter().map(|c| format!("({})", c)).collect();
                write!(f, "{}", parts.join(joiner))
            }
            PredicateNode::Not(child) => write!(f, "not ({})", child),
            PredicateNode::Lambda { operator, path, predicate } => {
                write!(f, "{}/{}({})", path, operator, predicate)
            }
            PredicateNode::OData(text) => write!(f, "{}", text),
        }
    }
}
