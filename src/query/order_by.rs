// ============================================================================
// Ordering
// ============================================================================
//
// An order-by clause is an ordered list of sort keys. Appending keys yields a
// new clause sharing the old key vector. Locally, keys are evaluated once per
// entity and the entities are stable-sorted; the first key that differs
// decides.
//
// Null handling follows common server behavior: nulls compare lowest, so
// they come first ascending and last descending.
//
// ============================================================================

use std::cmp::Ordering;

use im::Vector;

use super::fn_node::LocalFn;
use super::FnNode;
use crate::core::{CacheError, Result, Value};
use crate::entity::Entity;
use crate::evaluator::{ComparisonOptions, EvaluationContext};
use crate::metadata::MetadataStore;

/// Placement of null values in a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullOrdering {
    NullsFirst,
    NullsLast,
}

impl NullOrdering {
    pub fn default_for_direction(descending: bool) -> Self {
        if descending {
            Self::NullsLast
        } else {
            Self::NullsFirst
        }
    }
}

/// One property path in an order-by clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

impl SortKey {
    pub fn new(path: impl Into<String>, descending: bool) -> Self {
        Self {
            path: path.into(),
            descending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderByClause {
    keys: Vector<SortKey>,
}

impl OrderByClause {
    /// Parse `"ShipCity desc, OrderID"`. A trailing `asc`/`desc` on a key
    /// overrides `descending`.
    pub fn parse(text: &str, descending: bool) -> Result<Self> {
        let mut keys = Vector::new();
        for part in text.split(',') {
            let tokens: Vec<&str> = part.split_whitespace().collect();
            let key = match tokens.as_slice() {
                [path] => SortKey::new(*path, descending),
                [path, dir] if dir.eq_ignore_ascii_case("desc") => SortKey::new(*path, true),
                [path, dir] if dir.eq_ignore_ascii_case("asc") => SortKey::new(*path, false),
                _ => {
                    return Err(CacheError::InvalidExpression(format!(
                        "Bad order-by segment '{}'",
                        part.trim()
                    )));
                }
            };
            keys.push_back(key);
        }
        Ok(Self { keys })
    }

    pub fn from_keys(keys: impl IntoIterator<Item = SortKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &SortKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// New clause with `other`'s keys after this clause's keys.
    pub fn append(&self, other: &OrderByClause) -> Self {
        let mut keys = self.keys.clone();
        keys.append(other.keys.clone());
        Self { keys }
    }

    /// Every key must end in a data property.
    pub fn validate(&self, store: &MetadataStore, type_name: &str) -> Result<()> {
        for key in &self.keys {
            let path = store.resolve_property_path(type_name, &key.path)?;
            if path.is_navigation() {
                return Err(CacheError::InvalidExpression(format!(
                    "Cannot order by navigation property '{}'",
                    key.path
                )));
            }
        }
        Ok(())
    }

    pub fn to_odata(&self, store: &MetadataStore, type_name: Option<&str>) -> Result<String> {
        if let Some(t) = type_name {
            self.validate(store, t)?;
        }
        let convention = store.naming_convention();
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|k| {
                let path = convention.path_to_server(&k.path, "/");
                if k.descending {
                    format!("{} desc", path)
                } else {
                    path
                }
            })
            .collect();
        Ok(parts.join(","))
    }

    pub fn compile(&self, store: &MetadataStore, type_name: &str) -> Result<Vec<CompiledSortKey>> {
        self.validate(store, type_name)?;
        Ok(self
            .keys
            .iter()
            .map(|k| CompiledSortKey {
                value: FnNode::property(k.path.clone()).to_local_fn(),
                descending: k.descending,
                null_ordering: NullOrdering::default_for_direction(k.descending),
            })
            .collect())
    }
}

/// A sort key ready for local evaluation.
#[derive(Clone)]
pub struct CompiledSortKey {
    value: LocalFn,
    descending: bool,
    null_ordering: NullOrdering,
}

/// Stable multi-key sort over entities.
pub struct SortExecutor;

impl SortExecutor {
    pub fn sort<'e>(
        items: Vec<&'e Entity>,
        keys: &[CompiledSortKey],
        ctx: &EvaluationContext<'_>,
    ) -> Vec<&'e Entity> {
        if keys.is_empty() || items.len() < 2 {
            return items;
        }

        let mut keyed: Vec<(&Entity, Vec<Value>)> = items
            .into_iter()
            .map(|entity| {
                let values = keys.iter().map(|k| (k.value)(entity, ctx)).collect();
                (entity, values)
            })
            .collect();

        keyed.sort_by(|(_, a), (_, b)| {
            for (i, key) in keys.iter().enumerate() {
                let ordering = Self::compare_values(&a[i], &b[i], key, ctx.options());
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        keyed.into_iter().map(|(entity, _)| entity).collect()
    }

    fn compare_values(a: &Value, b: &Value, key: &CompiledSortKey, options: &ComparisonOptions) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => {
                return match key.null_ordering {
                    NullOrdering::NullsFirst => Ordering::Less,
                    NullOrdering::NullsLast => Ordering::Greater,
                };
            }
            (false, true) => {
                return match key.null_ordering {
                    NullOrdering::NullsFirst => Ordering::Greater,
                    NullOrdering::NullsLast => Ordering::Less,
                };
            }
            (false, false) => {}
        }

        let ordering = match (a, b) {
            (Value::String(x), Value::String(y)) if !options.is_case_sensitive => {
                x.to_lowercase().cmp(&y.to_lowercase())
            }
            _ => a.compare(b).unwrap_or(Ordering::Equal),
        };
        if key.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::evaluator::NoLookup;
    use crate::metadata::{DataProperty, StructuralTypeDef};

    fn store() -> MetadataStore {
        let mut store = MetadataStore::new();
        store
            .register_type(
                StructuralTypeDef::entity("Order", "Northwind")
                    .data_property(DataProperty::new("OrderID", DataType::Int32).key())
                    .data_property(DataProperty::new("ShipCity", DataType::String)),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_parse_and_render() {
        let clause = OrderByClause::parse("ShipCity desc, OrderID", false).unwrap();
        assert_eq!(clause.len(), 2);
        assert_eq!(clause.to_odata(&store(), Some("Order")).unwrap(), "ShipCity desc,OrderID");
        let desc = OrderByClause::parse("OrderID", true).unwrap();
        assert_eq!(clause.append(&desc).to_odata(&store(), None).unwrap(), "ShipCity desc,OrderID,OrderID desc");
        assert!(OrderByClause::parse("ShipCity sideways", false).is_err());
    }

    #[test]
    fn test_multi_key_stable_sort() {
        let rows = [
            Entity::new("Order").with_value("OrderID", 1).with_value("ShipCity", "berlin"),
            Entity::new("Order").with_value("OrderID", 2).with_value("ShipCity", Value::Null),
            Entity::new("Order").with_value("OrderID", 3).with_value("ShipCity", "Aachen"),
            Entity::new("Order").with_value("OrderID", 4).with_value("ShipCity", "Berlin"),
        ];
        let clause = OrderByClause::parse("ShipCity desc", false).unwrap();
        let keys = clause.compile(&store(), "Order").unwrap();
        let options = ComparisonOptions::default();
        let ctx = EvaluationContext::new(&NoLookup, &options);
        let sorted = SortExecutor::sort(rows.iter().collect(), &keys, &ctx);
        let ids: Vec<i64> = sorted.iter().filter_map(|e| e.get("OrderID").as_i64()).collect();
        assert_eq!(ids, vec![1, 4, 3, 2]);
    }
}
