use std::collections::BTreeMap;

use crate::core::Value;
use crate::entity::EntityId;

/// Rows returned by a query, remote or local.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub results: Vec<QueryRow>,
    /// Count of matching rows before skip/take, when an inline count was requested.
    pub inline_count: Option<usize>,
}

impl QueryResult {
    pub fn new(results: Vec<QueryRow>, inline_count: Option<usize>) -> Self {
        Self {
            results,
            inline_count,
        }
    }

    /// Ids of the cached entities among the rows; projections are skipped.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.results
            .iter()
            .filter_map(|row| match row {
                QueryRow::Entity(id) => Some(*id),
                QueryRow::Projection(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRow {
    /// A cache-tracked entity.
    Entity(EntityId),
    /// A plain record built from a `select` clause. Not tracked by the cache.
    Projection(BTreeMap<String, ProjectionValue>),
}

impl QueryRow {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::Projection(_) => None,
        }
    }

    pub fn as_projection(&self) -> Option<&BTreeMap<String, ProjectionValue>> {
        match self {
            Self::Projection(fields) => Some(fields),
            Self::Entity(_) => None,
        }
    }
}

/// A projected field: a value, or the entity (entities) at a navigation path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionValue {
    Value(Value),
    Entity(Option<EntityId>),
    Entities(Vec<EntityId>),
}

impl ProjectionValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Field name a selected path is stored under: `Customer.CompanyName`
/// becomes `Customer_CompanyName`.
pub fn projection_field_name(path: &str) -> String {
    path.trim().replace(['.', '/'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_skip_projections() {
        let result = QueryResult::new(
            vec![
                QueryRow::Entity(EntityId(1)),
                QueryRow::Projection(BTreeMap::new()),
                QueryRow::Entity(EntityId(2)),
            ],
            None,
        );
        assert_eq!(result.entity_ids(), vec![EntityId(1), EntityId(2)]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_projection_field_name() {
        assert_eq!(projection_field_name("Customer.CompanyName"), "Customer_CompanyName");
        assert_eq!(projection_field_name("Freight"), "Freight");
    }
}
