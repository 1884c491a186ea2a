pub mod plugins;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::Value;
use crate::entity::{Entity, EntityId};

/// Read access to entities reachable through navigation slots.
pub trait EntityLookup {
    fn entity(&self, id: EntityId) -> Option<&Entity>;
}

impl EntityLookup for HashMap<EntityId, Entity> {
    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.get(&id)
    }
}

impl EntityLookup for im::HashMap<EntityId, Entity> {
    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.get(&id)
    }
}

/// Lookup for evaluating a lone detached entity: navigation yields nothing.
pub struct NoLookup;

impl EntityLookup for NoLookup {
    fn entity(&self, _id: EntityId) -> Option<&Entity> {
        None
    }
}

/// String comparison policy for local query evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonOptions {
    pub is_case_sensitive: bool,
    /// SQL-92 string comparison ignores surrounding whitespace.
    pub uses_sql92_semantics: bool,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            is_case_sensitive: false,
            uses_sql92_semantics: true,
        }
    }
}

impl ComparisonOptions {
    pub fn case_sensitive_non_sql() -> Self {
        Self {
            is_case_sensitive: true,
            uses_sql92_semantics: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match (self.is_case_sensitive, self.uses_sql92_semantics) {
            (false, true) => "caseInsensitiveSQL",
            (false, false) => "caseInsensitiveNonSQL",
            (true, true) => "caseSensitiveSQL",
            (true, false) => "caseSensitiveNonSQL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let options = |is_case_sensitive, uses_sql92_semantics| Self {
            is_case_sensitive,
            uses_sql92_semantics,
        };
        match name {
            "caseInsensitiveSQL" => Some(options(false, true)),
            "caseInsensitiveNonSQL" => Some(options(false, false)),
            "caseSensitiveSQL" => Some(options(true, true)),
            "caseSensitiveNonSQL" => Some(options(true, false)),
            _ => None,
        }
    }

    /// Normalize a string operand according to the policy.
    pub fn normalize(&self, s: &str) -> String {
        let s = if self.uses_sql92_semantics { s.trim() } else { s };
        if self.is_case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    }
}

/// Per-call state for local evaluation. Nothing is stored on the predicate
/// itself, so one compiled predicate can be evaluated from several places.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    lookup: &'a dyn EntityLookup,
    options: &'a ComparisonOptions,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(lookup: &'a dyn EntityLookup, options: &'a ComparisonOptions) -> Self {
        Self { lookup, options }
    }

    pub fn options(&self) -> &ComparisonOptions {
        self.options
    }

    pub fn lookup(&self) -> &'a dyn EntityLookup {
        self.lookup
    }

    /// Value at `path` on `entity`. Missing links and properties read as null.
    pub fn property_value(&self, entity: &Entity, path: &[String]) -> Value {
        let Some((last, parents)) = path.split_last() else {
            return Value::Null;
        };
        let mut current = entity;
        let mut complex: Option<Value> = None;
        for name in parents {
            if let Some(Value::Complex(fields)) = &complex {
                complex = Some(fields.get(name).cloned().unwrap_or(Value::Null));
                continue;
            }
            match current.navigation(name) {
                Some(_) => match current.related(name).and_then(|id| self.lookup.entity(id)) {
                    Some(next) => current = next,
                    None => return Value::Null,
                },
                None => match current.get(name) {
                    value @ Value::Complex(_) => complex = Some(value.clone()),
                    _ => return Value::Null,
                },
            }
        }
        match complex {
            Some(Value::Complex(fields)) => fields.get(last).cloned().unwrap_or(Value::Null),
            Some(_) => Value::Null,
            None => current.get(last).clone(),
        }
    }

    /// Entity at the end of a scalar navigation path.
    pub fn related_entity<'e>(&'e self, entity: &'e Entity, path: &[String]) -> Option<&'e Entity> {
        let mut current = entity;
        for name in path {
            let id = current.related(name)?;
            current = self.lookup.entity(id)?;
        }
        Some(current)
    }

    /// Entities in the collection at the end of `path`.
    pub fn related_collection<'e>(&'e self, entity: &'e Entity, path: &[String]) -> Vec<&'e Entity> {
        let Some((last, parents)) = path.split_last() else {
            return Vec::new();
        };
        let Some(owner) = self.related_entity(entity, parents) else {
            return Vec::new();
        };
        owner
            .related_collection(last)
            .iter()
            .filter_map(|id| self.lookup.entity(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NavigationValue;

    #[test]
    fn test_comparison_option_names() {
        assert_eq!(ComparisonOptions::default().name(), "caseInsensitiveSQL");
        assert_eq!(
            ComparisonOptions::from_name("caseSensitiveNonSQL"),
            Some(ComparisonOptions::case_sensitive_non_sql())
        );
        assert_eq!(ComparisonOptions::default().normalize("  Berlin "), "berlin");
    }

    #[test]
    fn test_property_value_follows_links() {
        let customer = Entity::new("Customer").with_value("CompanyName", "Alfreds");
        let mut order = Entity::new("Order").with_value("Freight", 12.5);
        order
            .navigation_mut()
            .insert("Customer".into(), NavigationValue::Scalar(Some(customer.id())));
        let mut arena = HashMap::new();
        arena.insert(customer.id(), customer);

        let options = ComparisonOptions::default();
        let ctx = EvaluationContext::new(&arena, &options);
        let path = vec!["Customer".to_string(), "CompanyName".to_string()];
        assert_eq!(ctx.property_value(&order, &path), Value::from("Alfreds"));
        assert_eq!(ctx.property_value(&order, &["Freight".to_string()]), Value::Double(12.5));

        let detached = EvaluationContext::new(&NoLookup, &options);
        assert_eq!(detached.property_value(&order, &path), Value::Null);
    }
}
