use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::{EntityAspect, EntityState};
use crate::core::Value;

/// Global entity id counter
static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn next() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity_{}", self.0)
    }
}

/// Contents of a navigation slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationValue {
    Scalar(Option<EntityId>),
    Collection(Vec<EntityId>),
}

impl NavigationValue {
    pub fn contains(&self, id: EntityId) -> bool {
        match self {
            Self::Scalar(slot) => *slot == Some(id),
            Self::Collection(ids) => ids.contains(&id),
        }
    }

    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            Self::Scalar(slot) => slot.iter().copied().collect(),
            Self::Collection(ids) => ids.clone(),
        }
    }
}

/// A data instance: property values, navigation slots and its aspect.
///
/// A freshly created entity is detached and can be edited freely. Once a
/// manager owns it, writes go through the manager so they are tracked.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    entity_type: String,
    values: BTreeMap<String, Value>,
    navigation: BTreeMap<String, NavigationValue>,
    pub(crate) aspect: EntityAspect,
}

impl Entity {
    /// Generic record constructor for the given qualified type name.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            id: EntityId::next(),
            entity_type: entity_type.into(),
            values: BTreeMap::new(),
            navigation: BTreeMap::new(),
            aspect: EntityAspect::default(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn entity_type_name(&self) -> &str {
        &self.entity_type
    }

    pub fn aspect(&self) -> &EntityAspect {
        &self.aspect
    }

    pub fn state(&self) -> EntityState {
        self.aspect.state
    }

    /// Value of a data property; `Null` when unset.
    pub fn get(&self, name: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.values.get(name).unwrap_or(NULL)
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Set a value on a detached entity. Returns the previous value.
    ///
    /// Attached entities must be edited through `EntityManager::set_value`.
    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn navigation(&self, name: &str) -> Option<&NavigationValue> {
        self.navigation.get(name)
    }

    /// Target of a scalar navigation property.
    pub fn related(&self, name: &str) -> Option<EntityId> {
        match self.navigation.get(name) {
            Some(NavigationValue::Scalar(slot)) => *slot,
            _ => None,
        }
    }

    /// Members of a collection navigation property.
    pub fn related_collection(&self, name: &str) -> &[EntityId] {
        match self.navigation.get(name) {
            Some(NavigationValue::Collection(ids)) => ids,
            _ => &[],
        }
    }

    pub(crate) fn write_value(&mut self, name: &str, value: Value) -> Value {
        self.values
            .insert(name.to_string(), value)
            .unwrap_or(Value::Null)
    }

    pub(crate) fn navigation_mut(&mut self) -> &mut BTreeMap<String, NavigationValue> {
        &mut self.navigation
    }

    /// Set a scalar slot. Returns false when it already held `target`.
    pub(crate) fn set_scalar_slot(&mut self, name: &str, target: Option<EntityId>) -> bool {
        match self.navigation.get_mut(name) {
            Some(NavigationValue::Scalar(slot)) if *slot == target => false,
            Some(NavigationValue::Scalar(slot)) => {
                *slot = target;
                true
            }
            _ => {
                self.navigation
                    .insert(name.to_string(), NavigationValue::Scalar(target));
                true
            }
        }
    }

    /// Append to a collection slot. Returns false when `target` was already present.
    pub(crate) fn add_to_collection(&mut self, name: &str, target: EntityId) -> bool {
        let slot = self
            .navigation
            .entry(name.to_string())
            .or_insert_with(|| NavigationValue::Collection(Vec::new()));
        match slot {
            NavigationValue::Collection(ids) if ids.contains(&target) => false,
            NavigationValue::Collection(ids) => {
                ids.push(target);
                true
            }
            NavigationValue::Scalar(_) => {
                *slot = NavigationValue::Collection(vec![target]);
                true
            }
        }
    }

    pub(crate) fn remove_from_collection(&mut self, name: &str, target: EntityId) -> bool {
        match self.navigation.get_mut(name) {
            Some(NavigationValue::Collection(ids)) => {
                let before = ids.len();
                ids.retain(|id| *id != target);
                ids.len() != before
            }
            _ => false,
        }
    }

    /// Drop every navigation reference to `target`.
    pub(crate) fn unlink(&mut self, target: EntityId) {
        for slot in self.navigation.values_mut() {
            match slot {
                NavigationValue::Scalar(s) if *s == Some(target) => *s = None,
                NavigationValue::Collection(ids) => ids.retain(|id| *id != target),
                _ => {}
            }
        }
    }

    pub(crate) fn clear_navigation(&mut self) {
        self.navigation.clear();
    }
}
