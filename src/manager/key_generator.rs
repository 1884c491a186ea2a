use std::collections::HashSet;

use uuid::Uuid;

use crate::core::{CacheError, DataType, Result, Value};
use crate::entity::EntityKey;
use crate::metadata::{DataProperty, EntityType};

/// Source of temporary key values for entities whose real key the server
/// assigns. The generator also remembers which keys are temporary.
pub trait KeyGenerator: Send + Sync {
    /// A value for `property` that no real key of `entity_type` will use.
    fn generate_temp_value(&mut self, entity_type: &EntityType, property: &DataProperty) -> Result<Value>;

    fn add_temp_key(&mut self, key: EntityKey);

    fn remove_temp_key(&mut self, key: &EntityKey);

    fn is_temp_key(&self, key: &EntityKey) -> bool;

    fn temp_keys(&self) -> Vec<EntityKey>;
}

/// Negative integers for numeric keys, fresh GUIDs, and `K_<n>` strings.
#[derive(Debug, Default)]
pub struct DefaultKeyGenerator {
    next_id: i64,
    temp_keys: HashSet<EntityKey>,
}

impl DefaultKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn generate_temp_value(&mut self, entity_type: &EntityType, property: &DataProperty) -> Result<Value> {
        self.next_id += 1;
        match property.data_type {
            DataType::Guid => Ok(Value::Guid(Uuid::new_v4())),
            DataType::String => Ok(Value::String(format!("K_{}", self.next_id))),
            t if t.is_integer() || t.is_numeric() => Ok(Value::Integer(-self.next_id)),
            other => Err(CacheError::UnsupportedOperation(format!(
                "Cannot generate a temporary {} key for {}.{}",
                other,
                entity_type.name(),
                property.name
            ))),
        }
    }

    fn add_temp_key(&mut self, key: EntityKey) {
        self.temp_keys.insert(key);
    }

    fn remove_temp_key(&mut self, key: &EntityKey) {
        self.temp_keys.remove(key);
    }

    fn is_temp_key(&self, key: &EntityKey) -> bool {
        self.temp_keys.contains(key)
    }

    fn temp_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.temp_keys.iter().cloned().collect();
        keys.sort_by_cached_key(EntityKey::key_string);
        keys
    }
}
