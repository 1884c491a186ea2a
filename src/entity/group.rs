use im::{HashMap, Vector};

use super::{EntityId, EntityKey};
use crate::core::{CacheError, Result, Value};

/// Cache partition holding the attached entities of one concrete type.
///
/// Entities occupy slots; `index_map` maps a key's typed values to its slot
/// so lookups by key are O(1). Freed slots are reused on the next attach.
/// The containers are persistent, so cloning a group is cheap.
#[derive(Debug, Clone)]
pub struct EntityGroup {
    entity_type_name: String,
    slots: Vector<Option<EntityId>>,
    index_map: HashMap<Vec<Value>, usize>,
    free_slots: Vector<usize>,
}

impl EntityGroup {
    pub fn new(entity_type_name: impl Into<String>) -> Self {
        Self {
            entity_type_name: entity_type_name.into(),
            slots: Vector::new(),
            index_map: HashMap::new(),
            free_slots: Vector::new(),
        }
    }

    pub fn entity_type_name(&self) -> &str {
        &self.entity_type_name
    }

    pub fn attach(&mut self, key: &EntityKey, id: EntityId) -> Result<usize> {
        if self.index_map.contains_key(key.values()) {
            return Err(CacheError::DuplicateKey(key.key_string()));
        }

        let slot = match self.free_slots.pop_back() {
            Some(slot) => {
                self.slots.set(slot, Some(id));
                slot
            }
            None => {
                self.slots.push_back(Some(id));
                self.slots.len() - 1
            }
        };
        self.index_map.insert(key.values().to_vec(), slot);
        Ok(slot)
    }

    pub fn find(&self, key: &EntityKey) -> Option<EntityId> {
        self.index_map
            .get(key.values())
            .and_then(|slot| self.slots.get(*slot).copied().flatten())
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.index_map.contains_key(key.values())
    }

    pub fn detach(&mut self, key: &EntityKey) -> Option<EntityId> {
        let slot = self.index_map.remove(key.values())?;
        let id = self.slots.set(slot, None);
        self.free_slots.push_back(slot);
        id
    }

    /// Move an entity from `old_key` to `new_key` without touching its slot.
    pub fn rekey(&mut self, old_key: &EntityKey, new_key: &EntityKey) -> Result<bool> {
        if old_key.values() == new_key.values() {
            return Ok(self.index_map.contains_key(old_key.values()));
        }
        if self.index_map.contains_key(new_key.values()) {
            return Err(CacheError::DuplicateKey(new_key.key_string()));
        }
        match self.index_map.remove(old_key.values()) {
            Some(slot) => {
                self.index_map.insert(new_key.values().to_vec(), slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }

    pub fn len(&self) -> usize {
        self.index_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index_map.clear();
        self.free_slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> EntityKey {
        EntityKey::single("Northwind.Order", v)
    }

    #[test]
    fn test_attach_and_find() {
        let mut group = EntityGroup::new("Northwind.Order");
        group.attach(&key(1), EntityId(10)).unwrap();
        group.attach(&key(2), EntityId(11)).unwrap();
        assert_eq!(group.find(&key(2)), Some(EntityId(11)));
        assert_eq!(group.len(), 2);
        assert!(matches!(
            group.attach(&key(1), EntityId(12)),
            Err(CacheError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_detach_reuses_slot() {
        let mut group = EntityGroup::new("Northwind.Order");
        let first = group.attach(&key(1), EntityId(10)).unwrap();
        assert_eq!(group.detach(&key(1)), Some(EntityId(10)));
        assert_eq!(group.detach(&key(1)), None);
        let again = group.attach(&key(3), EntityId(13)).unwrap();
        assert_eq!(first, again);
        assert_eq!(group.entity_ids().collect::<Vec<_>>(), vec![EntityId(13)]);
    }

    #[test]
    fn test_rekey() {
        let mut group = EntityGroup::new("Northwind.Order");
        group.attach(&key(-1), EntityId(10)).unwrap();
        assert!(group.rekey(&key(-1), &key(500)).unwrap());
        assert_eq!(group.find(&key(-1)), None);
        assert_eq!(group.find(&key(500)), Some(EntityId(10)));
        assert!(!group.rekey(&key(-7), &key(501)).unwrap());
        let composite = EntityKey::new("T", vec![Value::Integer(1), Value::Integer(2)]);
        assert!(!group.contains_key(&composite));
    }

    #[test]
    fn test_keys_compare_typed_values() {
        let mut group = EntityGroup::new("Northwind.Region");
        group.attach(&EntityKey::single("Northwind.Region", "1"), EntityId(1)).unwrap();
        group.attach(&EntityKey::single("Northwind.Region", 1), EntityId(2)).unwrap();
        let joined = EntityKey::new("Northwind.Region", vec![Value::from("a:::b")]);
        let split = EntityKey::new("Northwind.Region", vec![Value::from("a"), Value::from("b")]);
        group.attach(&joined, EntityId(3)).unwrap();
        group.attach(&split, EntityId(4)).unwrap();
        assert_eq!(group.find(&EntityKey::single("Northwind.Region", "1")), Some(EntityId(1)));
        assert_eq!(group.find(&EntityKey::single("Northwind.Region", 1)), Some(EntityId(2)));
        assert_eq!(group.find(&split), Some(EntityId(4)));
        assert_eq!(group.len(), 4);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut group = EntityGroup::new("Northwind.Order");
        group.attach(&key(1), EntityId(10)).unwrap();
        let saved = group.clone();
        group.attach(&key(2), EntityId(11)).unwrap();
        group.detach(&key(1));
        assert_eq!(saved.find(&key(1)), Some(EntityId(10)));
        assert_eq!(saved.find(&key(2)), None);
        assert_eq!(group.find(&key(1)), None);
    }
}
