use tracing::debug;

use super::{EntityManager, LoadingScope};
use crate::core::{Result, Value};
use crate::entity::EntityId;
use crate::transport::KeyMapping;

impl EntityManager {
    /// Replace temporary keys with the real ones the server assigned.
    ///
    /// For each mapping the owning entity is re-indexed and every cached
    /// foreign key that still holds the temporary value is rewritten,
    /// original values included. Runs before the saved nodes are merged.
    pub(crate) fn fixup_keys(&mut self, mappings: &[KeyMapping], _scope: &LoadingScope) -> Result<()> {
        for mapping in mappings {
            self.fixup_key(mapping)?;
        }
        Ok(())
    }

    fn fixup_key(&mut self, mapping: &KeyMapping) -> Result<()> {
        let store = self.metadata_arc();
        let mapped_type = store.entity_type(&mapping.entity_type_name)?;
        let root = mapped_type.root_type_name().to_string();

        // locate the entity and which key part holds the temporary value
        let mut found: Option<(EntityId, usize, Value, Value)> = None;
        for (index, property) in mapped_type.key_properties().into_iter().enumerate() {
            let Ok(temp) = property.data_type.coerce(mapping.temp_value.clone()) else {
                continue;
            };
            let candidate = self.entities.values().find(|e| {
                e.aspect.has_temp_key
                    && *e.get(&property.name) == temp
                    && store.is_subtype_of(e.entity_type_name(), &root)
            });
            if let Some(entity) = candidate {
                let real = property.data_type.coerce(mapping.real_value.clone())?;
                found = Some((entity.id(), index, temp, real));
                break;
            }
        }
        let Some((id, index, temp, real)) = found else {
            log::warn!(
                "No cached {} holds temporary key {}",
                mapping.entity_type_name,
                mapping.temp_value
            );
            return Ok(());
        };

        let entity_type = self.entity_type_of(id)?;
        let key_property = entity_type.key_properties()[index].name.clone();
        let old_key = self.key_of(id)?;
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.write_value(&key_property, real.clone());
            entity.aspect.has_temp_key = false;
        }
        let new_key = self.key_of(id)?;
        if let Some(group) = self.groups.get_mut(entity_type.name()) {
            group.rekey(&old_key, &new_key)?;
        }
        self.unattached.rekey(&old_key, &new_key);
        self.key_generator.remove_temp_key(&old_key);
        debug!(entity = %id, from = %old_key, to = %new_key, "Fixed up temporary key");

        // (owning type, foreign key property) pairs that point into this hierarchy
        let mut foreign_keys: Vec<(String, String)> = Vec::new();
        for owner in store.entity_types() {
            for nav in owner.navigation_properties() {
                let targets_family = store
                    .find_entity_type(&nav.entity_type_name)
                    .is_some_and(|t| t.root_type_name() == root);
                if nav.is_scalar && targets_family {
                    if let Some(fk) = nav.foreign_key_names.get(index) {
                        foreign_keys.push((owner.name().to_string(), fk.clone()));
                    }
                } else if !nav.is_scalar
                    && owner.root_type_name() == root
                    && let Some(fk) = nav.inv_foreign_key_names.get(index)
                {
                    foreign_keys.push((nav.entity_type_name.clone(), fk.clone()));
                }
            }
        }
        foreign_keys.sort();
        foreign_keys.dedup();

        for (owner_type, fk) in foreign_keys {
            let owners: Vec<EntityId> = self
                .entities
                .values()
                .filter(|e| store.is_subtype_of(e.entity_type_name(), &owner_type))
                .map(|e| e.id())
                .collect();
            for owner in owners {
                let owner_type = self.entity_type_of(owner)?;
                let part_of_key = owner_type.data_property(&fk).is_some_and(|p| p.is_part_of_key);
                let old_owner_key = self.key_of(owner)?;
                let Some(entity) = self.entities.get_mut(&owner) else {
                    continue;
                };
                let rewritten = *entity.get(&fk) == temp;
                if rewritten {
                    entity.write_value(&fk, real.clone());
                    debug!(entity = %owner, property = %fk, "Rewrote foreign key");
                }
                if let Some(original) = entity.aspect.original_values.get_mut(&fk)
                    && *original == temp
                {
                    *original = real.clone();
                }
                if rewritten && part_of_key {
                    // the foreign key is also part of the owner's own key
                    let new_owner_key = self.key_of(owner)?;
                    if let Some(group) = self.groups.get_mut(owner_type.name()) {
                        group.rekey(&old_owner_key, &new_owner_key)?;
                    }
                    self.unattached.rekey(&old_owner_key, &new_owner_key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use crate::config::SaveOptions;
    use crate::core::Value;
    use crate::transport::{KeyMapping, SaveResult};

    #[test]
    fn test_fixup_rewrites_key_and_foreign_keys() {
        let mut em = manager();
        let customer = em.create_entity("Customer").unwrap();
        let customer = em.add_entity(customer).unwrap();
        let temp = em.get_entity(customer).unwrap().get("CustomerID").clone();

        let order = em.create_entity("Order").unwrap();
        let order = em.add_entity(order).unwrap();
        em.set_navigation(order, "Customer", Some(customer)).unwrap();
        assert_eq!(em.get_entity(order).unwrap().get("CustomerID"), &temp);

        let real_customer = uuid::Uuid::new_v4();
        let prepared = em.prepare_save(None, &SaveOptions::new()).unwrap();
        let result = SaveResult {
            entities: Vec::new(),
            key_mappings: vec![
                KeyMapping::new("Customer", temp.clone(), Value::Guid(real_customer)),
                KeyMapping::new("Order", -2, 10248),
            ],
        };
        em.complete_save(&prepared, result).unwrap();

        let saved_order = em.get_entity(order).unwrap();
        assert_eq!(saved_order.get("CustomerID"), &Value::Guid(real_customer));
        assert_eq!(saved_order.get("OrderID"), &Value::Integer(10248));
        assert_eq!(saved_order.related("Customer"), Some(customer));
        assert!(em.temp_keys().is_empty());
        assert_eq!(
            em.find_by_key_values("Customer", vec![Value::Guid(real_customer)])
                .unwrap()
                .map(|e| e.id()),
            Some(customer)
        );
        assert!(em.find_by_key_values("Customer", vec![temp]).unwrap().is_none());
    }
}
