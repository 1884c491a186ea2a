// ============================================================================
// Relationship linking
// ============================================================================
//
// Keeps both sides of every association consistent. Scalar navigations
// with foreign keys are resolved from the key values; when the parent is
// not cached yet the child is parked in the unattached-children index under
// the parent's key and linked once that parent attaches.
//
// ============================================================================

use tracing::trace;

use super::EntityManager;
use crate::core::{CacheError, Result, Value};
use crate::entity::{EntityId, NavigationRef, NavigationValue};
use crate::metadata::NavigationProperty;

impl EntityManager {
    /// Navigation property `name` declared on the type of `id`.
    pub(crate) fn navigation_of(&self, id: EntityId, name: &str) -> Option<NavigationProperty> {
        let entity = self.entities.get(&id)?;
        self.metadata()
            .find_entity_type(entity.entity_type_name())?
            .navigation_property(name)
            .cloned()
    }

    /// Point `owner.nav` at `target` and update the inverse side.
    pub(crate) fn link_navigation(&mut self, owner: EntityId, nav: &NavigationProperty, target: EntityId) {
        self.link_one_side(owner, nav, target);
        if let Some(inverse) = nav.inverse().and_then(|name| self.navigation_of(target, name)) {
            self.link_one_side(target, &inverse, owner);
        }
        trace!(owner = %owner, navigation = %nav.name, target = %target, "Linked");
    }

    fn link_one_side(&mut self, owner: EntityId, nav: &NavigationProperty, target: EntityId) {
        if !nav.is_scalar {
            if let Some(entity) = self.entities.get_mut(&owner) {
                entity.add_to_collection(&nav.name, target);
            }
            return;
        }
        let previous = self.entities.get(&owner).and_then(|e| e.related(&nav.name));
        if previous == Some(target) {
            return;
        }
        if let Some(previous) = previous
            && let Some(inverse) = nav.inverse()
        {
            self.drop_reference(previous, inverse, owner);
        }
        if let Some(entity) = self.entities.get_mut(&owner) {
            entity.set_scalar_slot(&nav.name, Some(target));
        }
    }

    /// Remove the link `owner.nav -> target` on both sides.
    pub(crate) fn unlink_navigation(&mut self, owner: EntityId, nav: &NavigationProperty, target: EntityId) {
        self.drop_reference(owner, &nav.name, target);
        if let Some(inverse) = nav.inverse() {
            self.drop_reference(target, inverse, owner);
        }
    }

    fn drop_reference(&mut self, owner: EntityId, name: &str, target: EntityId) {
        let Some(entity) = self.entities.get_mut(&owner) else {
            return;
        };
        match entity.navigation(name) {
            Some(NavigationValue::Collection(_)) => {
                entity.remove_from_collection(name, target);
            }
            Some(NavigationValue::Scalar(Some(current))) if *current == target => {
                entity.set_scalar_slot(name, None);
            }
            _ => {}
        }
    }

    /// Connect a newly attached or merged entity to the rest of the cache:
    /// children parked under its key are linked to it, and each of its
    /// foreign-key navigations is resolved or parked.
    pub(crate) fn link_related_entities(&mut self, id: EntityId) -> Result<()> {
        let entity_type = self.entity_type_of(id)?;
        let key = entity_type.key_of(
            self.entities
                .get(&id)
                .ok_or(CacheError::EntityNotFound(id))?,
        );

        for tuple in self.unattached.take_children(&key) {
            for child in tuple.children {
                let Some(nav) = self.navigation_of(child, &tuple.navigation.name) else {
                    continue;
                };
                if self.metadata().is_subtype_of(entity_type.name(), &nav.entity_type_name) {
                    self.link_navigation(child, &nav, id);
                } else {
                    // same root key, different branch of the hierarchy
                    self.unattached.add_child(&key, tuple.navigation.clone(), child);
                }
            }
        }

        for nav in entity_type.navigation_properties() {
            if nav.is_scalar && !nav.foreign_key_names.is_empty() {
                self.resolve_foreign_key_navigation(id, nav);
            }
        }
        Ok(())
    }

    /// Make `id.nav` agree with its foreign key values.
    fn resolve_foreign_key_navigation(&mut self, id: EntityId, nav: &NavigationProperty) {
        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        let owner_type = entity.entity_type_name().to_string();
        let values: Vec<Value> = nav
            .foreign_key_names
            .iter()
            .map(|fk| entity.get(fk).clone())
            .collect();
        let current = entity.related(&nav.name);

        let target_type = match self.metadata().find_entity_type(&nav.entity_type_name) {
            Some(t) if !values.iter().any(Value::is_null) => t,
            _ => {
                if let Some(old) = current {
                    self.unlink_navigation(id, nav, old);
                }
                return;
            }
        };
        let parent_key = target_type.key_from_values(values);
        let parent = self.find_id_by_key(&parent_key).filter(|p| {
            self.entities
                .get(p)
                .is_some_and(|e| self.metadata().is_subtype_of(e.entity_type_name(), &nav.entity_type_name))
        });
        match parent {
            Some(parent) if current == Some(parent) => {}
            Some(parent) => self.link_navigation(id, nav, parent),
            None => {
                if let Some(old) = current {
                    self.unlink_navigation(id, nav, old);
                }
                self.unattached
                    .add_child(&parent_key, NavigationRef::new(owner_type, nav.name.clone()), id);
            }
        }
    }

    /// Re-resolve navigations after foreign key `property` of `id` changed.
    pub(crate) fn relink_foreign_key(&mut self, id: EntityId, property: &str) -> Result<()> {
        let entity_type = self.entity_type_of(id)?;
        self.unattached.remove_child(id);
        for nav in entity_type.navigation_properties() {
            if nav.is_scalar && !nav.foreign_key_names.is_empty() {
                if nav.foreign_key_names.iter().any(|fk| fk == property) {
                    trace!(entity = %id, navigation = %nav.name, "Foreign key changed");
                }
                self.resolve_foreign_key_navigation(id, nav);
            }
        }
        Ok(())
    }
}
