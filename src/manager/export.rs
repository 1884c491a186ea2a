// ============================================================================
// Entity export / import
// ============================================================================
//
// A manager snapshot is a JSON document holding, per entity type, the
// entities with their values and aspect state, plus the temporary keys in
// play and optionally the metadata needed to read it back. Relationships
// are not stored: they are rebuilt from foreign keys on import.
//
// ============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use super::EntityManager;
use crate::config::MergeStrategy;
use crate::core::{CacheError, Result, Value};
use crate::entity::{Entity, EntityAction, EntityChanged, EntityId, EntityKey, EntityState};
use crate::metadata::{EntityType, MetadataDocument, MetadataStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_store: Option<MetadataDocument>,
    #[serde(default)]
    pub entity_group_map: BTreeMap<String, ExportedGroup>,
    #[serde(default)]
    pub temp_keys: Vec<ExportedKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportedGroup {
    pub entities: Vec<ExportedEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEntity {
    pub entity_aspect: ExportedAspect,
    #[serde(flatten)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedAspect {
    pub entity_state: String,
    #[serde(default)]
    pub original_values_map: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub has_temp_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedKey {
    pub entity_type: String,
    pub values: Vec<serde_json::Value>,
}

/// An imported temporary key that collided with a local one and was replaced.
struct KeyRemap {
    root_type: String,
    index: usize,
    from: Value,
    to: Value,
}

impl EntityManager {
    /// Snapshot entities as JSON. `None` exports the whole cache.
    pub fn export_entities(&self, ids: Option<&[EntityId]>, include_metadata: bool) -> Result<String> {
        let mut selected: Vec<&Entity> = match ids {
            Some(ids) => ids
                .iter()
                .map(|id| self.entities.get(id).ok_or(CacheError::EntityNotFound(*id)))
                .collect::<Result<_>>()?,
            None => self.entities.values().collect(),
        };
        selected.sort_by_key(|e| e.id());

        let mut document = ExportDocument {
            metadata_store: include_metadata.then(|| self.metadata().to_document()),
            ..ExportDocument::default()
        };
        for entity in selected {
            let values = entity
                .values()
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect();
            let original_values_map = entity
                .aspect
                .original_values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect();
            document
                .entity_group_map
                .entry(entity.entity_type_name().to_string())
                .or_default()
                .entities
                .push(ExportedEntity {
                    entity_aspect: ExportedAspect {
                        entity_state: entity.state().to_string(),
                        original_values_map,
                        has_temp_key: entity.aspect.has_temp_key,
                    },
                    values,
                });
            if entity.aspect.has_temp_key {
                let key = self.key_of(entity.id())?;
                document.temp_keys.push(ExportedKey {
                    entity_type: key.entity_type_name().to_string(),
                    values: key.values().iter().map(Value::to_json).collect(),
                });
            }
        }
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Load a snapshot produced by [`EntityManager::export_entities`].
    ///
    /// Entities whose key is already cached are merged under `strategy`;
    /// the others are attached in their exported state. An imported
    /// temporary key that collides with a local one is replaced, and the
    /// imported foreign keys that used it follow.
    pub fn import_entities(&mut self, json: &str, strategy: MergeStrategy) -> Result<Vec<EntityId>> {
        let document: ExportDocument = serde_json::from_str(json)?;
        let previous_metadata = self.metadata_arc();
        if let Some(metadata) = document.metadata_store {
            self.metadata_mut().import_document(metadata)?;
        }
        let span = info_span!("import_entities", groups = document.entity_group_map.len());
        let _guard = span.enter();

        let result = self.with_atomic_loading(|em, _scope| {
            let store = em.metadata_arc();
            let mut imported = Vec::new();
            let mut remaps = Vec::new();

            for (type_name, group) in &document.entity_group_map {
                let entity_type = store.entity_type(type_name)?;
                for exported in &group.entities {
                    let id = em.import_one(&store, &entity_type, exported, strategy, &mut remaps)?;
                    imported.push(id);
                }
            }

            for remap in &remaps {
                em.apply_import_remap(&store, remap, &imported);
            }
            for id in &imported {
                em.link_related_entities(*id)?;
            }
            debug!(entities = imported.len(), remapped = remaps.len(), "Import complete");
            Ok(imported)
        });
        if result.is_err() {
            self.metadata = previous_metadata;
        }
        result
    }

    fn import_one(
        &mut self,
        store: &MetadataStore,
        entity_type: &EntityType,
        exported: &ExportedEntity,
        strategy: MergeStrategy,
        remaps: &mut Vec<KeyRemap>,
    ) -> Result<EntityId> {
        let state = EntityState::from_name(&exported.entity_aspect.entity_state)
            .filter(|s| !s.is_detached())
            .ok_or_else(|| {
                CacheError::Serialization(format!(
                    "Bad entity state '{}' in export",
                    exported.entity_aspect.entity_state
                ))
            })?;
        let mut values = read_exported_values(store, entity_type, &exported.values)?;
        let original_values = read_exported_values(store, entity_type, &exported.entity_aspect.original_values_map)?;
        let has_temp_key = exported.entity_aspect.has_temp_key;

        let key = key_from(entity_type, &values);
        if key.has_null_part() {
            return Err(CacheError::MergeInconsistency(format!(
                "Exported {} without a complete key",
                entity_type.name()
            )));
        }

        let existing = self.find_id_by_key(&key);
        if let Some(id) = existing
            && !has_temp_key
        {
            let entity = self.entities.get_mut(&id).ok_or(CacheError::EntityNotFound(id))?;
            if strategy == MergeStrategy::OverwriteChanges || entity.state().is_unchanged() {
                for (name, value) in values {
                    entity.write_value(&name, value);
                }
                entity.aspect.state = state;
                entity.aspect.original_values = original_values;
                self.notify(EntityChanged::new(EntityAction::MergeOnImport, id));
            }
            return Ok(id);
        }

        if existing.is_some() {
            // a different entity already uses this temporary key locally
            let index = 0;
            let property = entity_type
                .key_properties()
                .first()
                .map(|p| (*p).clone())
                .ok_or_else(|| CacheError::MissingKey(entity_type.name().to_string()))?;
            let template = key_template(entity_type, &values);
            let fresh = self.next_temp_value(entity_type, &property, &template)?;
            let from = values.insert(property.name.clone(), fresh.clone()).unwrap_or(Value::Null);
            debug!(entity_type = %entity_type.name(), from = %from, to = %fresh, "Replaced colliding temporary key");
            remaps.push(KeyRemap {
                root_type: entity_type.root_type_name().to_string(),
                index,
                from,
                to: fresh,
            });
        }

        let mut entity = store.create_entity(entity_type.name())?;
        for (name, value) in values {
            entity.write_value(&name, value);
        }
        entity.aspect.manager = Some(self.id());
        entity.aspect.state = state;
        entity.aspect.original_values = original_values;
        entity.aspect.has_temp_key = has_temp_key;
        let id = entity.id();
        let key = entity_type.key_of(&entity);
        self.find_or_create_group(entity_type.name()).attach(&key, id)?;
        if has_temp_key {
            self.key_generator.add_temp_key(key);
        }
        self.entities.insert(id, entity);
        self.notify(EntityChanged::new(EntityAction::AttachOnImport, id));
        Ok(id)
    }

    /// Point imported foreign keys at a replaced temporary key.
    fn apply_import_remap(&mut self, store: &MetadataStore, remap: &KeyRemap, imported: &[EntityId]) {
        for id in imported {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            let Some(owner_type) = store.find_entity_type(entity.entity_type_name()) else {
                continue;
            };
            for nav in owner_type.navigation_properties() {
                let targets_family = store
                    .find_entity_type(&nav.entity_type_name)
                    .is_some_and(|t| t.root_type_name() == remap.root_type);
                if !nav.is_scalar || !targets_family {
                    continue;
                }
                if let Some(fk) = nav.foreign_key_names.get(remap.index)
                    && *entity.get(fk) == remap.from
                {
                    entity.write_value(fk, remap.to.clone());
                }
            }
        }
    }
}

fn key_from(entity_type: &EntityType, values: &BTreeMap<String, Value>) -> EntityKey {
    entity_type.key_from_values(
        entity_type
            .key_properties()
            .iter()
            .map(|p| values.get(&p.name).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Detached stand-in carrying only the key values, used to probe for
/// free temporary keys.
fn key_template(entity_type: &EntityType, values: &BTreeMap<String, Value>) -> Entity {
    entity_type
        .key_properties()
        .iter()
        .fold(Entity::new(entity_type.name()), |entity, p| {
            entity.with_value(p.name.clone(), values.get(&p.name).cloned().unwrap_or(Value::Null))
        })
}

/// Exported values use client property names.
fn read_exported_values(
    store: &MetadataStore,
    entity_type: &EntityType,
    raw: &serde_json::Map<String, serde_json::Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut values = BTreeMap::new();
    for (name, raw_value) in raw {
        let value = match entity_type.data_property(name) {
            Some(property) => match &property.complex_type_name {
                Some(ct) => read_exported_complex(store, ct, raw_value)?,
                None => property.data_type.parse_json(raw_value)?,
            },
            None => Value::from_json(raw_value),
        };
        values.insert(name.clone(), value);
    }
    Ok(values)
}

fn read_exported_complex(store: &MetadataStore, complex_type: &str, raw: &serde_json::Value) -> Result<Value> {
    if raw.is_null() {
        return store.complex_default(complex_type);
    }
    let complex = store.complex_type(complex_type)?;
    let mut fields = BTreeMap::new();
    for property in complex.data_properties() {
        let field = raw.get(property.name.as_str()).unwrap_or(&serde_json::Value::Null);
        let value = match &property.complex_type_name {
            Some(ct) => read_exported_complex(store, ct, field)?,
            None => property.data_type.parse_json(field)?,
        };
        fields.insert(property.name.clone(), value);
    }
    Ok(Value::Complex(fields))
}
