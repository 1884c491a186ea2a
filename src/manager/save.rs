// ============================================================================
// Save pipeline
// ============================================================================
//
// prepare_save checks the batch against local policy, bumps concurrency
// properties and snapshots the entities into a SaveRequest. Nothing is
// changed when a policy check fails. complete_save applies key fixups
// first, then merges the saved nodes and accepts the batch; abort_save only
// releases the in-flight marks.
//
// ============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info_span};
use uuid::Uuid;

use super::merge::{MergeContext, Merged};
use super::EntityManager;
use crate::config::{MergeStrategy, SaveOptions};
use crate::core::{CacheError, DataType, Result, Value};
use crate::entity::{EntityAction, EntityChanged, EntityId, EntityState};
use crate::metadata::{DataProperty, EntityType};
use crate::transport::{KeyMapping, SaveEntity, SaveRequest, SaveResult};

/// A validated save batch waiting for the data service.
#[derive(Debug, Clone)]
pub struct PreparedSave {
    pub request: SaveRequest,
    entity_ids: Vec<EntityId>,
}

impl PreparedSave {
    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }
}

/// What a completed save changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    pub entities: Vec<EntityId>,
    pub key_mappings: Vec<KeyMapping>,
}

impl EntityManager {
    /// Check and snapshot a save batch. `None` saves every pending change.
    pub fn prepare_save(&mut self, ids: Option<&[EntityId]>, options: &SaveOptions) -> Result<PreparedSave> {
        let span = info_span!("prepare_save", manager = %self.id());
        let _guard = span.enter();

        let batch: Vec<EntityId> = match ids {
            Some(ids) => {
                let foreign: Vec<EntityId> = ids
                    .iter()
                    .filter(|id| !self.entities.contains_key(*id))
                    .copied()
                    .collect();
                if !foreign.is_empty() {
                    return Err(CacheError::CrossManagerSave(foreign));
                }
                let mut batch = Vec::with_capacity(ids.len());
                for id in ids {
                    if !batch.contains(id) && self.entities.get(id).is_some_and(|e| e.state().is_changed()) {
                        batch.push(*id);
                    }
                }
                batch
            }
            None => self.get_changes().iter().map(|e| e.id()).collect(),
        };

        let allow_concurrent = options
            .allow_concurrent_saves
            .unwrap_or(self.config().allow_concurrent_saves);
        if !allow_concurrent {
            let busy: Vec<EntityId> = batch
                .iter()
                .filter(|id| self.entities.get(*id).is_some_and(|e| e.aspect.is_being_saved))
                .copied()
                .collect();
            if !busy.is_empty() {
                return Err(CacheError::ConcurrentSaveRejected(busy));
            }
        }

        if self.config().validate_on_save {
            self.validate_batch(&batch)?;
        }

        let mut bumps = Vec::new();
        for id in &batch {
            let entity_type = self.entity_type_of(*id)?;
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            if !entity.state().is_modified() {
                continue;
            }
            for property in entity_type.concurrency_properties() {
                // already bumped earlier in this change cycle
                if entity.aspect.original_values.contains_key(&property.name) {
                    continue;
                }
                check_concurrency_type(&entity_type, property)?;
                bumps.push((*id, property.clone()));
            }
        }
        for (id, property) in bumps {
            let current = self.entities.get(&id).map(|e| e.get(&property.name).clone()).unwrap_or(Value::Null);
            let next = self.next_concurrency_value(&property, &current);
            debug!(entity = %id, property = %property.name, "Bumped concurrency value");
            self.write_tracked(id, &property.name, next);
            self.notify(EntityChanged::property_change(id, property.name.clone()));
        }

        let mut entities = Vec::with_capacity(batch.len());
        for id in &batch {
            let entity_type = self.entity_type_of(*id)?;
            let convention = self.metadata().naming_convention();
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            entity.aspect.is_being_saved = true;

            let mut values = serde_json::Map::new();
            for property in entity_type.data_properties() {
                if !property.is_unmapped {
                    values.insert(
                        convention.client_to_server(&property.name),
                        entity.get(&property.name).to_json(),
                    );
                }
            }
            let original_values = entity
                .aspect
                .original_values
                .iter()
                .map(|(name, value)| (convention.client_to_server(name), value.to_json()))
                .collect();
            entities.push(SaveEntity {
                entity_id: *id,
                entity_type_name: entity_type.name().to_string(),
                state: entity.state(),
                values,
                original_values,
                has_temp_key: entity.aspect.has_temp_key,
            });
        }

        debug!(entities = entities.len(), "Save batch prepared");
        Ok(PreparedSave {
            request: SaveRequest {
                service_name: self.config().service_name.clone(),
                resource_name: options.resource_name.clone(),
                tag: options.tag.clone(),
                entities,
            },
            entity_ids: batch,
        })
    }

    fn validate_batch(&self, batch: &[EntityId]) -> Result<()> {
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for id in batch {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            if !matches!(entity.state(), EntityState::Added | EntityState::Modified) {
                continue;
            }
            let entity_type = self.entity_type_of(*id)?;
            let mut errors: Vec<String> = self
                .validators()
                .iter()
                .flat_map(|v| v.validate(entity, &entity_type))
                .collect();
            if !errors.is_empty() {
                failed.push(*id);
                messages.extend(errors.drain(..).map(|m| format!("{} {}: {}", entity_type.short_name(), id, m)));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CacheError::ValidationFailed {
                entities: failed,
                messages,
            })
        }
    }

    fn next_concurrency_value(&mut self, property: &DataProperty, current: &Value) -> Value {
        match property.data_type {
            t if t.is_integer() => Value::Integer(current.as_i64().unwrap_or(0) + 1),
            t if t.is_numeric() => Value::Double(current.as_f64().unwrap_or(0.0) + 1.0),
            t if t.is_date() => Value::DateTime(self.next_stamp()),
            _ => Value::Guid(Uuid::new_v4()),
        }
    }

    /// A timestamp strictly later than any handed out before.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    /// Apply the data service's answer to a prepared batch.
    pub fn complete_save(&mut self, prepared: &PreparedSave, result: SaveResult) -> Result<SaveOutcome> {
        let span = info_span!("complete_save", entities = prepared.entity_ids.len());
        let _guard = span.enter();

        self.with_loading(|em, scope| {
            let deleted: Vec<EntityId> = prepared
                .entity_ids
                .iter()
                .filter(|id| em.entities.get(*id).is_some_and(|e| e.state().is_deleted()))
                .copied()
                .collect();

            em.fixup_keys(&result.key_mappings, scope)?;

            let mut ctx = MergeContext::new(MergeStrategy::OverwriteChanges, EntityAction::Attach, EntityAction::MergeOnSave);
            let mut saved = Vec::new();
            let mut pending = Vec::new();
            for (i, node) in result.entities.iter().enumerate() {
                // untyped nodes come back in batch order
                let expected = prepared
                    .entity_ids
                    .get(i)
                    .and_then(|id| em.entities.get(id))
                    .map(|e| e.entity_type_name().to_string());
                match em.visit_and_merge(node, expected.as_deref(), None, &mut ctx, scope)? {
                    Merged::Entity(id) => saved.push(id),
                    Merged::Pending(ref_id) => pending.push(ref_id),
                    Merged::Value(_) | Merged::Ignored => {}
                }
            }
            em.finish_merge(&mut ctx, scope)?;
            saved.extend(pending.iter().filter_map(|r| ctx.ref_map.get(r).copied()));

            for id in &prepared.entity_ids {
                if let Some(entity) = em.entities.get_mut(id) {
                    entity.aspect.is_being_saved = false;
                }
            }
            for id in &deleted {
                em.detach_entity(*id);
            }
            for id in &prepared.entity_ids {
                if em.entities.get(id).is_some_and(|e| e.state().is_changed()) {
                    em.accept_changes(*id)?;
                }
            }

            if saved.is_empty() {
                saved = prepared.entity_ids.clone();
            }
            Ok(SaveOutcome {
                entities: saved,
                key_mappings: result.key_mappings.clone(),
            })
        })
    }

    /// Release a batch after the data service failed. Values already bumped
    /// stay bumped.
    pub fn abort_save(&mut self, prepared: &PreparedSave) {
        for id in &prepared.entity_ids {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.aspect.is_being_saved = false;
            }
        }
    }

    /// Save pending changes through the data service. `None` saves everything.
    pub async fn save_changes(&mut self, ids: Option<&[EntityId]>, options: SaveOptions) -> Result<SaveOutcome> {
        let service = self.data_service().ok_or(CacheError::NoDataService)?;
        let prepared = self.prepare_save(ids, &options)?;
        if prepared.is_empty() {
            return Ok(SaveOutcome::default());
        }
        match service.save_changes(&prepared.request).await {
            Ok(result) => self.complete_save(&prepared, result),
            Err(err) => {
                self.abort_save(&prepared);
                let operation = format!("save ({} entities)", prepared.entity_ids.len());
                Err(self.transport_error(operation, err))
            }
        }
    }
}

fn check_concurrency_type(entity_type: &EntityType, property: &DataProperty) -> Result<()> {
    let t = property.data_type;
    if t.is_numeric() || t.is_date() || t == DataType::Guid {
        Ok(())
    } else {
        Err(CacheError::UnsupportedOperation(format!(
            "Cannot bump concurrency property {}.{} of type {}",
            entity_type.name(),
            property.name,
            t
        )))
    }
}
