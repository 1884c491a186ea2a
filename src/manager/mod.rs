// ============================================================================
// Entity Manager
// ============================================================================
//
// Owns the entity cache: an arena of entities addressed by `EntityId`, one
// `EntityGroup` per concrete type for key lookups, and the index of children
// whose parent has not been loaded yet.
//
// All mutation goes through `&mut self`, which serializes cache changes per
// manager. Remote operations are split into a prepare phase (no cache
// change), the transport call, and a merge phase, so several queries or
// saves can be in flight while their results are merged one at a time.
//
// ============================================================================

pub mod export;
pub mod key_fixup;
pub mod key_generator;
pub mod linking;
pub mod loading;
pub mod merge;
pub mod save;
pub mod validation;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::{FetchStrategy, ManagerConfig};
use crate::core::{CacheError, Result, Value};
use crate::entity::{
    Entity, EntityAction, EntityChanged, EntityGroup, EntityId, EntityKey, EntityState, UnattachedChildrenMap,
};
use crate::evaluator::EvaluationContext;
use crate::metadata::{AutoGeneratedKeyType, DataProperty, EntityType, MetadataStore};
use crate::query::EntityQuery;
use crate::result::QueryResult;
use crate::transport::{DataService, DefaultResultsAdapter, JsonResultsAdapter};

pub use export::{ExportDocument, ExportedAspect, ExportedEntity, ExportedGroup, ExportedKey};
pub use key_generator::{DefaultKeyGenerator, KeyGenerator};
pub use loading::LoadingScope;
pub use merge::PreparedQuery;
pub use save::{PreparedSave, SaveOutcome};
pub use validation::{EntityValidator, PropertyRulesValidator};

/// Global manager id counter
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an entity manager, recorded on the aspect of every entity it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(pub u64);

impl ManagerId {
    pub fn next() -> Self {
        ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager_{}", self.0)
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_TEMP_KEY_ATTEMPTS: usize = 64;

/// Client-side cache of entities plus the pipelines that fill it.
pub struct EntityManager {
    id: ManagerId,
    config: ManagerConfig,
    metadata: Arc<MetadataStore>,
    /// Persistent map, so a snapshot of the cache is a cheap clone.
    pub(crate) entities: im::HashMap<EntityId, Entity>,
    pub(crate) groups: HashMap<String, EntityGroup>,
    pub(crate) unattached: UnattachedChildrenMap,
    data_service: Option<Arc<dyn DataService>>,
    adapter: Arc<dyn JsonResultsAdapter>,
    pub(crate) key_generator: Box<dyn KeyGenerator>,
    validators: Vec<Arc<dyn EntityValidator>>,
    events: broadcast::Sender<EntityChanged>,
    loading: bool,
    pending_events: Vec<EntityChanged>,
    /// Last timestamp handed out as a concurrency value.
    pub(crate) last_stamp: Option<DateTime<Utc>>,
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("id", &self.id)
            .field("service_name", &self.config.service_name)
            .field("entities", &self.entities.len())
            .field("groups", &self.groups.len())
            .field("unattached", &self.unattached.len())
            .finish()
    }
}

impl EntityManager {
    pub fn new(metadata: Arc<MetadataStore>, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: ManagerId::next(),
            config,
            metadata,
            entities: im::HashMap::new(),
            groups: HashMap::new(),
            unattached: UnattachedChildrenMap::new(),
            data_service: None,
            adapter: Arc::new(DefaultResultsAdapter),
            key_generator: Box::new(DefaultKeyGenerator::new()),
            validators: vec![Arc::new(PropertyRulesValidator)],
            events,
            loading: false,
            pending_events: Vec::new(),
            last_stamp: None,
        }
    }

    pub fn with_data_service(mut self, service: Arc<dyn DataService>) -> Self {
        self.data_service = Some(service);
        self
    }

    pub fn with_results_adapter(mut self, adapter: Arc<dyn JsonResultsAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_key_generator(mut self, generator: Box<dyn KeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    pub fn add_validator(&mut self, validator: Arc<dyn EntityValidator>) {
        self.validators.push(validator);
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn metadata_arc(&self) -> Arc<MetadataStore> {
        self.metadata.clone()
    }

    /// Mutable metadata. Other holders of the same store keep their copy.
    pub fn metadata_mut(&mut self) -> &mut MetadataStore {
        Arc::make_mut(&mut self.metadata)
    }

    pub(crate) fn data_service(&self) -> Option<Arc<dyn DataService>> {
        self.data_service.clone()
    }

    pub(crate) fn adapter(&self) -> Arc<dyn JsonResultsAdapter> {
        self.adapter.clone()
    }

    pub(crate) fn validators(&self) -> &[Arc<dyn EntityValidator>] {
        &self.validators
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityChanged> {
        self.events.subscribe()
    }

    pub(crate) fn transport_error(&self, operation: String, err: CacheError) -> CacheError {
        let message = match err {
            CacheError::Transport { message, .. } => message,
            other => other.to_string(),
        };
        CacheError::Transport {
            operation,
            manager: self.id.0,
            message,
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get_entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub(crate) fn entity_type_of(&self, id: EntityId) -> Result<Arc<EntityType>> {
        let entity = self.entities.get(&id).ok_or(CacheError::EntityNotFound(id))?;
        self.metadata.entity_type(entity.entity_type_name())
    }

    pub fn key_of(&self, id: EntityId) -> Result<EntityKey> {
        let entity_type = self.entity_type_of(id)?;
        let entity = self.entities.get(&id).ok_or(CacheError::EntityNotFound(id))?;
        Ok(entity_type.key_of(entity))
    }

    /// Group for one exact type, if any entity of that type was ever attached.
    pub fn group(&self, type_name: &str) -> Option<&EntityGroup> {
        let name = self.metadata.find_entity_type(type_name)?.name().to_string();
        self.groups.get(&name)
    }

    pub(crate) fn find_or_create_group(&mut self, type_name: &str) -> &mut EntityGroup {
        self.groups
            .entry(type_name.to_string())
            .or_insert_with(|| EntityGroup::new(type_name))
    }

    /// Keys are unique per root type, so every group in the hierarchy is searched.
    pub(crate) fn find_id_by_key(&self, key: &EntityKey) -> Option<EntityId> {
        let types = self.metadata.type_and_subtypes(key.entity_type_name()).ok()?;
        types
            .iter()
            .filter_map(|t| self.groups.get(t.name()))
            .find_map(|g| g.find(key))
    }

    pub fn find_by_key(&self, key: &EntityKey) -> Option<&Entity> {
        let root = self
            .metadata
            .find_entity_type(key.entity_type_name())
            .map(|t| key.with_type(t.root_type_name()))?;
        self.find_id_by_key(&root).and_then(|id| self.entities.get(&id))
    }

    pub fn find_by_key_values(&self, type_name: &str, values: Vec<Value>) -> Result<Option<&Entity>> {
        let entity_type = self.metadata.entity_type(type_name)?;
        let key = entity_type.key_from_values(entity_type.coerce_key_values(values)?);
        Ok(self.find_id_by_key(&key).and_then(|id| self.entities.get(&id)))
    }

    /// Cached entities of `type_name` and its subtypes, in any state.
    pub fn entities_of_type(&self, type_name: &str) -> Result<Vec<&Entity>> {
        let mut result = Vec::new();
        for entity_type in self.metadata.type_and_subtypes(type_name)? {
            if let Some(group) = self.groups.get(entity_type.name()) {
                result.extend(group.entity_ids().filter_map(|id| self.entities.get(&id)));
            }
        }
        Ok(result)
    }

    /// Added, modified and deleted entities, ordered by id.
    pub fn get_changes(&self) -> Vec<&Entity> {
        let mut changes: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.state().is_changed())
            .collect();
        changes.sort_by_key(|e| e.id());
        changes
    }

    pub fn has_changes(&self) -> bool {
        self.entities.values().any(|e| e.state().is_changed())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn temp_keys(&self) -> Vec<EntityKey> {
        self.key_generator.temp_keys()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// New detached entity of `type_name` with initial values filled in.
    pub fn create_entity(&self, type_name: &str) -> Result<Entity> {
        self.metadata.create_entity(type_name)
    }

    /// Attach as `Added`.
    pub fn add_entity(&mut self, entity: Entity) -> Result<EntityId> {
        self.attach_entity(entity, EntityState::Added)
    }

    /// Attach a detached entity in the given state.
    ///
    /// Fails without touching the cache when the entity belongs to another
    /// manager, when its key is unset and the type does not generate keys,
    /// or when another entity already has the same key.
    pub fn attach_entity(&mut self, entity: Entity, state: EntityState) -> Result<EntityId> {
        self.attach_internal(entity, state, EntityAction::Attach)
    }

    pub(crate) fn attach_internal(&mut self, mut entity: Entity, state: EntityState, action: EntityAction) -> Result<EntityId> {
        let id = entity.id();
        match entity.aspect.manager {
            Some(owner) if owner != self.id => return Err(CacheError::AlreadyAttachedElsewhere(id)),
            Some(_) if self.entities.contains_key(&id) => return Ok(id),
            _ => {}
        }
        if state.is_detached() {
            return Err(CacheError::InvalidState(format!("Cannot attach {} as Detached", id)));
        }

        let entity_type = self.metadata.entity_type(entity.entity_type_name())?;
        if entity_type.is_abstract() {
            return Err(CacheError::InvalidState(format!(
                "Cannot attach an instance of abstract type '{}'",
                entity_type.name()
            )));
        }

        for property in entity_type.key_properties() {
            let value = entity.get(&property.name).clone();
            if !value.is_null() {
                entity.write_value(&property.name, property.data_type.coerce(value)?);
            }
        }

        let mut temp_key = false;
        if entity_type.has_default_key(&entity) {
            if entity_type.auto_generated_key_type() == AutoGeneratedKeyType::None {
                return Err(CacheError::MissingKey(entity_type.name().to_string()));
            }
            let property = entity_type
                .key_properties()
                .into_iter()
                .find(|p| {
                    let v = entity.get(&p.name);
                    v.is_null() || *v == p.data_type.default_value()
                })
                .cloned()
                .ok_or_else(|| CacheError::MissingKey(entity_type.name().to_string()))?;
            let value = self.next_temp_value(&entity_type, &property, &entity)?;
            entity.write_value(&property.name, value);
            temp_key = true;
        }

        let key = entity_type.key_of(&entity);
        if key.has_null_part() {
            return Err(CacheError::MissingKey(entity_type.name().to_string()));
        }
        if self.find_id_by_key(&key).is_some() {
            return Err(CacheError::DuplicateKey(key.key_string()));
        }

        self.find_or_create_group(entity_type.name()).attach(&key, id)?;
        entity.aspect.manager = Some(self.id);
        entity.aspect.state = state;
        entity.aspect.original_values.clear();
        entity.aspect.has_temp_key = temp_key || entity.aspect.has_temp_key;
        if entity.aspect.has_temp_key {
            self.key_generator.add_temp_key(key.clone());
        }
        entity.clear_navigation();
        self.entities.insert(id, entity);
        debug!(entity = %id, key = %key, state = %state, "Attached entity");

        self.link_related_entities(id)?;
        self.notify(EntityChanged::new(action, id));
        Ok(id)
    }

    /// Generate a temporary value for `property` that no cached entity of
    /// the hierarchy uses yet. Other key parts are taken from `template`.
    pub(crate) fn next_temp_value(
        &mut self,
        entity_type: &EntityType,
        property: &DataProperty,
        template: &Entity,
    ) -> Result<Value> {
        for _ in 0..MAX_TEMP_KEY_ATTEMPTS {
            let value = self.key_generator.generate_temp_value(entity_type, property)?;
            let values = entity_type
                .key_properties()
                .iter()
                .map(|p| {
                    if p.name == property.name {
                        value.clone()
                    } else {
                        template.get(&p.name).clone()
                    }
                })
                .collect();
            if self.find_id_by_key(&entity_type.key_from_values(values)).is_none() {
                return Ok(value);
            }
        }
        Err(CacheError::DuplicateKey(format!(
            "no free temporary key for {}",
            entity_type.name()
        )))
    }

    /// Remove an entity from the cache. Returns `None` if it is not attached
    /// here; otherwise the detached entity, with its navigation cleared.
    pub fn detach_entity(&mut self, id: EntityId) -> Option<Entity> {
        let entity_type = self.entity_type_of(id).ok();
        let mut entity = self.entities.remove(&id)?;
        if let Some(entity_type) = entity_type {
            let key = entity_type.key_of(&entity);
            if let Some(group) = self.groups.get_mut(entity_type.name()) {
                group.detach(&key);
            }
            if entity.aspect.has_temp_key {
                self.key_generator.remove_temp_key(&key);
            }
        }
        self.unattached.remove_child(id);
        for (_, other) in self.entities.iter_mut() {
            other.unlink(id);
        }
        entity.clear_navigation();
        entity.aspect.detach();
        self.notify(EntityChanged::new(EntityAction::Detach, id));
        Some(entity)
    }

    /// Added entities are detached; unchanged and modified ones become `Deleted`.
    pub fn delete_entity(&mut self, id: EntityId) -> Result<()> {
        let state = self
            .entities
            .get(&id)
            .map(Entity::state)
            .ok_or(CacheError::EntityNotFound(id))?;
        match state {
            EntityState::Added => {
                self.detach_entity(id);
            }
            EntityState::Unchanged | EntityState::Modified => {
                if let Some(entity) = self.entities.get_mut(&id) {
                    entity.aspect.state = EntityState::Deleted;
                }
                self.notify(EntityChanged::new(EntityAction::EntityStateChange, id));
            }
            EntityState::Deleted | EntityState::Detached => {}
        }
        Ok(())
    }

    /// Tracked write of a data property.
    ///
    /// The value is coerced to the property's data type. Changing a key
    /// re-indexes the entity; changing a foreign key re-links the matching
    /// navigation property.
    pub fn set_value(&mut self, id: EntityId, property: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let entity_type = self.entity_type_of(id)?;
        let entity = self.entities.get(&id).ok_or(CacheError::EntityNotFound(id))?;
        if entity.state().is_deleted() {
            return Err(CacheError::InvalidState(format!("Cannot modify deleted entity {}", id)));
        }
        let data_property = entity_type
            .data_property(property)
            .ok_or_else(|| CacheError::UnknownProperty(entity_type.name().to_string(), property.to_string()))?;
        let value = match (&data_property.complex_type_name, value) {
            (Some(_), v @ Value::Complex(_)) => v,
            (Some(ct), other) => {
                return Err(CacheError::TypeMismatch(format!(
                    "'{}' expects a {} value, got {}",
                    property,
                    ct,
                    other.type_name()
                )));
            }
            (None, v) => data_property.data_type.coerce(v)?,
        };
        if *entity.get(property) == value {
            return Ok(());
        }

        if data_property.is_part_of_key {
            let old_key = entity_type.key_of(entity);
            let values = entity_type
                .key_properties()
                .iter()
                .map(|p| {
                    if p.name == property {
                        value.clone()
                    } else {
                        entity.get(&p.name).clone()
                    }
                })
                .collect();
            let new_key = entity_type.key_from_values(values);
            if self.find_id_by_key(&new_key).is_some_and(|other| other != id) {
                return Err(CacheError::DuplicateKey(new_key.key_string()));
            }
            if let Some(group) = self.groups.get_mut(entity_type.name()) {
                group.rekey(&old_key, &new_key)?;
            }
            self.unattached.rekey(&old_key, &new_key);
            if self.key_generator.is_temp_key(&old_key) {
                self.key_generator.remove_temp_key(&old_key);
                if let Some(entity) = self.entities.get_mut(&id) {
                    entity.aspect.has_temp_key = false;
                }
            }
        }

        let state_changed = self.write_tracked(id, property, value);
        if entity_type.foreign_key_names().contains(&property) {
            self.relink_foreign_key(id, property)?;
        }
        self.notify(EntityChanged::property_change(id, property));
        if state_changed {
            self.notify(EntityChanged::new(EntityAction::EntityStateChange, id));
        }
        Ok(())
    }

    /// Write a value recording the original. Returns true if the state changed.
    pub(crate) fn write_tracked(&mut self, id: EntityId, property: &str, value: Value) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        let previous = entity.write_value(property, value);
        entity.aspect.record_change(property, &previous)
    }

    /// Point a scalar navigation property at `target` (or clear it) and
    /// update the foreign keys and the inverse side to match.
    pub fn set_navigation(&mut self, id: EntityId, navigation: &str, target: Option<EntityId>) -> Result<()> {
        let entity_type = self.entity_type_of(id)?;
        let nav = entity_type
            .navigation_property(navigation)
            .cloned()
            .ok_or_else(|| CacheError::UnknownProperty(entity_type.name().to_string(), navigation.to_string()))?;
        if !nav.is_scalar {
            return Err(CacheError::InvalidExpression(format!(
                "'{}' is a collection; set the inverse navigation on each member instead",
                navigation
            )));
        }
        let target_key = match target {
            Some(t) => {
                let target_type = self.entity_type_of(t)?;
                if !self.metadata.is_subtype_of(target_type.name(), &nav.entity_type_name) {
                    return Err(CacheError::TypeMismatch(format!(
                        "'{}' expects {}, got {}",
                        navigation,
                        nav.entity_type_name,
                        target_type.name()
                    )));
                }
                Some(self.key_of(t)?)
            }
            None => None,
        };

        let current = self.entities.get(&id).and_then(|e| e.related(navigation));
        if current == target {
            return Ok(());
        }
        if let Some(old) = current {
            self.unlink_navigation(id, &nav, old);
        }
        self.unattached.remove_child(id);
        if let Some(t) = target {
            self.link_navigation(id, &nav, t);
        }

        let mut state_changed = false;
        for (i, fk) in nav.foreign_key_names.iter().enumerate() {
            let value = target_key
                .as_ref()
                .and_then(|k| k.values().get(i).cloned())
                .unwrap_or(Value::Null);
            let unchanged = self.entities.get(&id).is_some_and(|e| *e.get(fk) == value);
            if !unchanged {
                state_changed |= self.write_tracked(id, fk, value);
                self.notify(EntityChanged::property_change(id, fk.clone()));
            }
        }
        self.notify(EntityChanged::property_change(id, navigation));
        if state_changed {
            self.notify(EntityChanged::new(EntityAction::EntityStateChange, id));
        }
        Ok(())
    }

    /// Make the current values the new baseline.
    pub fn accept_changes(&mut self, id: EntityId) -> Result<()> {
        let state = self
            .entities
            .get(&id)
            .map(Entity::state)
            .ok_or(CacheError::EntityNotFound(id))?;
        match state {
            EntityState::Deleted => {
                self.detach_entity(id);
            }
            _ => {
                if let Some(entity) = self.entities.get_mut(&id) {
                    entity.aspect.accept();
                }
                self.notify(EntityChanged::new(EntityAction::AcceptChanges, id));
            }
        }
        Ok(())
    }

    /// Restore original values. Added entities are detached.
    pub fn reject_changes(&mut self, id: EntityId) -> Result<()> {
        let (state, originals) = self
            .entities
            .get(&id)
            .map(|e| (e.state(), e.aspect.original_values.clone()))
            .ok_or(CacheError::EntityNotFound(id))?;
        if state.is_added() {
            self.detach_entity(id);
            return Ok(());
        }
        let entity_type = self.entity_type_of(id)?;
        let foreign_keys = entity_type.foreign_key_names();
        let old_key = self.key_of(id)?;
        let mut relink = Vec::new();
        if let Some(entity) = self.entities.get_mut(&id) {
            for (name, value) in originals {
                if foreign_keys.contains(&name.as_str()) {
                    relink.push(name.clone());
                }
                entity.write_value(&name, value);
            }
            entity.aspect.original_values.clear();
            entity.aspect.state = EntityState::Unchanged;
        }
        let new_key = self.key_of(id)?;
        if new_key != old_key {
            if let Some(group) = self.groups.get_mut(entity_type.name()) {
                group.rekey(&old_key, &new_key)?;
            }
            self.unattached.rekey(&old_key, &new_key);
        }
        for name in relink {
            self.relink_foreign_key(id, &name)?;
        }
        self.notify(EntityChanged::new(EntityAction::RejectChanges, id));
        Ok(())
    }

    pub fn accept_all_changes(&mut self) -> Result<()> {
        let ids: Vec<EntityId> = self.get_changes().iter().map(|e| e.id()).collect();
        ids.into_iter().try_for_each(|id| self.accept_changes(id))
    }

    pub fn reject_all_changes(&mut self) -> Result<()> {
        let ids: Vec<EntityId> = self.get_changes().iter().map(|e| e.id()).collect();
        ids.into_iter().try_for_each(|id| self.reject_changes(id))
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        for (_, entity) in self.entities.iter_mut() {
            entity.clear_navigation();
            entity.aspect.detach();
        }
        for key in self.key_generator.temp_keys() {
            self.key_generator.remove_temp_key(&key);
        }
        self.entities.clear();
        self.groups.clear();
        self.unattached.clear();
        self.notify(EntityChanged::clear());
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query against the cache. Deleted entities are never returned.
    pub fn execute_query_locally(&self, query: &EntityQuery) -> Result<QueryResult> {
        let type_name = query.require_entity_type(&self.metadata)?;
        let span = tracing::debug_span!("local_query", entity_type = %type_name);
        let _guard = span.enter();

        let candidates: Vec<&Entity> = self
            .entities_of_type(&type_name)?
            .into_iter()
            .filter(|e| !e.state().is_deleted())
            .collect();
        let ctx = EvaluationContext::new(&self.entities, self.metadata.comparison_options());
        query.execute_over(&self.metadata, candidates, &ctx)
    }

    /// Run a query remotely and merge the results, or locally when the
    /// effective fetch strategy is `FromLocalCache`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use entitycache::prelude::*;
    /// # tokio_test::block_on(async {
    /// let mut store = MetadataStore::new();
    /// store.register_type(
    ///     StructuralTypeDef::entity("Region", "Northwind")
    ///         .resource_name("Regions")
    ///         .data_property(DataProperty::new("RegionID", DataType::Int32).key()),
    /// )?;
    /// let config = ManagerConfig::new("northwind").fetch_strategy(FetchStrategy::FromLocalCache);
    /// let mut em = EntityManager::new(Arc::new(store), config);
    /// em.attach_entity(Entity::new("Northwind.Region").with_value("RegionID", 1), EntityState::Unchanged)?;
    ///
    /// let result = em.execute_query(&EntityQuery::from("Regions")).await?;
    /// assert_eq!(result.entity_ids().len(), 1);
    /// # Ok::<(), CacheError>(())
    /// # }).unwrap();
    /// ```
    pub async fn execute_query(&mut self, query: &EntityQuery) -> Result<QueryResult> {
        let fetch_strategy = query
            .query_options()
            .and_then(|o| o.fetch_strategy)
            .unwrap_or(self.config.fetch_strategy);
        if fetch_strategy == FetchStrategy::FromLocalCache {
            return self.execute_query_locally(query);
        }

        let service = self.data_service().ok_or(CacheError::NoDataService)?;
        let prepared = self.prepare_query(query)?;
        let response = service
            .execute_query(&prepared.request)
            .await
            .map_err(|e| self.transport_error(format!("query {}", prepared.request.uri), e))?;
        self.merge_query_response(&prepared, response)
    }

    /// Run several remote queries with their transport calls in flight
    /// together. Responses are merged one at a time, in query order.
    pub async fn execute_queries(&mut self, queries: &[EntityQuery]) -> Result<Vec<QueryResult>> {
        let service = self.data_service().ok_or(CacheError::NoDataService)?;
        let prepared = queries
            .iter()
            .map(|q| self.prepare_query(q))
            .collect::<Result<Vec<_>>>()?;
        debug!(queries = prepared.len(), "Executing query batch");

        let responses = future::try_join_all(prepared.iter().map(|p| {
            let service = service.clone();
            async move {
                service
                    .execute_query(&p.request)
                    .await
                    .map_err(|e| (p.request.uri.clone(), e))
            }
        }))
        .await;
        let responses = match responses {
            Ok(responses) => responses,
            Err((uri, e)) => return Err(self.transport_error(format!("query {}", uri), e)),
        };

        prepared
            .iter()
            .zip(responses)
            .map(|(p, response)| self.merge_query_response(p, response))
            .collect()
    }

    /// Load metadata from the data service into this manager's store.
    pub async fn fetch_metadata(&mut self) -> Result<Vec<String>> {
        let service = self.data_service().ok_or(CacheError::NoDataService)?;
        let service_name = self.config.service_name.clone();
        let document = service
            .fetch_metadata(&service_name)
            .await
            .map_err(|e| self.transport_error(format!("metadata {}", service_name), e))?;
        self.metadata_mut().import_document(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::{DataProperty, NavigationProperty, StructuralTypeDef};

    pub(crate) fn northwind() -> Arc<MetadataStore> {
        let mut store = MetadataStore::new();
        store
            .register_type(
                StructuralTypeDef::entity("Customer", "Northwind")
                    .resource_name("Customers")
                    .data_property(DataProperty::new("CustomerID", DataType::Guid).key())
                    .data_property(DataProperty::new("CompanyName", DataType::String))
                    .auto_generated_key(AutoGeneratedKeyType::KeyGenerator)
                    .navigation_property(NavigationProperty::collection("Orders", "Order").association("Customer_Orders")),
            )
            .unwrap();
        store
            .register_type(
                StructuralTypeDef::entity("Order", "Northwind")
                    .resource_name("Orders")
                    .data_property(DataProperty::new("OrderID", DataType::Int32).key())
                    .data_property(DataProperty::new("CustomerID", DataType::Guid))
                    .data_property(DataProperty::new("Freight", DataType::Decimal))
                    .data_property(DataProperty::new("RowVersion", DataType::Int32).concurrency())
                    .auto_generated_key(AutoGeneratedKeyType::Identity)
                    .navigation_property(
                        NavigationProperty::scalar("Customer", "Customer")
                            .association("Customer_Orders")
                            .foreign_keys(&["CustomerID"]),
                    ),
            )
            .unwrap();
        store
            .register_type(
                StructuralTypeDef::entity("Region", "Northwind")
                    .data_property(DataProperty::new("RegionID", DataType::Int32).key())
                    .data_property(DataProperty::new("Description", DataType::String)),
            )
            .unwrap();
        Arc::new(store)
    }

    pub(crate) fn manager() -> EntityManager {
        EntityManager::new(northwind(), ManagerConfig::new("northwind"))
    }

    #[test]
    fn test_missing_key_rejected_before_mutation() {
        let mut em = manager();
        let region = em.create_entity("Region").unwrap();
        assert!(matches!(em.add_entity(region), Err(CacheError::MissingKey(_))));
        assert!(em.is_empty());
        assert!(em.group("Region").is_none());
    }

    #[test]
    fn test_auto_generated_key_gets_temp_value() {
        let mut em = manager();
        let order = em.create_entity("Order").unwrap();
        let id = em.add_entity(order).unwrap();
        let entity = em.get_entity(id).unwrap();
        assert_eq!(entity.get("OrderID"), &Value::Integer(-1));
        assert!(entity.aspect().has_temp_key());
        assert_eq!(em.temp_keys().len(), 1);
        assert!(entity.state().is_added());
    }

    #[test]
    fn test_attach_rejects_foreign_manager_and_duplicates() {
        let mut em = manager();
        let mut other = manager();
        let region = Entity::new("Northwind.Region").with_value("RegionID", 1);
        let id = em.attach_entity(region, EntityState::Unchanged).unwrap();
        let copy = em.get_entity(id).unwrap().clone();
        assert!(matches!(
            other.attach_entity(copy, EntityState::Unchanged),
            Err(CacheError::AlreadyAttachedElsewhere(_))
        ));
        let twin = Entity::new("Northwind.Region").with_value("RegionID", 1);
        assert!(matches!(
            em.attach_entity(twin, EntityState::Unchanged),
            Err(CacheError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_attach_coerces_key_values() {
        let mut em = manager();
        let region = Entity::new("Northwind.Region").with_value("RegionID", "7");
        let id = em.attach_entity(region, EntityState::Unchanged).unwrap();
        assert_eq!(em.get_entity(id).unwrap().get("RegionID"), &Value::Integer(7));
        assert_eq!(
            em.find_by_key_values("Region", vec![Value::from("7")]).unwrap().map(Entity::id),
            Some(id)
        );
        let twin = Entity::new("Northwind.Region").with_value("RegionID", 7);
        assert!(matches!(
            em.attach_entity(twin, EntityState::Unchanged),
            Err(CacheError::DuplicateKey(_))
        ));
        let bad = Entity::new("Northwind.Region").with_value("RegionID", "seven");
        assert!(matches!(
            em.attach_entity(bad, EntityState::Unchanged),
            Err(CacheError::TypeMismatch(_))
        ));
        assert_eq!(em.len(), 1);
    }

    #[test]
    fn test_state_machine() {
        let mut em = manager();
        let region = Entity::new("Northwind.Region")
            .with_value("RegionID", 1)
            .with_value("Description", "North");
        let id = em.attach_entity(region, EntityState::Unchanged).unwrap();

        em.set_value(id, "Description", "South").unwrap();
        em.set_value(id, "Description", "East").unwrap();
        let entity = em.get_entity(id).unwrap();
        assert!(entity.state().is_modified());
        assert_eq!(entity.aspect().original_values()["Description"], Value::from("North"));

        em.reject_changes(id).unwrap();
        let entity = em.get_entity(id).unwrap();
        assert!(entity.state().is_unchanged());
        assert_eq!(entity.get("Description"), &Value::from("North"));

        em.delete_entity(id).unwrap();
        assert!(em.get_entity(id).unwrap().state().is_deleted());
        assert!(em.has_changes());
        em.accept_changes(id).unwrap();
        assert!(em.get_entity(id).is_none());

        let added = Entity::new("Northwind.Region").with_value("RegionID", 2);
        let added = em.add_entity(added).unwrap();
        em.delete_entity(added).unwrap();
        assert!(em.get_entity(added).is_none());
        assert!(!em.has_changes());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let mut em = manager();
        let region = Entity::new("Northwind.Region").with_value("RegionID", 1);
        let id = em.attach_entity(region, EntityState::Unchanged).unwrap();
        let detached = em.detach_entity(id).unwrap();
        assert!(detached.state().is_detached());
        assert!(detached.aspect().manager().is_none());
        assert!(em.detach_entity(id).is_none());
        // a detached entity can be attached again
        em.attach_entity(detached, EntityState::Modified).unwrap();
    }

    #[test]
    fn test_foreign_key_links_navigation() {
        let mut em = manager();
        let customer = em.create_entity("Customer").unwrap();
        let customer = em.add_entity(customer).unwrap();
        let customer_key = em.key_of(customer).unwrap();

        let order = em.create_entity("Order").unwrap();
        let order = em.add_entity(order).unwrap();
        em.set_value(order, "CustomerID", customer_key.values()[0].clone()).unwrap();
        assert_eq!(em.get_entity(order).unwrap().related("Customer"), Some(customer));
        assert_eq!(em.get_entity(customer).unwrap().related_collection("Orders"), &[order]);

        em.set_navigation(order, "Customer", None).unwrap();
        assert!(em.get_entity(customer).unwrap().related_collection("Orders").is_empty());
        assert!(em.get_entity(order).unwrap().get("CustomerID").is_null());

        em.set_navigation(order, "Customer", Some(customer)).unwrap();
        assert_eq!(em.get_entity(order).unwrap().get("CustomerID"), &customer_key.values()[0]);
    }

    #[test]
    fn test_key_change_reindexes() {
        let mut em = manager();
        let region = Entity::new("Northwind.Region").with_value("RegionID", 1);
        let id = em.add_entity(region).unwrap();
        em.set_value(id, "RegionID", 7).unwrap();
        assert!(em.find_by_key_values("Region", vec![Value::Integer(1)]).unwrap().is_none());
        assert_eq!(
            em.find_by_key_values("Region", vec![Value::Integer(7)]).unwrap().map(Entity::id),
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let mut em = manager();
        let mut events = em.subscribe();
        let region = Entity::new("Northwind.Region").with_value("RegionID", 1);
        let id = em.attach_entity(region, EntityState::Unchanged).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, EntityChanged::new(EntityAction::Attach, id));
    }

    #[tokio::test]
    async fn test_remote_query_without_service() {
        let mut em = manager();
        let query = EntityQuery::from("Orders");
        assert!(matches!(em.execute_query(&query).await, Err(CacheError::NoDataService)));
    }
}
