// ============================================================================
// Merge pipeline
// ============================================================================
//
// Turns raw result nodes into cached entities. Each node is classified by
// the results adapter, then either
//   - skipped (deferred content),
//   - resolved as a reference to a node seen earlier in the same response,
//   - merged into the entity with the same key, or attached as a new one,
//   - or returned as a plain value for projections.
//
// References to nodes that appear later in the response are collected and
// resolved once every node has been visited, so forward and backward
// references link the same way.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};

use tracing::{Level, event, info_span};

use super::{EntityManager, LoadingScope};
use crate::config::MergeStrategy;
use crate::core::{CacheError, Result, Value};
use crate::entity::{EntityAction, EntityChanged, EntityId, EntityState};
use crate::metadata::{EntityType, MetadataStore, NavigationProperty};
use crate::query::EntityQuery;
use crate::result::{ProjectionValue, QueryResult, QueryRow};
use crate::transport::{NodeContext, NodeMeta, QueryRequest, QueryResponse};

/// A query rendered for the data service, together with what the merge
/// step needs once the response arrives.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub request: QueryRequest,
    query: EntityQuery,
    merge_strategy: MergeStrategy,
}

impl PreparedQuery {
    pub fn query(&self) -> &EntityQuery {
        &self.query
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }
}

/// A navigation whose target is referenced by id before the target node
/// has been read.
#[derive(Debug, Clone)]
pub(crate) struct DeferredLink {
    owner: EntityId,
    navigation: NavigationProperty,
    ref_id: String,
}

/// State shared by every node of one merge.
#[derive(Debug)]
pub(crate) struct MergeContext {
    pub strategy: MergeStrategy,
    pub attach_action: EntityAction,
    pub merge_action: EntityAction,
    pub ref_map: HashMap<String, EntityId>,
    pub deferred: Vec<DeferredLink>,
    pub merged: Vec<EntityId>,
}

impl MergeContext {
    pub fn new(strategy: MergeStrategy, attach_action: EntityAction, merge_action: EntityAction) -> Self {
        Self {
            strategy,
            attach_action,
            merge_action,
            ref_map: HashMap::new(),
            deferred: Vec::new(),
            merged: Vec::new(),
        }
    }

    fn record(&mut self, id: EntityId) {
        if !self.merged.contains(&id) {
            self.merged.push(id);
        }
    }
}

/// Outcome of visiting one node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Merged {
    Entity(EntityId),
    /// Reference to a node not read yet.
    Pending(String),
    Value(Value),
    Ignored,
}

/// Projection field waiting on a forward reference.
struct PendingField {
    row: usize,
    field: String,
    ref_id: String,
    many: bool,
}

enum TopLevel {
    Row(QueryRow),
    Pending(String),
}

impl EntityManager {
    /// Validate and render a query without touching the cache.
    pub fn prepare_query(&self, query: &EntityQuery) -> Result<PreparedQuery> {
        let store = self.metadata();
        let entity_type_name = query.resolve_entity_type(store);
        if entity_type_name.is_some() {
            query.validate(store)?;
        }
        let uri = query.to_uri(store)?;
        let resource_name = query
            .resource_name()
            .map(str::to_string)
            .or_else(|| entity_type_name.as_deref().and_then(|t| store.default_resource_name(t)))
            .unwrap_or_default();
        let merge_strategy = query
            .query_options()
            .and_then(|o| o.merge_strategy)
            .unwrap_or(self.config().merge_strategy);

        Ok(PreparedQuery {
            request: QueryRequest {
                service_name: self.config().service_name.clone(),
                uri,
                resource_name,
                entity_type_name,
                inline_count: query.is_inline_count(),
            },
            query: query.clone(),
            merge_strategy,
        })
    }

    /// Merge a query response into the cache and build the result rows.
    pub fn merge_query_response(&mut self, prepared: &PreparedQuery, response: QueryResponse) -> Result<QueryResult> {
        let span = info_span!("merge_query", uri = %prepared.request.uri, nodes = response.results.len());
        let _guard = span.enter();

        let projection = !prepared.query.select_paths().is_empty();
        let expected = if projection {
            None
        } else {
            prepared.request.entity_type_name.clone()
        };
        let strategy = prepared.merge_strategy;

        let rows = self.with_atomic_loading(|em, scope| {
            let mut ctx = MergeContext::new(strategy, EntityAction::AttachOnQuery, EntityAction::MergeOnQuery);
            let mut top = Vec::with_capacity(response.results.len());
            let mut pending_fields = Vec::new();

            for node in &response.results {
                let meta = em.classify(node, expected.as_deref(), None);
                if meta.entity_type.is_some() || meta.node_ref_id.is_some() {
                    match em.merge_classified(node, meta, &mut ctx, scope)? {
                        Merged::Entity(id) => top.push(TopLevel::Row(QueryRow::Entity(id))),
                        Merged::Pending(r) => top.push(TopLevel::Pending(r)),
                        Merged::Value(_) | Merged::Ignored => {}
                    }
                    continue;
                }
                if meta.ignore {
                    continue;
                }
                let mut row = BTreeMap::new();
                match node.as_object() {
                    Some(object) => {
                        let mut refs = Vec::new();
                        em.project_object("", object, &mut row, &mut refs, &mut ctx, scope)?;
                        let index = top.len();
                        pending_fields.extend(refs.into_iter().map(|(field, ref_id, many)| PendingField {
                            row: index,
                            field,
                            ref_id,
                            many,
                        }));
                    }
                    None => {
                        row.insert("value".to_string(), ProjectionValue::Value(Value::from_json(node)));
                    }
                }
                top.push(TopLevel::Row(QueryRow::Projection(row)));
            }

            em.finish_merge(&mut ctx, scope)?;

            let mut rows: Vec<Option<QueryRow>> = top
                .into_iter()
                .map(|t| match t {
                    TopLevel::Row(row) => Some(row),
                    TopLevel::Pending(r) => match ctx.ref_map.get(&r) {
                        Some(id) => Some(QueryRow::Entity(*id)),
                        None => {
                            log::warn!("Result references unknown node '{}'", r);
                            None
                        }
                    },
                })
                .collect();
            for pending in pending_fields {
                let Some(target) = ctx.ref_map.get(&pending.ref_id).copied() else {
                    log::warn!("Projection field '{}' references unknown node '{}'", pending.field, pending.ref_id);
                    continue;
                };
                if let Some(Some(QueryRow::Projection(row))) = rows.get_mut(pending.row) {
                    if let (true, Some(ProjectionValue::Entities(ids))) = (pending.many, row.get_mut(&pending.field)) {
                        ids.push(target);
                    } else {
                        row.insert(pending.field, ProjectionValue::Entity(Some(target)));
                    }
                }
            }
            Ok(rows.into_iter().flatten().collect::<Vec<_>>())
        })?;

        let inline_count = if prepared.request.inline_count {
            response.inline_count
        } else {
            None
        };
        event!(Level::DEBUG, rows = rows.len(), "Query merged");
        Ok(QueryResult::new(rows, inline_count))
    }

    fn classify(&self, node: &serde_json::Value, expected: Option<&str>, navigation: Option<&str>) -> NodeMeta {
        let context = NodeContext {
            store: self.metadata(),
            expected_type: expected,
            navigation,
        };
        self.adapter().visit_node(node, &context)
    }

    /// Visit one node: skip it, resolve a reference, merge an entity, or
    /// read a plain value.
    pub(crate) fn visit_and_merge(
        &mut self,
        node: &serde_json::Value,
        expected: Option<&str>,
        navigation: Option<&str>,
        ctx: &mut MergeContext,
        scope: &LoadingScope,
    ) -> Result<Merged> {
        let meta = self.classify(node, expected, navigation);
        self.merge_classified(node, meta, ctx, scope)
    }

    fn merge_classified(
        &mut self,
        node: &serde_json::Value,
        meta: NodeMeta,
        ctx: &mut MergeContext,
        scope: &LoadingScope,
    ) -> Result<Merged> {
        if meta.ignore {
            return Ok(Merged::Ignored);
        }
        if let Some(ref_id) = meta.node_ref_id {
            return Ok(match ctx.ref_map.get(&ref_id) {
                Some(id) => Merged::Entity(*id),
                None => Merged::Pending(ref_id),
            });
        }
        match meta.entity_type.clone() {
            Some(type_name) if node.is_object() => self
                .merge_entity(node, &type_name, &meta, ctx, scope)
                .map(Merged::Entity),
            _ => Ok(Merged::Value(Value::from_json(node))),
        }
    }

    /// Merge one entity node and, recursively, the nodes nested under its
    /// navigation properties.
    pub(crate) fn merge_entity(
        &mut self,
        node: &serde_json::Value,
        type_name: &str,
        meta: &NodeMeta,
        ctx: &mut MergeContext,
        scope: &LoadingScope,
    ) -> Result<EntityId> {
        let store = self.metadata_arc();
        let entity_type = store.entity_type(type_name)?;
        let object = node
            .as_object()
            .ok_or_else(|| CacheError::MergeInconsistency(format!("{} node is not an object", type_name)))?;
        let values = self.read_values(&store, &entity_type, object)?;

        let key_values = entity_type
            .key_properties()
            .iter()
            .map(|p| values.get(&p.name).cloned().unwrap_or(Value::Null))
            .collect();
        let key = entity_type.key_from_values(key_values);
        if key.has_null_part() {
            return Err(CacheError::MergeInconsistency(format!(
                "{} node without a complete key",
                entity_type.name()
            )));
        }

        let (id, overwritten) = match self.find_id_by_key(&key) {
            Some(id) => {
                let overwritten = self.merge_into_existing(id, &entity_type, values, meta, ctx)?;
                (id, overwritten)
            }
            None => {
                let mut entity = store.create_entity(entity_type.name())?;
                for (name, value) in values {
                    entity.write_value(&name, value);
                }
                entity.aspect.manager = Some(self.id());
                entity.aspect.state = EntityState::Unchanged;
                entity.aspect.loaded_from_server = true;
                entity.aspect.extra_metadata = meta.extra_metadata.clone();
                let id = entity.id();
                self.find_or_create_group(entity_type.name()).attach(&key, id)?;
                self.entities.insert(id, entity);
                self.notify(EntityChanged::new(ctx.attach_action, id));
                (id, true)
            }
        };
        if let Some(node_id) = &meta.node_id {
            ctx.ref_map.insert(node_id.clone(), id);
        }
        ctx.record(id);

        let convention = store.naming_convention();
        for nav in entity_type.navigation_properties() {
            let Some(raw) = object.get(&convention.client_to_server(&nav.name)) else {
                continue;
            };
            if !overwritten && nav.is_scalar && self.has_preserved_foreign_key(id, nav) {
                continue;
            }
            let items: Vec<&serde_json::Value> = match raw {
                serde_json::Value::Null => Vec::new(),
                serde_json::Value::Array(items) => items.iter().collect(),
                serde_json::Value::Object(o) if !nav.is_scalar => match o.get("results") {
                    Some(serde_json::Value::Array(items)) => items.iter().collect(),
                    _ => Vec::new(),
                },
                other => vec![other],
            };
            for item in items {
                match self.visit_and_merge(item, Some(&nav.entity_type_name), Some(&nav.name), ctx, scope)? {
                    Merged::Entity(target) => self.link_loaded(id, nav, target)?,
                    Merged::Pending(ref_id) => ctx.deferred.push(DeferredLink {
                        owner: id,
                        navigation: nav.clone(),
                        ref_id,
                    }),
                    Merged::Value(_) | Merged::Ignored => {}
                }
            }
        }
        Ok(id)
    }

    /// Data property values of a node, keyed by client property name.
    /// Fields the type does not declare are kept as untyped values.
    fn read_values(
        &self,
        store: &MetadataStore,
        entity_type: &EntityType,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let convention = store.naming_convention();
        let adapter = self.adapter();
        let mut values = BTreeMap::new();
        for property in entity_type.data_properties() {
            if property.is_unmapped {
                continue;
            }
            let Some(raw) = object.get(&convention.client_to_server(&property.name)) else {
                continue;
            };
            let value = match &property.complex_type_name {
                Some(ct) => parse_complex(store, ct, raw)?,
                None => property.data_type.parse_json(raw)?,
            };
            values.insert(property.name.clone(), value);
        }
        for (name, raw) in object {
            if adapter.is_annotation(name) {
                continue;
            }
            let client = convention.server_to_client(name);
            if entity_type.data_property(&client).is_none() && entity_type.navigation_property(&client).is_none() {
                values.insert(client, Value::from_json(raw));
            }
        }
        Ok(values)
    }

    /// Apply server values to a cached entity. Returns true when the
    /// entity was overwritten rather than preserved.
    fn merge_into_existing(
        &mut self,
        id: EntityId,
        entity_type: &EntityType,
        values: BTreeMap<String, Value>,
        meta: &NodeMeta,
        ctx: &MergeContext,
    ) -> Result<bool> {
        let entity = self.entities.get_mut(&id).ok_or(CacheError::EntityNotFound(id))?;
        let overwrite = ctx.strategy == MergeStrategy::OverwriteChanges || entity.state().is_unchanged();
        if !overwrite {
            // local changes win; only fill in what was never loaded
            for (name, value) in values {
                if !entity.has_value(&name) {
                    entity.write_value(&name, value);
                }
            }
            return Ok(false);
        }

        let foreign_keys = entity_type.foreign_key_names();
        let mut changed_foreign_keys = Vec::new();
        for (name, value) in values {
            if foreign_keys.contains(&name.as_str()) && *entity.get(&name) != value {
                changed_foreign_keys.push(name.clone());
            }
            entity.write_value(&name, value);
        }
        entity.aspect.accept();
        entity.aspect.loaded_from_server = true;
        if meta.extra_metadata.is_some() {
            entity.aspect.extra_metadata = meta.extra_metadata.clone();
        }
        self.notify(EntityChanged::new(ctx.merge_action, id));
        for name in changed_foreign_keys {
            self.relink_foreign_key(id, &name)?;
        }
        Ok(true)
    }

    /// Link a navigation read from a response. Foreign keys the node left
    /// out are filled from the related entity's key, so resolving foreign
    /// keys afterwards keeps the link.
    fn link_loaded(&mut self, owner: EntityId, nav: &NavigationProperty, target: EntityId) -> Result<()> {
        self.link_navigation(owner, nav, target);
        let (child, parent, foreign_keys) = if nav.is_scalar {
            (owner, target, &nav.foreign_key_names)
        } else {
            (target, owner, &nav.inv_foreign_key_names)
        };
        if foreign_keys.is_empty() {
            return Ok(());
        }
        let parent_key = self.key_of(parent)?;
        if let Some(entity) = self.entities.get_mut(&child) {
            for (fk, value) in foreign_keys.iter().zip(parent_key.values()) {
                // a key cleared locally stays cleared
                if entity.get(fk).is_null() && !entity.aspect.original_values.contains_key(fk) {
                    entity.write_value(fk, value.clone());
                }
            }
        }
        Ok(())
    }

    fn has_preserved_foreign_key(&self, id: EntityId, nav: &NavigationProperty) -> bool {
        self.entities.get(&id).is_some_and(|e| {
            nav.foreign_key_names
                .iter()
                .any(|fk| e.aspect.original_values.contains_key(fk))
        })
    }

    /// Flatten a non-entity object into projection fields. Nested plain
    /// objects contribute `outer_inner` fields.
    fn project_object(
        &mut self,
        prefix: &str,
        object: &serde_json::Map<String, serde_json::Value>,
        row: &mut BTreeMap<String, ProjectionValue>,
        refs: &mut Vec<(String, String, bool)>,
        ctx: &mut MergeContext,
        scope: &LoadingScope,
    ) -> Result<()> {
        let convention = self.metadata().naming_convention();
        let adapter = self.adapter();
        for (name, raw) in object {
            if adapter.is_annotation(name) {
                continue;
            }
            let client = convention.server_to_client(name);
            let field = if prefix.is_empty() {
                client
            } else {
                format!("{}_{}", prefix, client)
            };
            match raw {
                serde_json::Value::Array(items) => {
                    let mut ids = Vec::new();
                    let mut values = Vec::new();
                    for item in items {
                        match self.visit_and_merge(item, None, None, ctx, scope)? {
                            Merged::Entity(id) => ids.push(id),
                            Merged::Pending(ref_id) => refs.push((field.clone(), ref_id, true)),
                            Merged::Value(v) => values.push(v),
                            Merged::Ignored => {}
                        }
                    }
                    let value = if values.is_empty() {
                        ProjectionValue::Entities(ids)
                    } else {
                        ProjectionValue::Value(Value::from_json(raw))
                    };
                    row.insert(field, value);
                }
                serde_json::Value::Object(nested) => {
                    let meta = self.classify(raw, None, None);
                    if meta.entity_type.is_some() || meta.node_ref_id.is_some() {
                        match self.merge_classified(raw, meta, ctx, scope)? {
                            Merged::Entity(id) => {
                                row.insert(field, ProjectionValue::Entity(Some(id)));
                            }
                            Merged::Pending(ref_id) => {
                                row.insert(field.clone(), ProjectionValue::Entity(None));
                                refs.push((field, ref_id, false));
                            }
                            Merged::Value(v) => {
                                row.insert(field, ProjectionValue::Value(v));
                            }
                            Merged::Ignored => {}
                        }
                    } else if !meta.ignore {
                        self.project_object(&field, nested, row, refs, ctx, scope)?;
                    }
                }
                other => {
                    row.insert(field, ProjectionValue::Value(Value::from_json(other)));
                }
            }
        }
        Ok(())
    }

    /// Resolve references collected during the merge and connect every
    /// merged entity to the rest of the cache.
    pub(crate) fn finish_merge(&mut self, ctx: &mut MergeContext, _scope: &LoadingScope) -> Result<()> {
        for link in std::mem::take(&mut ctx.deferred) {
            match ctx.ref_map.get(&link.ref_id) {
                Some(target) => self.link_loaded(link.owner, &link.navigation, *target)?,
                None => log::warn!(
                    "Unresolved reference '{}' on {}.{}",
                    link.ref_id,
                    link.owner,
                    link.navigation.name
                ),
            }
        }
        for id in ctx.merged.clone() {
            if self.entities.contains_key(&id) {
                self.link_related_entities(id)?;
            }
        }
        Ok(())
    }
}

/// Read a complex-typed value. A null node yields the type's default.
fn parse_complex(store: &MetadataStore, complex_type: &str, raw: &serde_json::Value) -> Result<Value> {
    if raw.is_null() {
        return store.complex_default(complex_type);
    }
    let complex = store.complex_type(complex_type)?;
    let convention = store.naming_convention();
    let mut fields = BTreeMap::new();
    for property in complex.data_properties() {
        let field = raw
            .get(convention.client_to_server(&property.name).as_str())
            .unwrap_or(&serde_json::Value::Null);
        let value = match &property.complex_type_name {
            Some(ct) => parse_complex(store, ct, field)?,
            None => property.data_type.parse_json(field)?,
        };
        fields.insert(property.name.clone(), value);
    }
    Ok(Value::Complex(fields))
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use super::*;
    use crate::config::QueryOptions;
    use serde_json::json;

    fn customer_node(id: &str, name: &str) -> serde_json::Value {
        json!({"$id": "c1", "$type": "Northwind.Customer", "CustomerID": id, "CompanyName": name})
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut em = manager();
        let id = uuid::Uuid::new_v4().to_string();
        let prepared = em.prepare_query(&EntityQuery::from("Customers")).unwrap();
        let response = QueryResponse::new(vec![customer_node(&id, "Alfreds")]);
        let first = em.merge_query_response(&prepared, response.clone()).unwrap();
        let second = em.merge_query_response(&prepared, response).unwrap();
        assert_eq!(first.entity_ids(), second.entity_ids());
        assert_eq!(em.len(), 1);
        let entity = em.get_entity(first.entity_ids()[0]).unwrap();
        assert!(entity.state().is_unchanged());
        assert!(entity.aspect().loaded_from_server());
    }

    #[test]
    fn test_preserve_and_overwrite_strategies() {
        let mut em = manager();
        let key = uuid::Uuid::new_v4().to_string();
        let prepared = em.prepare_query(&EntityQuery::from("Customers")).unwrap();
        let loaded = em
            .merge_query_response(&prepared, QueryResponse::new(vec![customer_node(&key, "Alfreds")]))
            .unwrap();
        let id = loaded.entity_ids()[0];
        em.set_value(id, "CompanyName", "Local").unwrap();

        let server = QueryResponse::new(vec![customer_node(&key, "Server")]);
        em.merge_query_response(&prepared, server.clone()).unwrap();
        assert_eq!(em.get_entity(id).unwrap().get("CompanyName"), &Value::from("Local"));
        assert!(em.get_entity(id).unwrap().state().is_modified());

        let overwrite = em
            .prepare_query(&EntityQuery::from("Customers").using(QueryOptions::new().merge_strategy(MergeStrategy::OverwriteChanges)))
            .unwrap();
        em.merge_query_response(&overwrite, server).unwrap();
        assert_eq!(em.get_entity(id).unwrap().get("CompanyName"), &Value::from("Server"));
        assert!(em.get_entity(id).unwrap().state().is_unchanged());
    }

    #[test]
    fn test_nested_graph_with_back_reference() {
        let mut em = manager();
        let key = uuid::Uuid::new_v4().to_string();
        let node = json!({
            "$id": "1",
            "$type": "Northwind.Customer",
            "CustomerID": key,
            "Orders": [
                {"$id": "2", "$type": "Northwind.Order", "OrderID": 10, "CustomerID": key, "Customer": {"$ref": "1"}},
                {"$id": "3", "$type": "Northwind.Order", "OrderID": 11, "CustomerID": key, "Customer": {"$ref": "1"}}
            ]
        });
        let prepared = em.prepare_query(&EntityQuery::from("Customers")).unwrap();
        let result = em.merge_query_response(&prepared, QueryResponse::new(vec![node])).unwrap();
        let customer = result.entity_ids()[0];
        assert_eq!(em.len(), 3);
        assert_eq!(em.get_entity(customer).unwrap().related_collection("Orders").len(), 2);
        assert!(em.unattached.is_empty());
    }

    #[test]
    fn test_missing_key_is_inconsistent() {
        let mut em = manager();
        let prepared = em.prepare_query(&EntityQuery::from("Orders")).unwrap();
        let err = em
            .merge_query_response(&prepared, QueryResponse::new(vec![json!({"Freight": 3})]))
            .unwrap_err();
        assert!(matches!(err, CacheError::MergeInconsistency(_)));
        assert!(!em.is_loading());
    }

    #[test]
    fn test_projection_rows() {
        let mut em = manager();
        let query = EntityQuery::from("Orders").select("OrderID, Freight");
        let prepared = em.prepare_query(&query).unwrap();
        let result = em
            .merge_query_response(
                &prepared,
                QueryResponse::new(vec![json!({"OrderID": 1, "Freight": 4.5, "Ship": {"City": "Lyon"}})]),
            )
            .unwrap();
        assert!(em.is_empty());
        let row = result.results[0].as_projection().unwrap();
        assert_eq!(row["OrderID"].as_value(), Some(&Value::Integer(1)));
        assert_eq!(row["Ship_City"].as_value(), Some(&Value::from("Lyon")));
    }
}
