// ============================================================================
// EntityQuery
// ============================================================================
//
// Immutable query descriptor. Every builder method borrows the receiver and
// returns a new query, so a base query can be refined in several directions:
//
//   let orders = EntityQuery::from_resource("Orders");
//   let heavy = orders.where_clause("Freight", "gt", 100)?;
//   let page = heavy.order_by("ShipCity desc")?.skip(2).take(3);
//
// A query renders to a remote URI (`to_uri` / `to_url`) or runs over a set
// of candidate entities (`execute_over`), which is what local execution in
// the manager uses.
//
// ============================================================================

use std::collections::BTreeMap;

use im::Vector;
use url::Url;

use super::{Operand, OrderByClause, Predicate, SortExecutor};
use crate::config::QueryOptions;
use crate::core::{CacheError, Result};
use crate::entity::Entity;
use crate::evaluator::EvaluationContext;
use crate::metadata::MetadataStore;
use crate::result::{projection_field_name, ProjectionValue, QueryResult, QueryRow};

#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    resource_name: Option<String>,
    entity_type_name: Option<String>,
    where_predicate: Option<Predicate>,
    order_by: Option<OrderByClause>,
    select: Option<Vector<String>>,
    expand: Option<Vector<String>>,
    skip: Option<usize>,
    take: Option<usize>,
    parameters: BTreeMap<String, serde_json::Value>,
    inline_count: bool,
    query_options: Option<QueryOptions>,
}

impl From<&str> for EntityQuery {
    fn from(resource: &str) -> Self {
        Self::from_resource(resource)
    }
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resource(resource: impl Into<String>) -> Self {
        Self {
            resource_name: Some(resource.into()),
            ..Self::default()
        }
    }

    // ========================================================================
    // Builders
    // ========================================================================

    /// Set the resource name. It can be set once per lineage; setting the
    /// same name again is allowed.
    pub fn with_resource_name(&self, resource: &str) -> Result<Self> {
        match &self.resource_name {
            Some(existing) if existing != resource => {
                Err(CacheError::ResourceNameAlreadySet(existing.clone()))
            }
            _ => Ok(Self {
                resource_name: Some(resource.to_string()),
                ..self.clone()
            }),
        }
    }

    /// Bind the query to an entity type instead of resolving it from the
    /// resource name.
    pub fn for_type(&self, type_name: &str) -> Self {
        Self {
            entity_type_name: Some(type_name.to_string()),
            ..self.clone()
        }
    }

    /// AND `predicate` with the current filter.
    pub fn where_(&self, predicate: &Predicate) -> Self {
        let combined = match &self.where_predicate {
            Some(existing) => existing.and(predicate),
            None => predicate.clone(),
        };
        Self {
            where_predicate: Some(combined),
            ..self.clone()
        }
    }

    pub fn where_clause(&self, left: &str, operator: &str, right: impl Into<Operand>) -> Result<Self> {
        Ok(self.where_(&Predicate::new(left, operator, right)?))
    }

    /// Append sort keys, e.g. `"ShipCity desc, OrderID"`.
    pub fn order_by(&self, text: &str) -> Result<Self> {
        self.append_order_by(OrderByClause::parse(text, false)?)
    }

    /// Append sort keys, descending unless a key says `asc`.
    pub fn order_by_desc(&self, text: &str) -> Result<Self> {
        self.append_order_by(OrderByClause::parse(text, true)?)
    }

    fn append_order_by(&self, clause: OrderByClause) -> Result<Self> {
        let order_by = match &self.order_by {
            Some(existing) => existing.append(&clause),
            None => clause,
        };
        Ok(Self {
            order_by: Some(order_by),
            ..self.clone()
        })
    }

    /// Project onto comma-separated property paths. An empty string clears
    /// the projection.
    pub fn select(&self, paths: &str) -> Self {
        Self {
            select: split_paths(paths),
            ..self.clone()
        }
    }

    /// Navigation paths the server should include. An empty string clears.
    pub fn expand(&self, paths: &str) -> Self {
        Self {
            expand: split_paths(paths),
            ..self.clone()
        }
    }

    /// `None` clears.
    pub fn skip(&self, count: impl Into<Option<usize>>) -> Self {
        Self {
            skip: count.into(),
            ..self.clone()
        }
    }

    /// `None` clears.
    pub fn take(&self, count: impl Into<Option<usize>>) -> Self {
        Self {
            take: count.into(),
            ..self.clone()
        }
    }

    /// Free-form parameters appended to the remote query string.
    pub fn with_parameters(&self, parameters: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            parameters,
            ..self.clone()
        }
    }

    pub fn inline_count(&self, enabled: bool) -> Self {
        Self {
            inline_count: enabled,
            ..self.clone()
        }
    }

    pub fn using(&self, options: QueryOptions) -> Self {
        Self {
            query_options: Some(options),
            ..self.clone()
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn resource_name(&self) -> Option<&str> {
        self.resource_name.as_deref()
    }

    pub fn entity_type_name(&self) -> Option<&str> {
        self.entity_type_name.as_deref()
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.where_predicate.as_ref()
    }

    pub fn order_by_clause(&self) -> Option<&OrderByClause> {
        self.order_by.as_ref()
    }

    pub fn select_paths(&self) -> Vec<&str> {
        self.select.iter().flatten().map(String::as_str).collect()
    }

    pub fn expand_paths(&self) -> Vec<&str> {
        self.expand.iter().flatten().map(String::as_str).collect()
    }

    pub fn skip_count(&self) -> Option<usize> {
        self.skip
    }

    pub fn take_count(&self) -> Option<usize> {
        self.take
    }

    pub fn parameters(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.parameters
    }

    pub fn is_inline_count(&self) -> bool {
        self.inline_count
    }

    pub fn query_options(&self) -> Option<&QueryOptions> {
        self.query_options.as_ref()
    }

    /// Entity type the query targets: the bound type, else the type mapped
    /// to the resource name.
    pub fn resolve_entity_type(&self, store: &MetadataStore) -> Option<String> {
        match &self.entity_type_name {
            Some(t) => store.find_entity_type(t).map(|t| t.name().to_string()),
            None => self
                .resource_name
                .as_deref()
                .and_then(|r| store.entity_type_name_for_resource(r)),
        }
    }

    /// Like [`EntityQuery::resolve_entity_type`] but fails when nothing resolves.
    pub fn require_entity_type(&self, store: &MetadataStore) -> Result<String> {
        self.resolve_entity_type(store).ok_or_else(|| {
            let name = self
                .entity_type_name
                .clone()
                .or_else(|| self.resource_name.clone())
                .unwrap_or_default();
            CacheError::UnknownType(name)
        })
    }

    /// Check every clause against the target type without rendering.
    pub fn validate(&self, store: &MetadataStore) -> Result<()> {
        let type_name = self.require_entity_type(store)?;
        if let Some(p) = &self.where_predicate {
            p.validate(store, &type_name)?;
        }
        if let Some(o) = &self.order_by {
            o.validate(store, &type_name)?;
        }
        for path in self.select_paths() {
            store.resolve_property_path(&type_name, path)?;
        }
        for path in self.expand_paths() {
            validate_expand_path(store, &type_name, path)?;
        }
        Ok(())
    }

    // ========================================================================
    // Remote rendering
    // ========================================================================

    /// Resource path plus unencoded query options, absent clauses omitted:
    /// `Orders?$filter=Freight gt 100m&$orderby=ShipCity desc&$skip=2&$top=3`.
    pub fn to_uri(&self, store: &MetadataStore) -> Result<String> {
        let (resource, pairs) = self.query_pairs(store)?;
        if pairs.is_empty() {
            return Ok(resource);
        }
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Ok(format!("{}?{}", resource, query.join("&")))
    }

    /// Percent-encoded URL relative to the service root `base`.
    pub fn to_url(&self, base: &Url, store: &MetadataStore) -> Result<Url> {
        let (resource, pairs) = self.query_pairs(store)?;
        let mut root = base.clone();
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        let mut url = root
            .join(&resource)
            .map_err(|e| CacheError::InvalidExpression(format!("Bad resource '{}': {}", resource, e)))?;
        if !pairs.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in &pairs {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn query_pairs(&self, store: &MetadataStore) -> Result<(String, Vec<(String, String)>)> {
        let type_name = self.resolve_entity_type(store);
        let resource = match (&self.resource_name, &type_name) {
            (Some(r), _) => r.clone(),
            (None, Some(t)) => store.default_resource_name(t).ok_or_else(|| {
                CacheError::InvalidState(format!("Type '{}' has no default resource name", t))
            })?,
            (None, None) => {
                return Err(CacheError::InvalidState(
                    "Query has neither a resource name nor an entity type".to_string(),
                ));
            }
        };
        let type_name = type_name.as_deref();
        let convention = store.naming_convention();

        let mut pairs = Vec::new();
        if let Some(p) = &self.where_predicate {
            pairs.push(("$filter".to_string(), p.to_odata(store, type_name)?));
        }
        if let Some(o) = &self.order_by
            && !o.is_empty()
        {
            pairs.push(("$orderby".to_string(), o.to_odata(store, type_name)?));
        }
        if let Some(skip) = self.skip {
            pairs.push(("$skip".to_string(), skip.to_string()));
        }
        if let Some(take) = self.take {
            pairs.push(("$top".to_string(), take.to_string()));
        }
        if let Some(expand) = &self.expand {
            let mut rendered = Vec::with_capacity(expand.len());
            for path in expand {
                if let Some(t) = type_name {
                    validate_expand_path(store, t, path)?;
                }
                rendered.push(convention.path_to_server(path, "/"));
            }
            pairs.push(("$expand".to_string(), rendered.join(",")));
        }
        if let Some(select) = &self.select {
            let mut rendered = Vec::with_capacity(select.len());
            for path in select {
                if let Some(t) = type_name {
                    store.resolve_property_path(t, path)?;
                }
                rendered.push(convention.path_to_server(path, "/"));
            }
            pairs.push(("$select".to_string(), rendered.join(",")));
        }
        if self.inline_count {
            pairs.push(("$inlinecount".to_string(), "allpages".to_string()));
        }
        for (key, value) in &self.parameters {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.push((key.clone(), value));
        }
        Ok((resource, pairs))
    }

    // ========================================================================
    // Local execution
    // ========================================================================

    /// Filter, order, page and project `candidates`.
    ///
    /// Skip and take apply to the filtered and ordered rows. The inline
    /// count, when requested, is the number of rows that passed the filter.
    pub fn execute_over(
        &self,
        store: &MetadataStore,
        candidates: Vec<&Entity>,
        ctx: &EvaluationContext<'_>,
    ) -> Result<QueryResult> {
        let type_name = self.require_entity_type(store)?;
        let filter = match &self.where_predicate {
            Some(p) => Some(p.to_local_fn(store, &type_name)?),
            None => None,
        };
        let sort_keys = match &self.order_by {
            Some(o) => o.compile(store, &type_name)?,
            None => Vec::new(),
        };
        let projection = match &self.select {
            Some(paths) => {
                let mut resolved = Vec::with_capacity(paths.len());
                for path in paths {
                    let property_path = store.resolve_property_path(&type_name, path)?;
                    let parts: Vec<String> = path.split(['.', '/']).map(|p| p.trim().to_string()).collect();
                    resolved.push((projection_field_name(path), parts, property_path));
                }
                Some(resolved)
            }
            None => None,
        };

        let filtered: Vec<&Entity> = match &filter {
            Some(f) => candidates.into_iter().filter(|e| f(*e, ctx)).collect(),
            None => candidates,
        };
        let sorted = SortExecutor::sort(filtered, &sort_keys, ctx);
        let inline_count = self.inline_count.then_some(sorted.len());

        let paged = sorted
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.take.unwrap_or(usize::MAX));

        let results = match &projection {
            None => paged.map(|e| QueryRow::Entity(e.id())).collect(),
            Some(fields) => paged
                .map(|entity| {
                    let row = fields
                        .iter()
                        .map(|(field, parts, path)| {
                            let value = if !path.is_navigation() {
                                ProjectionValue::Value(ctx.property_value(entity, parts))
                            } else {
                                let (last, parents) = match parts.split_last() {
                                    Some(split) => split,
                                    None => return (field.clone(), ProjectionValue::Entity(None)),
                                };
                                let owner = ctx.related_entity(entity, parents);
                                if path.is_collection() {
                                    let ids = owner.map(|o| o.related_collection(last).to_vec()).unwrap_or_default();
                                    ProjectionValue::Entities(ids)
                                } else {
                                    ProjectionValue::Entity(owner.and_then(|o| o.related(last)))
                                }
                            };
                            (field.clone(), value)
                        })
                        .collect();
                    QueryRow::Projection(row)
                })
                .collect(),
        };
        Ok(QueryResult::new(results, inline_count))
    }
}

fn split_paths(paths: &str) -> Option<Vector<String>> {
    let parsed: Vector<String> = paths
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if parsed.is_empty() { None } else { Some(parsed) }
}

fn validate_expand_path(store: &MetadataStore, type_name: &str, path: &str) -> Result<()> {
    // Each segment of an expand path is a navigation; collections may be
    // traversed, so resolve segment by segment.
    let mut current = store.entity_type(type_name)?;
    for part in path.split(['.', '/']).map(str::trim) {
        let nav = current
            .navigation_property(part)
            .ok_or_else(|| CacheError::UnknownProperty(current.name().to_string(), path.to_string()))?;
        current = store.entity_type(&nav.entity_type_name)?;
    }
    Ok(())
}
