// ============================================================================
// Metadata Store
// ============================================================================
//
// Holds the registered entity and complex types, the resource name map and
// the entity factories. Type descriptors may arrive in any order: one whose
// base type or complex property type is still unknown is parked under the
// awaited name and completed by a worklist once that type registers.
// Navigation properties pointing at unknown types are parked the same way.
//
// Managers share the store through `Arc<MetadataStore>` and mutate it with
// `Arc::make_mut`, so readers never take a lock.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entity_type::qualify;
use super::{
    ComplexType, DataProperty, EntityType, NamingConvention, NavigationProperty,
    StructuralType, StructuralTypeDef,
};
use crate::core::{CacheError, DataType, Result, Value};
use crate::entity::Entity;
use crate::evaluator::ComparisonOptions;

pub const METADATA_VERSION: &str = "1.0.5";

/// Builds the runtime instance for an entity type.
pub type EntityFactory = Arc<dyn Fn(&EntityType) -> Entity + Send + Sync>;

/// Result of `register_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The type and every parked type it unblocked, in completion order.
    Registered(Vec<String>),
    /// The descriptor waits for `awaiting` to register.
    Deferred { awaiting: String },
}

/// One step of a resolved property path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Data(DataProperty),
    Navigation(NavigationProperty),
}

impl PathSegment {
    pub fn name(&self) -> &str {
        match self {
            Self::Data(p) => &p.name,
            Self::Navigation(n) => &n.name,
        }
    }
}

/// A property path validated against a type.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyPath {
    pub segments: Vec<PathSegment>,
}

impl PropertyPath {
    pub fn names(&self) -> Vec<&str> {
        self.segments.iter().map(PathSegment::name).collect()
    }

    pub fn data_type(&self) -> DataType {
        match self.segments.last() {
            Some(PathSegment::Data(p)) => p.data_type,
            _ => DataType::Undefined,
        }
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self.segments.last(), Some(PathSegment::Navigation(_)))
    }

    /// True when the path ends in a collection navigation property.
    pub fn is_collection(&self) -> bool {
        matches!(self.segments.last(), Some(PathSegment::Navigation(n)) if !n.is_scalar)
    }

    pub fn last_navigation(&self) -> Option<&NavigationProperty> {
        match self.segments.last() {
            Some(PathSegment::Navigation(n)) => Some(n),
            _ => None,
        }
    }
}

/// Serialized form of a metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDocument {
    pub metadata_version: String,
    #[serde(default)]
    pub naming_convention: String,
    #[serde(default)]
    pub local_query_comparison_options: String,
    #[serde(default)]
    pub structural_types: Vec<StructuralTypeDef>,
    #[serde(default)]
    pub resource_entity_type_map: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MetadataStore {
    entity_types: HashMap<String, Arc<EntityType>>,
    complex_types: HashMap<String, Arc<ComplexType>>,
    /// Short name to qualified name; the first registration wins.
    short_names: HashMap<String, String>,
    registration_order: Vec<String>,
    /// Parked descriptors keyed by the qualified name they wait for.
    deferred: HashMap<String, Vec<StructuralTypeDef>>,
    /// (owner type, navigation name) keyed by the awaited target type.
    pending_navigations: HashMap<String, Vec<(String, String)>>,
    resource_to_type: HashMap<String, String>,
    factories: HashMap<String, EntityFactory>,
    naming_convention: NamingConvention,
    comparison_options: ComparisonOptions,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_naming_convention(mut self, convention: NamingConvention) -> Self {
        self.naming_convention = convention;
        self
    }

    pub fn with_comparison_options(mut self, options: ComparisonOptions) -> Self {
        self.comparison_options = options;
        self
    }

    pub fn naming_convention(&self) -> NamingConvention {
        self.naming_convention
    }

    pub fn comparison_options(&self) -> &ComparisonOptions {
        &self.comparison_options
    }

    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty() && self.complex_types.is_empty()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an entity or complex type descriptor.
    ///
    /// If the base type or a complex property type is unknown the descriptor
    /// is parked and `Deferred` is returned. Registering the awaited type
    /// later completes everything it unblocks. A descriptor that would close
    /// a wait cycle fails with `CyclicTypeDependency`.
    pub fn register_type(&mut self, def: StructuralTypeDef) -> Result<RegistrationOutcome> {
        let name = def.qualified_name();
        if self.is_registered(&name) || self.is_deferred(&name) {
            return Err(CacheError::DuplicateType(name));
        }

        if let Some(awaited) = self.awaited_dependency(&def) {
            self.park(def, awaited.clone())?;
            return Ok(RegistrationOutcome::Deferred { awaiting: awaited });
        }

        // completing may unblock parked types; any failure keeps the store as it was
        let mut staged = self.clone();
        let completed = staged.complete_with_dependents(def)?;
        *self = staged;
        Ok(RegistrationOutcome::Registered(completed))
    }

    /// Complete `def`, then every parked descriptor it transitively unblocks.
    fn complete_with_dependents(&mut self, def: StructuralTypeDef) -> Result<Vec<String>> {
        let name = def.qualified_name();
        self.complete(def)?;
        let mut completed = vec![name.clone()];
        let mut worklist = vec![name];
        while let Some(ready) = worklist.pop() {
            self.resolve_pending_navigations(&ready);
            for parked in self.deferred.remove(&ready).unwrap_or_default() {
                match self.awaited_dependency(&parked) {
                    Some(next) => self.park(parked, next)?,
                    None => {
                        let parked_name = parked.qualified_name();
                        self.complete(parked)?;
                        debug!(type_name = %parked_name, unblocked_by = %ready, "Completed deferred type");
                        completed.push(parked_name.clone());
                        worklist.push(parked_name);
                    }
                }
            }
        }
        Ok(completed)
    }

    /// Add a property to a registered entity type. Only unmapped properties
    /// may be added once a type is registered.
    pub fn add_property(&mut self, type_name: &str, property: DataProperty) -> Result<()> {
        let name = self.entity_type(type_name)?.name.clone();
        if !property.is_unmapped {
            return Err(CacheError::AlreadySealed(name, property.name));
        }
        if let Some(existing) = self.entity_types.get(&name)
            && existing.data_property(&property.name).is_some()
        {
            return Err(CacheError::InvalidMetadata(format!(
                "Property '{}' already exists on '{}'",
                property.name, name
            )));
        }

        if let Some(ty) = self.entity_types.get_mut(&name) {
            Arc::make_mut(ty).descriptor.data_properties.push(property.clone());
        }
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if let Some(ty) = self.entity_types.get_mut(&current) {
                let ty = Arc::make_mut(ty);
                ty.data_properties.push(property.clone());
                stack.extend(ty.subtype_names.iter().cloned());
            }
        }
        Ok(())
    }

    fn is_registered(&self, name: &str) -> bool {
        self.entity_types.contains_key(name) || self.complex_types.contains_key(name)
    }

    fn is_deferred(&self, name: &str) -> bool {
        self.deferred
            .values()
            .flatten()
            .any(|d| d.qualified_name() == name)
    }

    /// Names of descriptors still waiting on another type.
    pub fn deferred_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .deferred
            .values()
            .flatten()
            .map(StructuralTypeDef::qualified_name)
            .collect();
        names.sort();
        names
    }

    fn normalize_type_name(&self, name: &str, namespace: &str) -> String {
        if let Some((short, ns)) = name.split_once(":#") {
            return qualify(short, ns);
        }
        if name.contains('.') {
            return name.to_string();
        }
        if let Some(qualified) = self.short_names.get(name) {
            return qualified.clone();
        }
        qualify(name, namespace)
    }

    fn awaited_dependency(&self, def: &StructuralTypeDef) -> Option<String> {
        if !def.is_complex_type
            && let Some(base) = &def.base_type_name
        {
            let base = self.normalize_type_name(base, &def.namespace);
            if !self.entity_types.contains_key(&base) {
                return Some(base);
            }
        }
        def.data_properties
            .iter()
            .filter_map(|p| p.complex_type_name.as_deref())
            .map(|ct| self.normalize_type_name(ct, &def.namespace))
            .find(|ct| !self.complex_types.contains_key(ct))
    }

    fn park(&mut self, def: StructuralTypeDef, awaited: String) -> Result<()> {
        let name = def.qualified_name();
        if let Some(cycle) = self.find_cycle(&name, &awaited) {
            return Err(CacheError::CyclicTypeDependency(cycle));
        }
        debug!(type_name = %name, awaiting = %awaited, "Deferring type registration");
        self.deferred.entry(awaited).or_default().push(def);
        Ok(())
    }

    /// Follow wait edges from `awaited`; a path back to `name` is a cycle.
    fn find_cycle(&self, name: &str, awaited: &str) -> Option<Vec<String>> {
        let mut path = vec![name.to_string(), awaited.to_string()];
        let mut current = awaited.to_string();
        let mut seen = HashSet::new();
        while seen.insert(current.clone()) {
            if current == name {
                return Some(path);
            }
            let parked = self
                .deferred
                .values()
                .flatten()
                .find(|d| d.qualified_name() == current)?;
            let next = self.awaited_dependency(parked)?;
            path.push(next.clone());
            current = next;
        }
        None
    }

    fn complete(&mut self, def: StructuralTypeDef) -> Result<()> {
        let name = def.qualified_name();
        let namespace = def.namespace.clone();

        let mut own_properties = Vec::with_capacity(def.data_properties.len());
        for property in &def.data_properties {
            let mut property = property.clone();
            if let Some(ct) = &property.complex_type_name {
                property.complex_type_name = Some(self.normalize_type_name(ct, &namespace));
                property.data_type = DataType::Undefined;
                property.is_nullable = false;
            }
            own_properties.push(property);
        }

        if def.is_complex_type {
            let complex = ComplexType {
                name: name.clone(),
                short_name: def.short_name.clone(),
                namespace,
                data_properties: own_properties,
                descriptor: def,
            };
            self.short_names
                .entry(complex.short_name.clone())
                .or_insert_with(|| name.clone());
            self.complex_types.insert(name.clone(), Arc::new(complex));
            self.registration_order.push(name);
            return Ok(());
        }

        let base = match &def.base_type_name {
            Some(base) => Some(self.entity_type(&self.normalize_type_name(base, &namespace))?),
            None => None,
        };
        let (mut data_properties, mut navigation_properties, root_type_name) = match &base {
            Some(b) => (
                b.data_properties.clone(),
                b.navigation_properties.clone(),
                b.root_type_name.clone(),
            ),
            None => (Vec::new(), Vec::new(), name.clone()),
        };

        for property in own_properties {
            if data_properties.iter().any(|p| p.name == property.name) {
                return Err(CacheError::InvalidMetadata(format!(
                    "Duplicate property '{}' on '{}'",
                    property.name, name
                )));
            }
            data_properties.push(property);
        }
        if !data_properties.iter().any(|p| p.is_part_of_key) {
            return Err(CacheError::DuplicateKeylessType(name));
        }

        let mut own_navigation_names = Vec::new();
        for nav in &def.navigation_properties {
            if navigation_properties.iter().any(|n| n.name == nav.name) {
                return Err(CacheError::InvalidMetadata(format!(
                    "Duplicate navigation property '{}' on '{}'",
                    nav.name, name
                )));
            }
            let mut nav = nav.clone();
            nav.entity_type_name = self.normalize_type_name(&nav.entity_type_name, &namespace);
            nav.inverse = None;
            nav.is_resolved = false;
            own_navigation_names.push(nav.name.clone());
            navigation_properties.push(nav);
        }

        let auto_generated_key_type = match (&base, def.auto_generated_key_type) {
            (Some(b), super::AutoGeneratedKeyType::None) => b.auto_generated_key_type,
            (_, key_type) => key_type,
        };

        let entity_type = EntityType {
            name: name.clone(),
            short_name: def.short_name.clone(),
            namespace,
            base_type_name: base.as_ref().map(|b| b.name.clone()),
            root_type_name,
            subtype_names: Vec::new(),
            is_abstract: def.is_abstract,
            auto_generated_key_type,
            default_resource_name: None,
            data_properties,
            navigation_properties,
            descriptor: def.clone(),
        };
        self.short_names
            .entry(entity_type.short_name.clone())
            .or_insert_with(|| name.clone());
        self.entity_types.insert(name.clone(), Arc::new(entity_type));
        self.registration_order.push(name.clone());

        if let Some(base) = &base
            && let Some(base_type) = self.entity_types.get_mut(&base.name)
        {
            Arc::make_mut(base_type).subtype_names.push(name.clone());
        }
        if let Some(resource) = &def.default_resource_name {
            self.set_entity_type_for_resource_name(resource, &name)?;
        }
        for nav_name in own_navigation_names {
            self.resolve_navigation(&name, &nav_name);
        }
        Ok(())
    }

    // ========================================================================
    // Navigation resolution
    // ========================================================================

    fn resolve_navigation(&mut self, owner: &str, nav_name: &str) {
        let Some(nav) = self
            .entity_types
            .get(owner)
            .and_then(|t| t.navigation_property(nav_name))
            .cloned()
        else {
            return;
        };
        if !self.entity_types.contains_key(&nav.entity_type_name) {
            debug!(owner, navigation = nav_name, target = %nav.entity_type_name, "Parking unresolved navigation");
            self.pending_navigations
                .entry(nav.entity_type_name.clone())
                .or_default()
                .push((owner.to_string(), nav_name.to_string()));
            return;
        }
        self.update_navigation(owner, nav_name, |n| n.is_resolved = true);
        self.pair_inverse(owner, &nav);
    }

    fn resolve_pending_navigations(&mut self, ready: &str) {
        for (owner, nav_name) in self.pending_navigations.remove(ready).unwrap_or_default() {
            self.resolve_navigation(&owner, &nav_name);
        }
    }

    fn pair_inverse(&mut self, owner: &str, nav: &NavigationProperty) {
        let Some(association) = &nav.association_name else {
            return;
        };
        let Some(target) = self.entity_types.get(&nav.entity_type_name).cloned() else {
            return;
        };
        let Some(inverse) = target
            .navigation_properties
            .iter()
            .find(|n| {
                n.association_name.as_ref() == Some(association)
                    && !(target.name == owner && n.name == nav.name)
            })
            .cloned()
        else {
            return;
        };

        let forward_fks = nav.foreign_key_names.clone();
        let inverse_fks = inverse.foreign_key_names.clone();
        let inverse_name = inverse.name.clone();
        self.update_navigation(owner, &nav.name, |n| {
            n.inverse = Some(inverse_name.clone());
            if n.inv_foreign_key_names.is_empty() {
                n.inv_foreign_key_names = inverse_fks.clone();
            }
        });
        let nav_name = nav.name.clone();
        self.update_navigation(&target.name, &inverse.name, |n| {
            n.inverse = Some(nav_name.clone());
            if n.inv_foreign_key_names.is_empty() {
                n.inv_foreign_key_names = forward_fks.clone();
            }
        });
    }

    /// Apply `f` to the named navigation on a type and on all its subtypes.
    fn update_navigation(
        &mut self,
        type_name: &str,
        nav_name: &str,
        f: impl Fn(&mut NavigationProperty),
    ) {
        let mut stack = vec![type_name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(ty) = self.entity_types.get_mut(&current) {
                let ty = Arc::make_mut(ty);
                if let Some(nav) = ty.navigation_properties.iter_mut().find(|n| n.name == nav_name) {
                    f(nav);
                }
                stack.extend(ty.subtype_names.iter().cloned());
            }
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    fn lookup_name(&self, name: &str) -> Option<String> {
        let normalized = self.normalize_type_name(name, "");
        if self.is_registered(&normalized) {
            return Some(normalized);
        }
        self.short_names.get(name).cloned()
    }

    /// Resolve a type name. Unknown names yield `Ok(None)` unless `required`.
    pub fn resolve_type_name(&self, name: &str, required: bool) -> Result<Option<StructuralType>> {
        let found = self.lookup_name(name).and_then(|qualified| {
            if let Some(t) = self.entity_types.get(&qualified) {
                Some(StructuralType::Entity(t.clone()))
            } else {
                self.complex_types
                    .get(&qualified)
                    .map(|t| StructuralType::Complex(t.clone()))
            }
        });
        match found {
            Some(t) => Ok(Some(t)),
            None if required => Err(CacheError::UnknownType(name.to_string())),
            None => Ok(None),
        }
    }

    pub fn find_entity_type(&self, name: &str) -> Option<Arc<EntityType>> {
        self.lookup_name(name)
            .and_then(|qualified| self.entity_types.get(&qualified).cloned())
    }

    pub fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.find_entity_type(name)
            .ok_or_else(|| CacheError::UnknownType(name.to_string()))
    }

    pub fn complex_type(&self, name: &str) -> Result<Arc<ComplexType>> {
        self.lookup_name(name)
            .and_then(|qualified| self.complex_types.get(&qualified).cloned())
            .ok_or_else(|| CacheError::UnknownType(name.to_string()))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.registration_order
            .iter()
            .filter_map(|name| self.entity_types.get(name))
    }

    /// The type itself followed by all its transitive subtypes.
    pub fn type_and_subtypes(&self, name: &str) -> Result<Vec<Arc<EntityType>>> {
        let root = self.entity_type(name)?;
        let mut result = Vec::new();
        let mut stack = vec![root];
        while let Some(ty) = stack.pop() {
            for sub in ty.subtype_names.iter().rev() {
                if let Some(sub_type) = self.entity_types.get(sub) {
                    stack.push(sub_type.clone());
                }
            }
            result.push(ty);
        }
        Ok(result)
    }

    pub fn is_subtype_of(&self, type_name: &str, ancestor: &str) -> bool {
        let Some(ancestor) = self.lookup_name(ancestor) else {
            return false;
        };
        let mut current = self.find_entity_type(type_name);
        while let Some(ty) = current {
            if ty.name == ancestor {
                return true;
            }
            current = ty
                .base_type_name
                .as_deref()
                .and_then(|b| self.entity_types.get(b).cloned());
        }
        false
    }

    /// Validate a dotted or slashed property path against an entity type.
    pub fn resolve_property_path(&self, type_name: &str, path: &str) -> Result<PropertyPath> {
        let unknown = || CacheError::UnknownProperty(type_name.to_string(), path.to_string());
        let parts: Vec<&str> = path.split(['.', '/']).map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(unknown());
        }

        let mut current = StructuralType::Entity(self.entity_type(type_name)?);
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            if let Some(property) = current.data_property(part) {
                let property = property.clone();
                if let Some(ct) = &property.complex_type_name {
                    current = StructuralType::Complex(self.complex_type(ct)?);
                } else if !is_last {
                    return Err(unknown());
                }
                segments.push(PathSegment::Data(property));
                continue;
            }

            let StructuralType::Entity(entity_type) = &current else {
                return Err(unknown());
            };
            let nav = entity_type.navigation_property(part).ok_or_else(unknown)?.clone();
            if !nav.is_scalar && !is_last {
                return Err(CacheError::InvalidExpression(format!(
                    "Cannot traverse collection navigation '{}' in '{}'",
                    nav.name, path
                )));
            }
            current = StructuralType::Entity(self.entity_type(&nav.entity_type_name)?);
            segments.push(PathSegment::Navigation(nav));
        }
        Ok(PropertyPath { segments })
    }

    // ========================================================================
    // Resource names
    // ========================================================================

    /// Map a resource name to an entity type. The first resource mapped to a
    /// type becomes its default resource name.
    pub fn set_entity_type_for_resource_name(&mut self, resource: &str, type_name: &str) -> Result<()> {
        let name = self.entity_type(type_name)?.name.clone();
        self.resource_to_type.insert(resource.to_string(), name.clone());
        if let Some(ty) = self.entity_types.get_mut(&name)
            && ty.default_resource_name.is_none()
        {
            Arc::make_mut(ty).default_resource_name = Some(resource.to_string());
        }
        Ok(())
    }

    /// Entity type targeted by a resource name. Falls back to treating the
    /// resource as a type name.
    pub fn entity_type_name_for_resource(&self, resource: &str) -> Option<String> {
        self.resource_to_type
            .get(resource)
            .cloned()
            .or_else(|| self.find_entity_type(resource).map(|t| t.name.clone()))
    }

    pub fn default_resource_name(&self, type_name: &str) -> Option<String> {
        self.find_entity_type(type_name)
            .and_then(|t| t.default_resource_name.clone())
    }

    // ========================================================================
    // Factories
    // ========================================================================

    pub fn register_factory<F>(&mut self, type_name: &str, factory: F) -> Result<()>
    where
        F: Fn(&EntityType) -> Entity + Send + Sync + 'static,
    {
        let name = self.entity_type(type_name)?.name.clone();
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn resolve_factory(&self, type_name: &str) -> Option<EntityFactory> {
        self.lookup_name(type_name)
            .and_then(|name| self.factories.get(&name).cloned())
    }

    /// Create a detached entity with every data property at its initial value.
    /// Uses the registered factory, or a plain record when none is registered.
    pub fn create_entity(&self, type_name: &str) -> Result<Entity> {
        let entity_type = self.entity_type(type_name)?;
        let mut entity = match self.factories.get(&entity_type.name) {
            Some(factory) => factory(&entity_type),
            None => Entity::new(entity_type.name.clone()),
        };
        if entity.entity_type_name() != entity_type.name {
            return Err(CacheError::TypeMismatch(format!(
                "Factory for '{}' produced '{}'",
                entity_type.name,
                entity.entity_type_name()
            )));
        }
        for property in &entity_type.data_properties {
            if entity.has_value(&property.name) {
                continue;
            }
            let initial = match &property.complex_type_name {
                Some(ct) => self.complex_default(ct)?,
                None => property.initial_value(),
            };
            entity.set_value(property.name.clone(), initial);
        }
        Ok(entity)
    }

    pub fn complex_default(&self, complex_type_name: &str) -> Result<Value> {
        let complex = self.complex_type(complex_type_name)?;
        let mut fields = BTreeMap::new();
        for property in &complex.data_properties {
            let value = match &property.complex_type_name {
                Some(ct) => self.complex_default(ct)?,
                None => property.initial_value(),
            };
            fields.insert(property.name.clone(), value);
        }
        Ok(Value::Complex(fields))
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    pub fn to_document(&self) -> MetadataDocument {
        let mut structural_types: Vec<StructuralTypeDef> = self
            .registration_order
            .iter()
            .filter_map(|name| {
                self.entity_types
                    .get(name)
                    .map(|t| t.descriptor.clone())
                    .or_else(|| self.complex_types.get(name).map(|t| t.descriptor.clone()))
            })
            .collect();
        structural_types.extend(self.deferred.values().flatten().cloned());

        MetadataDocument {
            metadata_version: METADATA_VERSION.to_string(),
            naming_convention: self.naming_convention.name().to_string(),
            local_query_comparison_options: self.comparison_options.name().to_string(),
            structural_types,
            resource_entity_type_map: self
                .resource_to_type
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn export_metadata(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    pub fn import_metadata(&mut self, json: &str) -> Result<Vec<String>> {
        let document: MetadataDocument = serde_json::from_str(json)?;
        self.import_document(document)
    }

    /// Merge a metadata document into this store, re-running deferred
    /// resolution as live registration would. Types already registered are
    /// skipped. Any failure leaves the store unchanged.
    pub fn import_document(&mut self, document: MetadataDocument) -> Result<Vec<String>> {
        let mut staged = self.clone();
        if let Some(convention) = NamingConvention::from_name(&document.naming_convention) {
            staged.naming_convention = convention;
        }
        if let Some(options) = ComparisonOptions::from_name(&document.local_query_comparison_options) {
            staged.comparison_options = options;
        }

        let mut imported = Vec::new();
        let mut requested = Vec::new();
        for def in document.structural_types {
            let name = def.qualified_name();
            requested.push(name.clone());
            if staged.is_registered(&name) || staged.is_deferred(&name) {
                debug!(type_name = %name, "Skipping already known type on import");
                continue;
            }
            if let RegistrationOutcome::Registered(names) = staged.register_type(def)? {
                imported.extend(names);
            }
        }

        let unresolved: Vec<String> = requested
            .iter()
            .filter(|name| !staged.is_registered(name))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(CacheError::MergeInconsistency(format!(
                "Types never completed during import: {}",
                unresolved.join(", ")
            )));
        }

        for (resource, type_name) in &document.resource_entity_type_map {
            staged
                .set_entity_type_for_resource_name(resource, type_name)
                .map_err(|_| {
                    CacheError::MergeInconsistency(format!(
                        "Resource '{}' maps to unknown type '{}'",
                        resource, type_name
                    ))
                })?;
        }

        for (target, navs) in &staged.pending_navigations {
            for (owner, nav) in navs {
                log::warn!("Navigation {}.{} targets unregistered type {}", owner, nav, target);
            }
        }

        *self = staged;
        Ok(imported)
    }
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore")
            .field("entity_types", &self.registration_order)
            .field("deferred", &self.deferred_type_names())
            .field("resources", &self.resource_to_type)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("naming_convention", &self.naming_convention)
            .finish()
    }
}
