use serde::{Deserialize, Serialize};

use super::{DataProperty, NavigationProperty};
use crate::core::{Result, Value};
use crate::entity::{Entity, EntityKey};

/// Who assigns key values for newly added entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoGeneratedKeyType {
    /// The client must supply the key.
    #[default]
    None,
    /// The store assigns the key on insert; the client uses a temporary one until then.
    Identity,
    /// A server-side generator assigns the key during save.
    KeyGenerator,
}

/// Raw descriptor of an entity or complex type, as registered or imported.
///
/// Type names inside a descriptor may be qualified (`Namespace.Name`),
/// short (`Name`, resolved against the descriptor's namespace) or in the
/// `Name:#Namespace` form used by some metadata documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralTypeDef {
    pub short_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub is_complex_type: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type_name: Option<String>,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub auto_generated_key_type: AutoGeneratedKeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resource_name: Option<String>,
    #[serde(default)]
    pub data_properties: Vec<DataProperty>,
    #[serde(default)]
    pub navigation_properties: Vec<NavigationProperty>,
}

impl StructuralTypeDef {
    pub fn entity(short_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            namespace: namespace.into(),
            is_complex_type: false,
            base_type_name: None,
            is_abstract: false,
            auto_generated_key_type: AutoGeneratedKeyType::None,
            default_resource_name: None,
            data_properties: Vec::new(),
            navigation_properties: Vec::new(),
        }
    }

    pub fn complex(short_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            is_complex_type: true,
            ..Self::entity(short_name, namespace)
        }
    }

    pub fn base_type(mut self, name: impl Into<String>) -> Self {
        self.base_type_name = Some(name.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn auto_generated_key(mut self, key_type: AutoGeneratedKeyType) -> Self {
        self.auto_generated_key_type = key_type;
        self
    }

    pub fn resource_name(mut self, name: impl Into<String>) -> Self {
        self.default_resource_name = Some(name.into());
        self
    }

    pub fn data_property(mut self, property: DataProperty) -> Self {
        self.data_properties.push(property);
        self
    }

    pub fn navigation_property(mut self, property: NavigationProperty) -> Self {
        self.navigation_properties.push(property);
        self
    }

    pub fn qualified_name(&self) -> String {
        qualify(&self.short_name, &self.namespace)
    }
}

pub(crate) fn qualify(short_name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        short_name.to_string()
    } else {
        format!("{}.{}", namespace, short_name)
    }
}

/// A registered entity type.
///
/// `data_properties` and `navigation_properties` include inherited ones,
/// base type first. Only the store mutates a registered type.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub(crate) name: String,
    pub(crate) short_name: String,
    pub(crate) namespace: String,
    pub(crate) base_type_name: Option<String>,
    pub(crate) root_type_name: String,
    pub(crate) subtype_names: Vec<String>,
    pub(crate) is_abstract: bool,
    pub(crate) auto_generated_key_type: AutoGeneratedKeyType,
    pub(crate) default_resource_name: Option<String>,
    pub(crate) data_properties: Vec<DataProperty>,
    pub(crate) navigation_properties: Vec<NavigationProperty>,
    /// The type's own descriptor, kept for export.
    pub(crate) descriptor: StructuralTypeDef,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn base_type_name(&self) -> Option<&str> {
        self.base_type_name.as_deref()
    }

    /// Top of the inheritance chain. Keys are unique per root type.
    pub fn root_type_name(&self) -> &str {
        &self.root_type_name
    }

    /// Direct subtypes.
    pub fn subtype_names(&self) -> &[String] {
        &self.subtype_names
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn auto_generated_key_type(&self) -> AutoGeneratedKeyType {
        self.auto_generated_key_type
    }

    pub fn default_resource_name(&self) -> Option<&str> {
        self.default_resource_name.as_deref()
    }

    pub fn descriptor(&self) -> &StructuralTypeDef {
        &self.descriptor
    }

    pub fn data_properties(&self) -> &[DataProperty] {
        &self.data_properties
    }

    pub fn navigation_properties(&self) -> &[NavigationProperty] {
        &self.navigation_properties
    }

    pub fn data_property(&self, name: &str) -> Option<&DataProperty> {
        self.data_properties.iter().find(|p| p.name == name)
    }

    pub fn navigation_property(&self, name: &str) -> Option<&NavigationProperty> {
        self.navigation_properties.iter().find(|p| p.name == name)
    }

    pub fn key_properties(&self) -> Vec<&DataProperty> {
        self.data_properties
            .iter()
            .filter(|p| p.is_part_of_key)
            .collect()
    }

    pub fn concurrency_properties(&self) -> Vec<&DataProperty> {
        self.data_properties
            .iter()
            .filter(|p| p.is_concurrency_property())
            .collect()
    }

    /// Names of all properties that act as a foreign key for some scalar navigation.
    pub fn foreign_key_names(&self) -> Vec<&str> {
        self.navigation_properties
            .iter()
            .filter(|n| n.is_scalar)
            .flat_map(|n| n.foreign_key_names.iter().map(String::as_str))
            .collect()
    }

    /// The entity's key, scoped to the root type of this hierarchy.
    pub fn key_of(&self, entity: &Entity) -> EntityKey {
        let values = self
            .key_properties()
            .iter()
            .map(|p| entity.get(&p.name).clone())
            .collect();
        EntityKey::new(self.root_type_name.clone(), values)
    }

    pub fn key_from_values(&self, values: Vec<Value>) -> EntityKey {
        EntityKey::new(self.root_type_name.clone(), values)
    }

    /// Convert caller-supplied key values to the key properties' types.
    pub fn coerce_key_values(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        let key_properties = self.key_properties();
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| match key_properties.get(i) {
                Some(property) => property.data_type.coerce(value),
                None => Ok(value),
            })
            .collect()
    }

    /// True when every key part still holds its unset default value.
    pub fn has_default_key(&self, entity: &Entity) -> bool {
        self.key_properties().iter().all(|p| {
            let value = entity.get(&p.name);
            value.is_null() || *value == p.data_type.default_value()
        })
    }
}

/// A registered complex type. Complex types have no identity.
#[derive(Debug, Clone)]
pub struct ComplexType {
    pub(crate) name: String,
    pub(crate) short_name: String,
    pub(crate) namespace: String,
    pub(crate) data_properties: Vec<DataProperty>,
    pub(crate) descriptor: StructuralTypeDef,
}

impl ComplexType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn data_properties(&self) -> &[DataProperty] {
        &self.data_properties
    }

    pub fn data_property(&self, name: &str) -> Option<&DataProperty> {
        self.data_properties.iter().find(|p| p.name == name)
    }

    pub fn descriptor(&self) -> &StructuralTypeDef {
        &self.descriptor
    }
}

/// Either kind of registered structural type.
#[derive(Debug, Clone)]
pub enum StructuralType {
    Entity(std::sync::Arc<EntityType>),
    Complex(std::sync::Arc<ComplexType>),
}

impl StructuralType {
    pub fn name(&self) -> &str {
        match self {
            Self::Entity(t) => t.name(),
            Self::Complex(t) => t.name(),
        }
    }

    pub fn data_property(&self, name: &str) -> Option<&DataProperty> {
        match self {
            Self::Entity(t) => t.data_property(name),
            Self::Complex(t) => t.data_property(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    #[test]
    fn test_qualified_name() {
        assert_eq!(StructuralTypeDef::entity("Order", "Northwind").qualified_name(), "Northwind.Order");
        assert_eq!(StructuralTypeDef::entity("Order", "").qualified_name(), "Order");
    }

    #[test]
    fn test_descriptor_serde_defaults() {
        let def: StructuralTypeDef = serde_json::from_value(serde_json::json!({
            "shortName": "Location",
            "namespace": "Northwind",
            "isComplexType": true,
            "dataProperties": [{"name": "City", "dataType": "String"}]
        }))
        .unwrap();
        assert!(def.is_complex_type);
        assert_eq!(def.auto_generated_key_type, AutoGeneratedKeyType::None);
        assert_eq!(def.data_properties[0].data_type, DataType::String);
    }
}
