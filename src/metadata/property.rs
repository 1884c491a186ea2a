use serde::{Deserialize, Serialize};

use crate::core::{DataType, Value};

/// How a property participates in optimistic concurrency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    #[default]
    None,
    /// The value is bumped on every save so the server can detect lost updates.
    Fixed,
}

/// A scalar or complex-typed property of a structural type.
///
/// Built with consuming setters:
///
/// ```
/// use entitycache::core::DataType;
/// use entitycache::metadata::DataProperty;
///
/// let id = DataProperty::new("OrderID", DataType::Int32).key();
/// let freight = DataProperty::new("Freight", DataType::Decimal);
/// assert!(id.is_part_of_key);
/// assert!(freight.is_nullable);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProperty {
    pub name: String,
    #[serde(default = "undefined_type")]
    pub data_type: DataType,
    /// Set for complex-typed properties; such properties are never nullable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex_type_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub concurrency_mode: ConcurrencyMode,
    #[serde(default)]
    pub is_part_of_key: bool,
    /// Present on the runtime object only; never sent to or read from the server.
    #[serde(default)]
    pub is_unmapped: bool,
}

fn undefined_type() -> DataType {
    DataType::Undefined
}

fn default_true() -> bool {
    true
}

impl DataProperty {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            complex_type_name: None,
            is_nullable: true,
            default_value: None,
            max_length: None,
            concurrency_mode: ConcurrencyMode::None,
            is_part_of_key: false,
            is_unmapped: false,
        }
    }

    pub fn complex(name: impl Into<String>, complex_type_name: impl Into<String>) -> Self {
        Self {
            complex_type_name: Some(complex_type_name.into()),
            is_nullable: false,
            ..Self::new(name, DataType::Undefined)
        }
    }

    /// Mark as part of the key. Key properties are not nullable.
    pub fn key(mut self) -> Self {
        self.is_part_of_key = true;
        self.is_nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn concurrency(mut self) -> Self {
        self.concurrency_mode = ConcurrencyMode::Fixed;
        self
    }

    pub fn unmapped(mut self) -> Self {
        self.is_unmapped = true;
        self
    }

    pub fn is_complex(&self) -> bool {
        self.complex_type_name.is_some()
    }

    pub fn is_concurrency_property(&self) -> bool {
        self.concurrency_mode == ConcurrencyMode::Fixed
    }

    /// Value a freshly created entity starts with. Complex defaults are built
    /// by the metadata store since they need the complex type.
    pub fn initial_value(&self) -> Value {
        if let Some(value) = &self.default_value {
            return self
                .data_type
                .coerce(value.clone())
                .unwrap_or_else(|_| value.clone());
        }
        if self.is_nullable {
            Value::Null
        } else {
            self.data_type.default_value()
        }
    }
}

/// A relationship from one entity type to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationProperty {
    pub name: String,
    /// Target type name as declared; may name a type that is not registered yet.
    pub entity_type_name: String,
    pub is_scalar: bool,
    /// Shared with the inverse property so the two can be paired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_name: Option<String>,
    /// Properties on this side holding the target's key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_key_names: Vec<String>,
    /// Properties on the target side holding this side's key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inv_foreign_key_names: Vec<String>,
    #[serde(skip)]
    pub(crate) inverse: Option<String>,
    #[serde(skip)]
    pub(crate) is_resolved: bool,
}

impl NavigationProperty {
    pub fn scalar(name: impl Into<String>, entity_type_name: impl Into<String>) -> Self {
        Self::new(name, entity_type_name, true)
    }

    pub fn collection(name: impl Into<String>, entity_type_name: impl Into<String>) -> Self {
        Self::new(name, entity_type_name, false)
    }

    fn new(name: impl Into<String>, entity_type_name: impl Into<String>, is_scalar: bool) -> Self {
        Self {
            name: name.into(),
            entity_type_name: entity_type_name.into(),
            is_scalar,
            association_name: None,
            foreign_key_names: Vec::new(),
            inv_foreign_key_names: Vec::new(),
            inverse: None,
            is_resolved: false,
        }
    }

    pub fn association(mut self, name: impl Into<String>) -> Self {
        self.association_name = Some(name.into());
        self
    }

    pub fn foreign_keys<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.foreign_key_names = names.iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    pub fn inverse_foreign_keys<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.inv_foreign_key_names = names.iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    /// Name of the paired navigation property on the target type, once known.
    pub fn inverse(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.is_resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_values() {
        assert_eq!(DataProperty::new("Freight", DataType::Decimal).initial_value(), Value::Null);
        assert_eq!(
            DataProperty::new("Quantity", DataType::Int16).not_null().initial_value(),
            Value::Integer(0)
        );
        assert_eq!(
            DataProperty::new("Country", DataType::String)
                .with_default("USA")
                .initial_value(),
            Value::from("USA")
        );
    }

    #[test]
    fn test_complex_property_is_not_nullable() {
        let prop = DataProperty::complex("Location", "Northwind.Location");
        assert!(prop.is_complex());
        assert!(!prop.is_nullable);
    }

    #[test]
    fn test_descriptor_json_shape() {
        let nav = NavigationProperty::scalar("Customer", "Northwind.Customer")
            .association("Customer_Orders")
            .foreign_keys(&["CustomerID"]);
        let json = serde_json::to_value(&nav).unwrap();
        assert_eq!(json["entityTypeName"], "Northwind.Customer");
        assert_eq!(json["foreignKeyNames"][0], "CustomerID");
        assert!(json.get("invForeignKeyNames").is_none());

        let prop: DataProperty =
            serde_json::from_value(serde_json::json!({"name": "Notes", "dataType": "String"}))
                .unwrap();
        assert!(prop.is_nullable);
        assert!(!prop.is_part_of_key);
    }
}
