use crate::core::Value;
use crate::entity::Entity;
use crate::metadata::EntityType;

/// A rule consulted before save. Returns one message per violation.
pub trait EntityValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, entity: &Entity, entity_type: &EntityType) -> Vec<String>;
}

/// Non-nullable properties must hold a value and strings must respect
/// their max length.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyRulesValidator;

impl EntityValidator for PropertyRulesValidator {
    fn name(&self) -> &str {
        "property_rules"
    }

    fn validate(&self, entity: &Entity, entity_type: &EntityType) -> Vec<String> {
        let mut messages = Vec::new();
        for property in entity_type.data_properties() {
            if property.is_unmapped {
                continue;
            }
            let value = entity.get(&property.name);
            if !property.is_nullable && value.is_null() {
                messages.push(format!("'{}' is required", property.name));
            }
            if let (Some(max), Value::String(s)) = (property.max_length, value)
                && s.chars().count() > max
            {
                messages.push(format!("'{}' exceeds {} characters", property.name, max));
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::{DataProperty, MetadataStore, StructuralTypeDef};

    #[test]
    fn test_required_and_max_length() {
        let mut store = MetadataStore::new();
        store
            .register_type(
                StructuralTypeDef::entity("Customer", "Northwind")
                    .data_property(DataProperty::new("CustomerID", DataType::String).key().with_max_length(5))
                    .data_property(DataProperty::new("CompanyName", DataType::String).not_null()),
            )
            .unwrap();
        let customer = store.entity_type("Customer").unwrap();

        let entity = Entity::new("Northwind.Customer").with_value("CustomerID", "TOOLONG");
        let messages = PropertyRulesValidator.validate(&entity, &customer);
        assert_eq!(messages.len(), 2);

        let entity = Entity::new("Northwind.Customer")
            .with_value("CustomerID", "ALFKI")
            .with_value("CompanyName", "Alfreds");
        assert!(PropertyRulesValidator.validate(&entity, &customer).is_empty());
    }
}
