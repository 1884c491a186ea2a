use std::fmt;

use crate::core::Value;

const KEY_DELIMITER: &str = ":::";

/// Identity of a cached entity: the root type of its hierarchy plus the
/// ordered key-property values.
///
/// Two keys are equal when both the type and every value are equal. Entity
/// groups and the unattached-children index are keyed by the typed values,
/// so a string `"1"` and an integer `1` are different keys. The string form
/// produced by [`EntityKey::key_string`] is for messages and export only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity_type: String,
    values: Vec<Value>,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values,
        }
    }

    pub fn single(entity_type: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(entity_type, vec![value.into()])
    }

    pub fn entity_type_name(&self) -> &str {
        &self.entity_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// True when any key part is null.
    pub fn has_null_part(&self) -> bool {
        self.values.iter().any(Value::is_null)
    }

    /// Values only, joined for display.
    pub fn values_string(&self) -> String {
        self.values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(KEY_DELIMITER)
    }

    /// Type-qualified display form.
    pub fn key_string(&self) -> String {
        format!("{}{}{}", self.entity_type, KEY_DELIMITER, self.values_string())
    }

    pub(crate) fn with_type(&self, entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: self.values.clone(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_string())
    }
}
