// ============================================================================
// Entity Aspect - lifecycle state and change tracking
// ============================================================================
//
// Implements the State Pattern for an entity's cache lifecycle. The aspect
// remembers which manager owns the entity, the pre-edit value of every
// changed property and whether the entity currently carries a temporary key.
//
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use crate::core::Value;
use crate::manager::ManagerId;

/// Lifecycle state of an entity.
///
/// State transitions:
/// ```text
/// Detached ──attach──> Added | Unchanged | Modified
/// Unchanged ──property write──> Modified
/// Added ──delete──> Detached
/// Unchanged | Modified ──delete──> Deleted
/// any attached ──accept / save──> Unchanged
/// Added ──reject──> Detached
/// Modified | Deleted ──reject──> Unchanged
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntityState {
    #[default]
    Detached,
    Added,
    Unchanged,
    Modified,
    Deleted,
}

impl EntityState {
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Detached)
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added)
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, Self::Modified)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Added, Modified or Deleted: the entity has something to save.
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }

    pub fn is_unchanged_or_modified(&self) -> bool {
        matches!(self, Self::Unchanged | Self::Modified)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Detached" => Some(Self::Detached),
            "Added" => Some(Self::Added),
            "Unchanged" => Some(Self::Unchanged),
            "Modified" => Some(Self::Modified),
            "Deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "Detached",
            Self::Added => "Added",
            Self::Unchanged => "Unchanged",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
        };
        write!(f, "{}", name)
    }
}

/// Per-entity bookkeeping owned exclusively by its entity.
#[derive(Debug, Clone, Default)]
pub struct EntityAspect {
    pub(crate) manager: Option<ManagerId>,
    pub(crate) state: EntityState,
    pub(crate) original_values: BTreeMap<String, Value>,
    pub(crate) has_temp_key: bool,
    pub(crate) is_being_saved: bool,
    pub(crate) loaded_from_server: bool,
    pub(crate) extra_metadata: Option<serde_json::Value>,
}

impl EntityAspect {
    pub fn manager(&self) -> Option<ManagerId> {
        self.manager
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Values the changed properties had before the current change cycle.
    pub fn original_values(&self) -> &BTreeMap<String, Value> {
        &self.original_values
    }

    pub fn has_temp_key(&self) -> bool {
        self.has_temp_key
    }

    pub fn is_being_saved(&self) -> bool {
        self.is_being_saved
    }

    pub fn loaded_from_server(&self) -> bool {
        self.loaded_from_server
    }

    /// Extra metadata the results adapter attached (e.g. a location URI).
    pub fn extra_metadata(&self) -> Option<&serde_json::Value> {
        self.extra_metadata.as_ref()
    }

    /// Record that `property` is about to change from `previous`.
    ///
    /// Captures the original value once per change cycle and moves
    /// `Unchanged` to `Modified`. Returns true when the state changed.
    pub(crate) fn record_change(&mut self, property: &str, previous: &Value) -> bool {
        match self.state {
            EntityState::Unchanged | EntityState::Modified => {
                if !self.original_values.contains_key(property) {
                    self.original_values
                        .insert(property.to_string(), previous.clone());
                }
                if self.state.is_unchanged() {
                    self.state = EntityState::Modified;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Accept the current values as the new baseline.
    pub(crate) fn accept(&mut self) {
        self.original_values.clear();
        self.state = EntityState::Unchanged;
        self.has_temp_key = false;
    }

    pub(crate) fn detach(&mut self) {
        self.manager = None;
        self.state = EntityState::Detached;
        self.is_being_saved = false;
    }
}
