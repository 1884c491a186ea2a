// ============================================================================
// Entity Change Notifications
// ============================================================================
//
// Every cache mutation is described by an EntityChanged message. While a
// merge is running the messages are buffered in the loading scope and
// published once the scope ends.
//
// ============================================================================

use super::EntityId;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityAction {
    Attach,
    AttachOnQuery,
    AttachOnImport,
    Detach,
    MergeOnQuery,
    MergeOnSave,
    MergeOnImport,
    PropertyChange,
    EntityStateChange,
    AcceptChanges,
    RejectChanges,
    Clear,
}

impl EntityAction {
    pub fn is_attach(&self) -> bool {
        matches!(
            self,
            Self::Attach | Self::AttachOnQuery | Self::AttachOnImport
        )
    }

    pub fn is_merge(&self) -> bool {
        matches!(
            self,
            Self::MergeOnQuery | Self::MergeOnSave | Self::MergeOnImport
        )
    }
}

/// A single cache notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChanged {
    pub action: EntityAction,
    pub entity: Option<EntityId>,
    pub property: Option<String>,
}

impl EntityChanged {
    pub fn new(action: EntityAction, entity: EntityId) -> Self {
        Self {
            action,
            entity: Some(entity),
            property: None,
        }
    }

    pub fn property_change(entity: EntityId, property: impl Into<String>) -> Self {
        Self {
            action: EntityAction::PropertyChange,
            entity: Some(entity),
            property: Some(property.into()),
        }
    }

    pub fn clear() -> Self {
        Self {
            action: EntityAction::Clear,
            entity: None,
            property: None,
        }
    }
}
