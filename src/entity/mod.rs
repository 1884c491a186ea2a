pub mod aspect;
pub mod change;
pub mod entity;
pub mod group;
pub mod key;
pub mod unattached;

pub use aspect::{EntityAspect, EntityState};
pub use change::{EntityAction, EntityChanged};
pub use entity::{Entity, EntityId, NavigationValue};
pub use group::EntityGroup;
pub use key::EntityKey;
pub use unattached::{NavigationRef, UnattachedChildrenMap, UnattachedTuple};
