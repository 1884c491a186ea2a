pub mod entity_type;
pub mod naming;
pub mod property;
pub mod store;

pub use entity_type::{
    AutoGeneratedKeyType, ComplexType, EntityType, StructuralType, StructuralTypeDef,
};
pub use naming::NamingConvention;
pub use property::{ConcurrencyMode, DataProperty, NavigationProperty};
pub use store::{
    EntityFactory, MetadataDocument, MetadataStore, PathSegment, PropertyPath,
    RegistrationOutcome, METADATA_VERSION,
};
