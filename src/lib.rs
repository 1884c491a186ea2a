// ============================================================================
// EntityCache Library
// ============================================================================
//
// Client-side entity-graph cache: type metadata, a predicate compiler that
// targets both OData query strings and local evaluation, immutable query
// builders, and an entity manager that merges query and save results into
// a change-tracked identity map.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod entity;
pub mod evaluator;
pub mod manager;
pub mod metadata;
pub mod prelude;
pub mod query;
pub mod result;
pub mod transport;

// Re-export main types for convenience
pub use config::{FetchStrategy, ManagerConfig, MergeStrategy, QueryOptions, SaveOptions};
pub use core::{CacheError, DataType, Result, Value};
pub use entity::{Entity, EntityAction, EntityChanged, EntityId, EntityKey, EntityState};
pub use manager::{EntityManager, ManagerId};
pub use metadata::{EntityType, MetadataStore, NamingConvention};
pub use query::{EntityQuery, Predicate};
pub use result::{QueryResult, QueryRow};
pub use transport::DataService;
