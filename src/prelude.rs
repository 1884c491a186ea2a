//! Everything an application usually needs, in one import.
//!
//! ```
//! use entitycache::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let freight = Predicate::with_operator("Freight", Operator::GreaterThan, 100)?;
//! let query = EntityQuery::from_resource("Orders")
//!     .where_(&freight)
//!     .order_by("ShipCity desc")?
//!     .take(3);
//! assert_eq!(query.resource_name(), Some("Orders"));
//! assert_eq!(query.take_count(), Some(3));
//! # Ok(())
//! # }
//! ```

pub use crate::config::{FetchStrategy, ManagerConfig, MergeStrategy, QueryOptions, SaveOptions};
pub use crate::core::{CacheError, DataType, Result, Value};
pub use crate::entity::{Entity, EntityAction, EntityChanged, EntityId, EntityKey, EntityState};
pub use crate::manager::{EntityManager, EntityValidator, KeyGenerator};
pub use crate::metadata::{
    AutoGeneratedKeyType, DataProperty, EntityType, MetadataStore, NamingConvention, NavigationProperty,
    StructuralTypeDef,
};
pub use crate::query::{EntityQuery, Operator, OrderByClause, Predicate};
pub use crate::result::{ProjectionValue, QueryResult, QueryRow};
pub use crate::transport::{DataService, KeyMapping, QueryRequest, QueryResponse, SaveRequest, SaveResult};
