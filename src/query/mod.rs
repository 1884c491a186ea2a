pub mod entity_query;
pub mod fn_node;
pub mod operator;
pub mod order_by;
pub mod predicate;

pub use entity_query::EntityQuery;
pub use fn_node::{is_property_path, FnNode, LocalFn};
pub use operator::Operator;
pub use order_by::{CompiledSortKey, NullOrdering, OrderByClause, SortExecutor, SortKey};
pub use predicate::{LocalPredicate, Operand, Predicate};
