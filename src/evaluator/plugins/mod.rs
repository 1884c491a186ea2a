pub mod comparison;
pub mod function;
pub mod logical;

pub use comparison::ComparisonEvaluator;
pub use function::{FunctionDef, FunctionEvaluator};
pub use logical::LogicalEvaluator;
