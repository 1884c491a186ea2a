pub mod error;
pub mod types;
pub mod value;

pub use error::{CacheError, ErrorCategory, Result};
pub use types::{DataType, format_datetime, parse_datetime};
pub use value::{Value, format_duration, parse_duration};
