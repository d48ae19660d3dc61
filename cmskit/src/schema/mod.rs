mod coerce;
mod types;

pub use coerce::{coerce, coerce_row};
pub use types::{parse_info, FieldInfo, FieldMap, FieldType};
