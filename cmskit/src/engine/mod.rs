//! The backend contract consumed by [`DataHandle`](crate::data::DataHandle).
//!
//! An engine owns its filter dialect: it formats fragments through
//! [`DataEngine::condition`], [`DataEngine::ordering`] and
//! [`DataEngine::limit`], and receives the concatenated text back in
//! `select`, `update` and `delete`. The data layer never looks inside.

pub mod memory;
pub mod sqlite;

pub use memory::{field_map, EngineStats, MemoryEngine};
pub use sqlite::SqliteEngine;

use crate::data::DataHandle;
use crate::error::{CmsError, Result};
use crate::schema::FieldMap;
use crate::value::{Row, Value};

pub trait DataEngine {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Basic field metadata: type, subtype, length, nullable.
    fn fill_fields(&self, handle: &DataHandle) -> Result<FieldMap>;

    /// Add detailed metadata (choices, info annotations) to `fields`.
    fn fill_details(&self, handle: &DataHandle, fields: &mut FieldMap) -> Result<()> {
        let _ = (handle, fields);
        Ok(())
    }

    /// Rows matching `filter`. `None` means the backend produced no
    /// collection at all, which callers treat as zero rows.
    fn select(&self, handle: &DataHandle, filter: &str) -> Result<Option<Vec<Row>>>;

    /// Insert one row and return the generated primary key.
    fn insert(&self, handle: &DataHandle, row: &Row) -> Result<Value> {
        let _ = (handle, row);
        not_implemented(self.name(), "insert")
    }

    fn update(&self, handle: &DataHandle, filter: &str, row: &Row) -> Result<()> {
        let _ = (handle, filter, row);
        not_implemented(self.name(), "update")
    }

    fn delete(&self, handle: &DataHandle, filter: &str) -> Result<()> {
        let _ = (handle, filter);
        not_implemented(self.name(), "delete")
    }

    /// Escape a field name for use in a fragment.
    fn prepare_name(&self, name: &str) -> String;

    /// Render a value as a literal for use in a fragment.
    fn prepare_value(&self, value: &Value) -> String;

    /// `name` and `value` arrive already prepared.
    fn condition(&self, name: &str, operator: &str, value: &str) -> String {
        format!("{name} {operator} {value}")
    }

    fn ordering(&self, name: &str, descending: bool) -> String {
        if descending {
            format!(" ORDER BY {name} DESC")
        } else {
            format!(" ORDER BY {name}")
        }
    }

    fn limit(&self, count: usize) -> String {
        format!(" LIMIT {count}")
    }

    fn conjunction(&self) -> &str {
        " AND "
    }
}

/// Abort on an engine operation the plugin never provided.
pub fn not_implemented(engine: &str, operation: &str) -> ! {
    let err = CmsError::NotImplemented {
        engine: engine.to_string(),
        operation: operation.to_string(),
    };
    log::error!("{err}");
    panic!("{err}");
}

/// Quote an identifier by wrapping it in `quote` and doubling embedded quotes.
pub(crate) fn quote_identifier(name: &str, quote: char) -> String {
    let doubled = format!("{quote}{quote}");
    format!("{quote}{}{quote}", name.replace(quote, &doubled))
}

/// SQL-style literal rendering shared by the bundled engines.
pub(crate) fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{f:?}"),
        Value::Float(_) => "NULL".to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
