use super::{quote_identifier, sql_literal, DataEngine};
use crate::config::JoinSpec;
use crate::data::DataHandle;
use crate::error::{CmsError, Result};
use crate::schema::{FieldInfo, FieldMap, FieldType};
use crate::value::{Row, Value};
use regex::Regex;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::OnceLock;

/// SQL-table engine over a SQLite database.
///
/// Detailed field metadata is read from an optional table:
///
/// ```sql
/// CREATE TABLE _field_info (dataset TEXT, field TEXT, choices TEXT, info TEXT);
/// ```
///
/// where `choices` is pipe-delimited.
pub struct SqliteEngine {
    name: String,
    conn: Connection,
}

struct Column {
    name: String,
    declared: String,
    not_null: bool,
    primary_key: bool,
}

impl SqliteEngine {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(SqliteEngine {
            name: "sqlite".to_string(),
            conn,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(SqliteEngine {
            name: "sqlite".to_string(),
            conn,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Run DDL or seed statements.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn fail(&self, err: rusqlite::Error) -> CmsError {
        CmsError::Engine(format!("{}: {err}", self.name))
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1)"#)
            .map_err(|e| self.fail(e))?;
        let columns = stmt
            .query_map(params![table], |row| {
                Ok(Column {
                    name: row.get(0)?,
                    declared: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    primary_key: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(|e| self.fail(e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.fail(e))?;
        Ok(columns)
    }

    fn has_table(&self, table: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.fail(e))?;
        Ok(found.is_some())
    }

    /// Joined field names exposed by a join spec.
    fn joined_names(&self, base: &str, join: &JoinSpec) -> Result<Vec<String>> {
        if !join.fields.is_empty() {
            return Ok(join.fields.clone());
        }
        let own: Vec<String> = self.columns(base)?.into_iter().map(|c| c.name).collect();
        Ok(self
            .columns(&join.path)?
            .into_iter()
            .map(|c| c.name)
            .filter(|n| !own.contains(n))
            .collect())
    }

    /// A key for a row inserted without one, unless SQLite assigns it
    /// through an `INTEGER PRIMARY KEY` rowid alias.
    fn generate_key(&self, table: &str, pk: &str) -> Result<Option<Value>> {
        let columns = self.columns(table)?;
        let Some(column) = columns.iter().find(|c| c.name == pk) else {
            return Ok(None);
        };
        let key_columns = columns.iter().filter(|c| c.primary_key).count();
        if column.primary_key && key_columns == 1 && column.declared.trim().eq_ignore_ascii_case("INTEGER") {
            return Ok(None);
        }
        let key = match map_declared(&column.declared).0 {
            FieldType::Integer => {
                let next: i64 = self
                    .conn
                    .query_row(
                        &format!("SELECT COALESCE(MAX({}), 0) + 1 FROM {}", quote(pk), quote(table)),
                        [],
                        |r| r.get(0),
                    )
                    .map_err(|e| self.fail(e))?;
                Value::Int(next)
            }
            _ => Value::Text(uuid::Uuid::new_v4().to_string()),
        };
        Ok(Some(key))
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        log::debug!("{}: {sql}", self.name);
        let mut stmt = self.conn.prepare(sql).map_err(|e| self.fail(e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let mut rows = stmt.query([]).map_err(|e| self.fail(e))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(|e| self.fail(e))? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                if record.contains_key(name) {
                    continue;
                }
                let value = row.get_ref(i).map_err(|e| self.fail(e))?;
                record.insert(name.as_str(), from_sql(value));
            }
            result.push(record);
        }
        Ok(result)
    }
}

/// Map a declared SQLite column type to a field type, length and subtype.
fn map_declared(declared: &str) -> (FieldType, Option<u32>, Option<String>) {
    static LENGTH: OnceLock<Regex> = OnceLock::new();
    let length_re = LENGTH.get_or_init(|| Regex::new(r"\(\s*(\d+)").expect("static pattern"));

    let upper = declared.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or("").trim().to_string();
    let length = length_re
        .captures(&upper)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let field_type = if base.contains("BOOL") {
        FieldType::Boolean
    } else if base.contains("INT") {
        FieldType::Integer
    } else if base.contains("DATETIME") || base.contains("TIMESTAMP") {
        FieldType::Datetime
    } else if base.contains("DATE") {
        FieldType::Date
    } else if base.contains("CHAR") && length.is_some() {
        FieldType::String
    } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
        FieldType::Text
    } else if base.is_empty() || base.contains("BLOB") {
        FieldType::Binary
    } else if base.contains("REAL")
        || base.contains("FLOA")
        || base.contains("DOUB")
        || base.contains("NUMERIC")
        || base.contains("DECIMAL")
    {
        FieldType::Float
    } else {
        FieldType::Text
    };

    let subtype = (!base.is_empty()).then(|| base.to_ascii_lowercase());
    (field_type, length, subtype)
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Bool(b) => ToSqlOutput::from(*b),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// Turn an opaque fragment into a statement tail.
fn where_clause(filter: &str) -> String {
    let trimmed = filter.trim();
    let upper = trimmed.to_ascii_uppercase();
    if trimmed.is_empty() {
        String::new()
    } else if upper.starts_with("ORDER ") || upper.starts_with("LIMIT ") {
        format!(" {trimmed}")
    } else {
        format!(" WHERE {trimmed}")
    }
}

fn quote(name: &str) -> String {
    quote_identifier(name, '"')
}

impl DataEngine for SqliteEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill_fields(&self, handle: &DataHandle) -> Result<FieldMap> {
        let columns = self.columns(handle.path())?;
        if columns.is_empty() {
            return Err(CmsError::Engine(format!(
                "{}: no table '{}'",
                self.name,
                handle.path()
            )));
        }
        Ok(columns
            .into_iter()
            .map(|c| {
                let (field_type, length, subtype) = map_declared(&c.declared);
                let mut info = FieldInfo::new(field_type);
                info.length = length;
                info.subtype = subtype;
                info.nullable = !c.not_null && !c.primary_key;
                (c.name, info)
            })
            .collect())
    }

    fn fill_details(&self, handle: &DataHandle, fields: &mut FieldMap) -> Result<()> {
        if !self.has_table("_field_info")? {
            return Ok(());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT field, choices, info FROM _field_info WHERE dataset = ?1")
            .map_err(|e| self.fail(e))?;
        let details = stmt
            .query_map(params![handle.path()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| self.fail(e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.fail(e))?;

        for (field, choices, info) in details {
            if let Some(target) = fields.get_mut(&field) {
                target.choices = choices.map(|c| {
                    c.split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                });
                target.info = info;
            }
        }
        Ok(())
    }

    fn select(&self, handle: &DataHandle, filter: &str) -> Result<Option<Vec<Row>>> {
        let base = quote(handle.path());
        let (source, joined) = match handle.join() {
            None => (base.clone(), Vec::new()),
            Some(join) => {
                let names = self.joined_names(handle.path(), join)?;
                let other = quote(&join.path);
                let extra: String = names
                    .iter()
                    .map(|n| format!(", {other}.{} AS {}", quote(n), quote(n)))
                    .collect();
                (
                    format!(
                        "(SELECT {base}.*{extra} FROM {base} LEFT JOIN {other} ON {base}.{} = {other}.{})",
                        quote(&join.local),
                        quote(&join.foreign)
                    ),
                    names,
                )
            }
        };

        let projection = match handle.columns() {
            None => "*".to_string(),
            Some(columns) => columns
                .iter()
                .chain(joined.iter().filter(|j| !columns.contains(j)))
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", "),
        };

        let sql = format!("SELECT {projection} FROM {source}{}", where_clause(filter));
        self.query_rows(&sql).map(Some)
    }

    fn insert(&self, handle: &DataHandle, row: &Row) -> Result<Value> {
        let table = quote(handle.path());
        let pk = handle.primary_key();
        let generated = match row.get(pk) {
            Some(key) if !key.is_null() => None,
            _ => self.generate_key(handle.path(), pk)?,
        };
        let mut row = row.clone();
        if let Some(key) = &generated {
            row.insert(pk, key.clone());
        }

        let sql = if row.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            let names: Vec<String> = row.keys().map(quote).collect();
            let slots: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                names.join(", "),
                slots.join(", ")
            )
        };
        log::debug!("{}: {sql}", self.name);
        self.conn
            .execute(&sql, params_from_iter(row.values()))
            .map_err(|e| self.fail(e))?;
        if let Some(key) = generated {
            return Ok(key);
        }

        let rowid = self.conn.last_insert_rowid();
        let key: Option<Value> = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM {table} WHERE rowid = ?1",
                    quote(pk)
                ),
                params![rowid],
                |r| r.get_ref(0).map(from_sql),
            )
            .optional()
            .map_err(|e| self.fail(e))?;
        Ok(match key {
            Some(Value::Null) | None => Value::Int(rowid),
            Some(key) => key,
        })
    }

    fn update(&self, handle: &DataHandle, filter: &str, row: &Row) -> Result<()> {
        if row.is_empty() {
            return Ok(());
        }
        let table = quote(handle.path());
        let assignments: Vec<String> = row
            .keys()
            .enumerate()
            .map(|(i, name)| format!("{} = ?{}", quote(name), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {table} SET {} WHERE rowid IN (SELECT rowid FROM {table}{})",
            assignments.join(", "),
            where_clause(filter)
        );
        log::debug!("{}: {sql}", self.name);
        self.conn
            .execute(&sql, params_from_iter(row.values()))
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn delete(&self, handle: &DataHandle, filter: &str) -> Result<()> {
        let table = quote(handle.path());
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN (SELECT rowid FROM {table}{})",
            where_clause(filter)
        );
        log::debug!("{}: {sql}", self.name);
        self.conn.execute(&sql, []).map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn prepare_name(&self, name: &str) -> String {
        quote(name)
    }

    fn prepare_value(&self, value: &Value) -> String {
        sql_literal(value)
    }
}
