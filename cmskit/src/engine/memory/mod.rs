//! In-process engine holding tables of rows in memory.

mod query;

use super::{quote_identifier, sql_literal, DataEngine};
use crate::data::DataHandle;
use crate::error::{CmsError, Result};
use crate::schema::{FieldInfo, FieldMap, FieldType};
use crate::value::{Row, Value};
use query::Query;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Call counts per engine operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub field_loads: usize,
    pub detail_loads: usize,
    pub selects: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

struct Table {
    fields: FieldMap,
    rows: Vec<Row>,
    /// Highest integer key ever handed out; keys are not reused after delete.
    high_water: i64,
}

pub struct MemoryEngine {
    name: String,
    tables: RefCell<HashMap<String, Table>>,
    stats: Cell<EngineStats>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        MemoryEngine {
            name: name.to_string(),
            tables: RefCell::new(HashMap::new()),
            stats: Cell::new(EngineStats::default()),
        }
    }

    /// Create (or replace) a table with the given full field metadata.
    pub fn create_table(&self, name: &str, fields: FieldMap) {
        self.tables.borrow_mut().insert(
            name.to_string(),
            Table {
                fields,
                rows: Vec::new(),
                high_water: 0,
            },
        );
    }

    /// Append rows verbatim, keys included.
    pub fn seed(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.borrow_mut();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| unknown_table(&self.name, name))?;
        table.rows.extend(rows);
        Ok(())
    }

    /// Snapshot of a table's rows in storage order.
    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.tables
            .borrow()
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.get()
    }

    fn bump(&self, count: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.stats.get();
        count(&mut stats);
        self.stats.set(stats);
    }

    fn check_fields(&self, table: &Table, path: &str, row: &Row) -> Result<()> {
        match row.keys().find(|k| !table.fields.contains_key(k)) {
            Some(unknown) => Err(CmsError::Engine(format!(
                "{}: unknown field '{unknown}' in '{path}'",
                self.name
            ))),
            None => Ok(()),
        }
    }

    fn join_rows(&self, handle: &DataHandle, rows: &mut [Row]) -> Result<()> {
        let Some(join) = handle.join() else {
            return Ok(());
        };
        let tables = self.tables.borrow();
        let other = tables
            .get(&join.path)
            .ok_or_else(|| unknown_table(&self.name, &join.path))?;

        for row in rows.iter_mut() {
            let local = row.get(&join.local).cloned().unwrap_or_default();
            let matched = other.rows.iter().find(|candidate| {
                !local.is_null()
                    && candidate
                        .get(&join.foreign)
                        .map_or(false, |v| v.compare(&local).is_eq())
            });
            let names: Vec<&str> = if join.fields.is_empty() {
                other.fields.keys().collect()
            } else {
                join.fields.iter().map(String::as_str).collect()
            };
            for name in names {
                if row.contains_key(name) {
                    continue;
                }
                let value = matched
                    .and_then(|m| m.get(name).cloned())
                    .unwrap_or_default();
                row.insert(name, value);
            }
        }
        Ok(())
    }
}

fn unknown_table(engine: &str, name: &str) -> CmsError {
    CmsError::Engine(format!("{engine}: no table '{name}'"))
}

impl DataEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill_fields(&self, handle: &DataHandle) -> Result<FieldMap> {
        self.bump(|s| s.field_loads += 1);
        let tables = self.tables.borrow();
        let table = tables
            .get(handle.path())
            .ok_or_else(|| unknown_table(&self.name, handle.path()))?;
        Ok(table
            .fields
            .iter()
            .map(|(name, info)| (name, info.basic()))
            .collect())
    }

    fn fill_details(&self, handle: &DataHandle, fields: &mut FieldMap) -> Result<()> {
        self.bump(|s| s.detail_loads += 1);
        let tables = self.tables.borrow();
        let table = tables
            .get(handle.path())
            .ok_or_else(|| unknown_table(&self.name, handle.path()))?;
        for (name, info) in fields.iter_mut() {
            if let Some(full) = table.fields.get(name) {
                info.choices = full.choices.clone();
                info.info = full.info.clone();
                info.extra = full.extra.clone();
            }
        }
        Ok(())
    }

    fn select(&self, handle: &DataHandle, filter: &str) -> Result<Option<Vec<Row>>> {
        self.bump(|s| s.selects += 1);
        let query = Query::parse(filter)?;

        let (mut rows, base_fields) = {
            let tables = self.tables.borrow();
            let table = tables
                .get(handle.path())
                .ok_or_else(|| unknown_table(&self.name, handle.path()))?;
            let base: Vec<String> = table.fields.keys().map(str::to_string).collect();
            (table.rows.clone(), base)
        };
        self.join_rows(handle, &mut rows)?;

        let columns = handle.columns();
        let selected = query
            .select_indices(&rows)
            .into_iter()
            .map(|i| {
                let mut row = rows[i].clone();
                if let Some(columns) = &columns {
                    row.retain(|k, _| {
                        columns.iter().any(|c| c == k) || !base_fields.iter().any(|b| b == k)
                    });
                }
                row
            })
            .collect();
        Ok(Some(selected))
    }

    fn insert(&self, handle: &DataHandle, row: &Row) -> Result<Value> {
        self.bump(|s| s.inserts += 1);
        let mut tables = self.tables.borrow_mut();
        let table = tables
            .get_mut(handle.path())
            .ok_or_else(|| unknown_table(&self.name, handle.path()))?;
        self.check_fields(table, handle.path(), row)?;

        let pk = handle.primary_key();
        let key = match row.get(pk).filter(|v| !v.is_null()) {
            Some(key) => {
                if table.rows.iter().any(|r| r.get(pk).map_or(false, |v| v == key)) {
                    return Err(CmsError::Engine(format!(
                        "{}: duplicate key {key} in '{}'",
                        self.name,
                        handle.path()
                    )));
                }
                key.clone()
            }
            None => {
                let integer_key = table
                    .fields
                    .get(pk)
                    .map_or(true, |f| f.field_type == FieldType::Integer);
                if integer_key {
                    let max = table
                        .rows
                        .iter()
                        .filter_map(|r| r.get(pk).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0);
                    table.high_water = table.high_water.max(max) + 1;
                    Value::Int(table.high_water)
                } else {
                    Value::Text(uuid::Uuid::new_v4().to_string())
                }
            }
        };

        let mut stored = Row::new();
        stored.insert(pk, key.clone());
        for (name, _) in table.fields.iter() {
            if name != pk {
                stored.insert(name, row.get(name).cloned().unwrap_or_default());
            }
        }
        table.rows.push(stored);
        Ok(key)
    }

    fn update(&self, handle: &DataHandle, filter: &str, row: &Row) -> Result<()> {
        self.bump(|s| s.updates += 1);
        let query = Query::parse(filter)?;
        let mut tables = self.tables.borrow_mut();
        let table = tables
            .get_mut(handle.path())
            .ok_or_else(|| unknown_table(&self.name, handle.path()))?;
        self.check_fields(table, handle.path(), row)?;

        let targets = query.select_indices(&table.rows);
        let pk = handle.primary_key();
        if let Some(new_key) = row.get(pk) {
            let collides = table
                .rows
                .iter()
                .enumerate()
                .any(|(i, r)| !targets.contains(&i) && r.get(pk) == Some(new_key));
            if collides || targets.len() > 1 {
                return Err(CmsError::Engine(format!(
                    "{}: re-key to {new_key} would duplicate a key in '{}'",
                    self.name,
                    handle.path()
                )));
            }
        }

        for i in targets {
            for (name, value) in row.iter() {
                table.rows[i].insert(name, value.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, handle: &DataHandle, filter: &str) -> Result<()> {
        self.bump(|s| s.deletes += 1);
        let query = Query::parse(filter)?;
        let mut tables = self.tables.borrow_mut();
        let table = tables
            .get_mut(handle.path())
            .ok_or_else(|| unknown_table(&self.name, handle.path()))?;

        let targets = query.select_indices(&table.rows);
        let mut index = 0;
        table.rows.retain(|_| {
            let keep = !targets.contains(&index);
            index += 1;
            keep
        });
        Ok(())
    }

    fn prepare_name(&self, name: &str) -> String {
        quote_identifier(name, '`')
    }

    fn prepare_value(&self, value: &Value) -> String {
        sql_literal(value)
    }
}

/// Build a field map from `(name, info)` pairs.
pub fn field_map<'a>(pairs: impl IntoIterator<Item = (&'a str, FieldInfo)>) -> FieldMap {
    pairs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoinSpec;
    use crate::data::HandleOptions;
    use std::rc::Rc;

    fn engine() -> Rc<MemoryEngine> {
        let engine = Rc::new(MemoryEngine::new());
        engine.create_table(
            "pages",
            field_map([
                ("id", FieldInfo::new(FieldType::Integer)),
                ("title", FieldInfo::new(FieldType::String).with_info("label=Title")),
                ("author_id", FieldInfo::new(FieldType::Integer).nullable()),
            ]),
        );
        engine.create_table(
            "authors",
            field_map([
                ("id", FieldInfo::new(FieldType::Integer)),
                ("name", FieldInfo::new(FieldType::String)),
            ]),
        );
        engine
            .seed(
                "authors",
                vec![[("id", Value::Int(7)), ("name", Value::from("Ada"))]
                    .into_iter()
                    .collect()],
            )
            .unwrap();
        engine
    }

    fn handle(engine: &Rc<MemoryEngine>, options: HandleOptions) -> DataHandle {
        DataHandle::new("pages", engine.clone(), options)
    }

    #[test]
    fn test_insert_generates_increasing_keys() {
        let engine = engine();
        let pages = handle(&engine, HandleOptions::default());
        let row: Row = [("title", Value::from("Home"))].into_iter().collect();
        assert_eq!(engine.insert(&pages, &row).unwrap(), Value::Int(1));
        assert_eq!(engine.insert(&pages, &row).unwrap(), Value::Int(2));

        engine.delete(&pages, "`id` = 2").unwrap();
        assert_eq!(engine.insert(&pages, &row).unwrap(), Value::Int(3));
        assert_eq!(engine.stats().inserts, 3);
    }

    #[test]
    fn test_text_keys_get_uuid() {
        let engine = Rc::new(MemoryEngine::new());
        engine.create_table(
            "slugs",
            field_map([("slug", FieldInfo::new(FieldType::String))]),
        );
        let slugs = DataHandle::new(
            "slugs",
            engine.clone(),
            HandleOptions {
                primary_key: "slug".into(),
                ..HandleOptions::default()
            },
        );
        let key = engine.insert(&slugs, &Row::new()).unwrap();
        assert_eq!(key.as_str().map(str::len), Some(36));
    }

    #[test]
    fn test_duplicate_and_unknown_fields_rejected() {
        let engine = engine();
        let pages = handle(&engine, HandleOptions::default());
        let row: Row = [("id", Value::Int(1))].into_iter().collect();
        engine.insert(&pages, &row).unwrap();
        assert!(engine.insert(&pages, &row).is_err());

        let bad: Row = [("colour", Value::from("red"))].into_iter().collect();
        assert!(engine.insert(&pages, &bad).is_err());
    }

    #[test]
    fn test_rekey_collision_rejected() {
        let engine = engine();
        let pages = handle(&engine, HandleOptions::default());
        engine.insert(&pages, &Row::new()).unwrap();
        engine.insert(&pages, &Row::new()).unwrap();
        let rekey: Row = [("id", Value::Int(1))].into_iter().collect();
        assert!(engine.update(&pages, "`id` = 2", &rekey).is_err());
    }

    #[test]
    fn test_basic_and_detailed_fields() {
        let engine = engine();
        let pages = handle(&engine, HandleOptions::default());
        let mut fields = engine.fill_fields(&pages).unwrap();
        assert!(fields.get("title").unwrap().info.is_none());
        engine.fill_details(&pages, &mut fields).unwrap();
        assert_eq!(fields.get("title").unwrap().info.as_deref(), Some("label=Title"));
    }

    #[test]
    fn test_select_with_join_and_projection() {
        let engine = engine();
        let pages = handle(
            &engine,
            HandleOptions {
                fieldset: Some(vec!["title".into()]),
                join: Some(JoinSpec {
                    path: "authors".into(),
                    local: "author_id".into(),
                    foreign: "id".into(),
                    fields: vec!["name".into()],
                }),
                ..HandleOptions::default()
            },
        );
        engine
            .seed(
                "pages",
                vec![
                    [("id", Value::Int(1)), ("title", Value::from("Home")), ("author_id", Value::Int(7))]
                        .into_iter()
                        .collect(),
                    [("id", Value::Int(2)), ("title", Value::from("Draft")), ("author_id", Value::Null)]
                        .into_iter()
                        .collect(),
                ],
            )
            .unwrap();

        let rows = engine.select(&pages, "`name` = 'Ada'").unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["id", "title", "name"]);

        let rows = engine.select(&pages, " ORDER BY `id` DESC").unwrap().unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Null));
    }
}
