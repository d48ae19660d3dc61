//! One addressable dataset bound to one engine.
//!
//! A [`DataHandle`] builds engine-formatted filter and order fragments,
//! caches field metadata, and runs CRUD with every value coerced to its
//! declared type on the way in and on the way out.

use crate::config::{default_primary_key, JoinSpec};
use crate::engine::DataEngine;
use crate::error::{CmsError, Result};
use crate::schema::{coerce, coerce_row, FieldInfo, FieldMap};
use crate::value::{Row, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Construction options for a [`DataHandle`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandleOptions {
    pub primary_key: String,
    /// Projection. The primary key is always part of it.
    pub fieldset: Option<Vec<String>>,
    pub join: Option<JoinSpec>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        HandleOptions {
            primary_key: default_primary_key(),
            fieldset: None,
            join: None,
        }
    }
}

pub struct DataHandle {
    id: String,
    path: String,
    engine: Rc<dyn DataEngine>,
    options: HandleOptions,
    fields: RefCell<Option<FieldMap>>,
    detailed: Cell<bool>,
    last_id: RefCell<Value>,
    error: RefCell<Option<String>>,
}

const NULL_NEGATIONS: [&str; 3] = ["!=", "<>", "NOT LIKE"];

impl DataHandle {
    pub fn new(path: &str, engine: Rc<dyn DataEngine>, options: HandleOptions) -> Self {
        let id = format!("{path}:{}", engine.name());
        DataHandle {
            id,
            path: path.to_string(),
            engine,
            options,
            fields: RefCell::new(None),
            detailed: Cell::new(false),
            last_id: RefCell::new(Value::Null),
            error: RefCell::new(None),
        }
    }

    /// Replace the identifier views are keyed by.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn primary_key(&self) -> &str {
        &self.options.primary_key
    }

    pub fn join(&self) -> Option<&JoinSpec> {
        self.options.join.as_ref()
    }

    pub fn engine(&self) -> &Rc<dyn DataEngine> {
        &self.engine
    }

    /// The projected columns, primary key first, or `None` for all columns.
    pub fn columns(&self) -> Option<Vec<String>> {
        let fieldset = self.options.fieldset.as_ref()?;
        let pk = self.primary_key();
        let mut columns = vec![pk.to_string()];
        columns.extend(
            fieldset
                .iter()
                .filter(|name| name.as_str() != pk)
                .cloned(),
        );
        Some(columns)
    }

    // --- fragments ---

    /// Equality predicate on `field`.
    pub fn filter(&self, field: &str, value: impl Into<Value>) -> String {
        self.filter_with(field, "=", value)
    }

    /// Predicate on `field` with an explicit operator. A null value turns
    /// the operator into `IS` or `IS NOT`.
    pub fn filter_with(&self, field: &str, operator: &str, value: impl Into<Value>) -> String {
        let value = value.into();
        let operator = operator.trim();
        let upper = operator.to_ascii_uppercase();
        let operator = if value.is_null() && !upper.starts_with("IS") {
            if NULL_NEGATIONS.contains(&upper.as_str()) {
                "IS NOT"
            } else {
                "IS"
            }
        } else {
            operator
        };
        self.engine.condition(
            &self.engine.prepare_name(field),
            operator,
            &self.engine.prepare_value(&value),
        )
    }

    pub fn order(&self, field: &str, descending: bool) -> String {
        self.engine
            .ordering(&self.engine.prepare_name(field), descending)
    }

    /// Filter selecting the single row whose primary key is `id`.
    pub fn row_filter(&self, id: impl Into<Value>) -> String {
        let mut fragment = self.filter(self.primary_key(), id);
        fragment.push_str(&self.engine.limit(1));
        fragment
    }

    /// Join condition fragments with the engine's conjunction, skipping blanks.
    pub fn conjoin<S: AsRef<str>>(&self, parts: &[S]) -> String {
        parts
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(self.engine.conjunction())
    }

    // --- metadata ---

    /// Field metadata, loaded on first use. `detailed` adds choices and the
    /// parsed info annotations; that second phase runs at most once.
    pub fn fields(&self, detailed: bool) -> Result<FieldMap> {
        if self.fields.borrow().is_none() {
            let mut basic = self.record(self.engine.fill_fields(self))?;
            if let Some(columns) = self.columns() {
                basic.retain(|name, _| columns.iter().any(|c| c == name));
            }
            *self.fields.borrow_mut() = Some(basic);
        }

        if detailed && !self.detailed.get() {
            let mut fields = self.fields.borrow().clone().unwrap_or_default();
            self.record(self.engine.fill_details(self, &mut fields))?;
            for (_, info) in fields.iter_mut() {
                info.merge_info();
            }
            *self.fields.borrow_mut() = Some(fields);
            self.detailed.set(true);
        }

        Ok(self.fields.borrow().clone().unwrap_or_default())
    }

    pub fn field(&self, name: &str) -> Result<Option<FieldInfo>> {
        Ok(self.fields(false)?.get(name).cloned())
    }

    // --- reads ---

    /// Engine select with coerced values. `None` when the engine produced
    /// no collection.
    pub fn select(&self, filter: &str) -> Result<Option<Vec<Row>>> {
        let fields = self.fields(false)?;
        let rows = self.record(self.engine.select(self, filter))?;
        Ok(rows.map(|rows| {
            rows.into_iter()
                .map(|row| coerce_row(row, &fields))
                .collect()
        }))
    }

    pub fn rows(&self, filter: &str) -> Result<Vec<Row>> {
        Ok(self.select(filter)?.unwrap_or_default())
    }

    pub fn row(&self, id: impl Into<Value>) -> Result<Option<Row>> {
        Ok(self.rows(&self.row_filter(id))?.into_iter().next())
    }

    // --- writes ---

    /// Insert `row`. A pre-set primary key is dropped and the engine assigns
    /// one. On success the coerced key is written into `row` and returned;
    /// on failure `row` is left as it was.
    pub fn put(&self, row: &mut Row) -> Result<Value> {
        let pk = self.primary_key().to_string();
        let fields = self.fields(false)?;

        let mut insert = row.clone();
        if let Some(preset) = insert.remove(&pk) {
            if !preset.is_null() {
                log::debug!("Dropping preset key {pk}={preset} on insert into '{}'", self.path);
            }
        }
        let insert = coerce_row(insert, &fields);

        let key = self.record(self.engine.insert(self, &insert))?;
        let key = match fields.get(&pk) {
            Some(info) => coerce(key, info),
            None => key,
        };

        row.insert(pk, key.clone());
        *self.last_id.borrow_mut() = key.clone();
        Ok(key)
    }

    /// Key generated by the last successful [`put`](Self::put).
    pub fn last_id(&self) -> Value {
        self.last_id.borrow().clone()
    }

    /// Write the fields of `new` that differ from `old`. Nothing differing
    /// means nothing is sent to the engine.
    pub fn update(&self, old: &Row, new: &Row) -> Result<()> {
        let changed: Row = new
            .iter()
            .filter(|(name, value)| old.get(name) != Some(*value))
            .map(|(name, value)| (name, value.clone()))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let pk = self.primary_key();
        let id = [old.get(pk), new.get(pk)]
            .into_iter()
            .flatten()
            .find(|v| !v.is_null())
            .cloned();
        let Some(id) = id else {
            return self.record(Err(CmsError::Validation(format!(
                "update of '{}' needs the primary key '{pk}'",
                self.path
            ))));
        };

        let fields = self.fields(false)?;
        let changed = coerce_row(changed, &fields);
        self.record(self.engine.update(self, &self.row_filter(id), &changed))
    }

    /// Write `row` to every row matching `filter`. The primary key can't be
    /// set this way.
    pub fn update_rows(&self, filter: &str, row: &Row) -> Result<()> {
        if row.contains_key(self.primary_key()) {
            return self.record(Err(CmsError::Validation(format!(
                "bulk update of '{}' may not set the primary key '{}'",
                self.path,
                self.primary_key()
            ))));
        }
        if row.is_empty() {
            return Ok(());
        }
        let fields = self.fields(false)?;
        let row = coerce_row(row.clone(), &fields);
        self.record(self.engine.update(self, filter, &row))
    }

    pub fn delete(&self, id: impl Into<Value>) -> Result<()> {
        let filter = self.row_filter(id);
        self.record(self.engine.delete(self, &filter))
    }

    /// Delete every row matching `filter`. A blank filter is refused.
    pub fn delete_rows(&self, filter: &str) -> Result<()> {
        if filter.trim().is_empty() {
            return self.record(Err(CmsError::Validation(format!(
                "refusing to delete from '{}' without a filter",
                self.path
            ))));
        }
        self.record(self.engine.delete(self, filter))
    }

    // --- diagnostics ---

    pub fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    pub fn set_error(&self, message: &str) {
        *self.error.borrow_mut() = Some(message.to_string());
    }

    pub fn clear_error(&self) {
        *self.error.borrow_mut() = None;
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.set_error(&err.to_string());
        }
        result
    }
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("engine", &self.engine.name())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{field_map, MemoryEngine};
    use crate::schema::FieldType;
    use pretty_assertions::assert_eq;

    fn engine() -> Rc<MemoryEngine> {
        let engine = Rc::new(MemoryEngine::new());
        engine.create_table(
            "posts",
            field_map([
                ("id", FieldInfo::new(FieldType::Integer)),
                (
                    "title",
                    FieldInfo::new(FieldType::String).with_info("label=Title|required"),
                ),
                ("status", FieldInfo::new(FieldType::Choice).with_choices(&["draft", "live"])),
                ("score", FieldInfo::new(FieldType::Float).nullable()),
            ]),
        );
        engine
    }

    fn posts(engine: &Rc<MemoryEngine>) -> DataHandle {
        DataHandle::new("posts", engine.clone(), HandleOptions::default())
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_fragments() {
        let engine = engine();
        let handle = posts(&engine);
        assert_eq!(handle.filter("title", "It's"), "`title` = 'It''s'");
        assert_eq!(handle.filter_with("score", ">=", 2.5), "`score` >= 2.5");
        assert_eq!(handle.filter("score", Value::Null), "`score` IS NULL");
        assert_eq!(handle.filter_with("score", "!=", Value::Null), "`score` IS NOT NULL");
        assert_eq!(handle.filter_with("score", "IS NOT", Value::Null), "`score` IS NOT NULL");
        assert_eq!(handle.order("id", true), " ORDER BY `id` DESC");
        assert_eq!(handle.row_filter(3), "`id` = 3 LIMIT 1");
        assert_eq!(
            handle.conjoin(&[handle.filter("id", 1), String::new(), handle.filter("title", "a")]),
            "`id` = 1 AND `title` = 'a'"
        );
    }

    #[test]
    fn test_put_assigns_typed_key() {
        let engine = engine();
        let handle = posts(&engine);
        let mut first = row(&[("title", Value::from("One"))]);
        let key = handle.put(&mut first).unwrap();
        assert_eq!(key, Value::Int(1));
        assert_eq!(first.get("id"), Some(&Value::Int(1)));
        assert_eq!(handle.last_id(), Value::Int(1));

        let mut empty = Row::new();
        assert_eq!(handle.put(&mut empty).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_put_strips_preset_key() {
        let engine = engine();
        let handle = posts(&engine);
        let mut preset = row(&[("id", Value::Int(99)), ("title", Value::from("Mine"))]);
        let key = handle.put(&mut preset).unwrap();
        assert_eq!(key, Value::Int(1));
        assert_eq!(preset.get("id"), Some(&Value::Int(1)));
        assert!(handle.row(99).unwrap().is_none());
    }

    #[test]
    fn test_put_failure_leaves_row_untouched() {
        let engine = engine();
        let handle = posts(&engine);
        let mut bad = row(&[("colour", Value::from("red"))]);
        let before = bad.clone();
        assert!(matches!(handle.put(&mut bad), Err(CmsError::Engine(_))));
        assert_eq!(bad, before);
        assert!(handle.error().unwrap().contains("colour"));
        assert_eq!(handle.last_id(), Value::Null);
        handle.clear_error();
        assert_eq!(handle.error(), None);
    }

    #[test]
    fn test_reads_are_coerced() {
        let engine = engine();
        engine
            .seed(
                "posts",
                vec![row(&[
                    ("id", Value::from("5")),
                    ("title", Value::Int(42)),
                    ("status", Value::from("live")),
                    ("score", Value::from("")),
                ])],
            )
            .unwrap();
        let handle = posts(&engine);
        let found = handle.row(5).unwrap().unwrap();
        assert_eq!(
            found,
            row(&[
                ("id", Value::Int(5)),
                ("title", Value::from("42")),
                ("status", Value::from("live")),
                ("score", Value::Null),
            ])
        );
        assert!(handle.row(6).unwrap().is_none());
    }

    #[test]
    fn test_update_without_changes_skips_engine() {
        let engine = engine();
        let handle = posts(&engine);
        let mut original = row(&[("title", Value::from("Same"))]);
        handle.put(&mut original).unwrap();

        handle.update(&original, &original.clone()).unwrap();
        assert_eq!(engine.stats().updates, 0);
    }

    #[test]
    fn test_update_sends_changed_fields_only() {
        let engine = engine();
        let handle = posts(&engine);
        let mut original = row(&[("title", Value::from("Old")), ("status", Value::from("draft"))]);
        handle.put(&mut original).unwrap();

        let mut edited = original.clone();
        edited.insert("status", Value::from("live"));
        handle.update(&original, &edited).unwrap();
        assert_eq!(engine.stats().updates, 1);

        let stored = handle.row(1).unwrap().unwrap();
        assert_eq!(stored.get("status"), Some(&Value::from("live")));
        assert_eq!(stored.get("title"), Some(&Value::from("Old")));
    }

    #[test]
    fn test_update_needs_primary_key() {
        let engine = engine();
        let handle = posts(&engine);
        let old = row(&[("title", Value::from("a"))]);
        let new = row(&[("title", Value::from("b"))]);
        assert!(matches!(handle.update(&old, &new), Err(CmsError::Validation(_))));
        assert_eq!(engine.stats().updates, 0);
    }

    #[test]
    fn test_update_rows_rejects_primary_key() {
        let engine = engine();
        let handle = posts(&engine);
        for title in ["a", "b"] {
            handle.put(&mut row(&[("title", Value::from(title))])).unwrap();
        }
        let rekey = row(&[("id", Value::Int(9))]);
        assert!(handle.update_rows("", &rekey).is_err());

        handle
            .update_rows("", &row(&[("status", Value::from("live"))]))
            .unwrap();
        assert!(handle
            .rows("")
            .unwrap()
            .iter()
            .all(|r| r.get("status") == Some(&Value::from("live"))));
    }

    #[test]
    fn test_delete_rows_requires_filter() {
        let engine = engine();
        let handle = posts(&engine);
        handle.put(&mut Row::new()).unwrap();
        assert!(matches!(handle.delete_rows(""), Err(CmsError::Validation(_))));
        assert!(matches!(handle.delete_rows("   "), Err(CmsError::Validation(_))));
        assert_eq!(engine.stats().deletes, 0);

        handle.delete(1).unwrap();
        assert!(handle.rows("").unwrap().is_empty());
    }

    #[test]
    fn test_fields_two_phases() {
        let engine = engine();
        let handle = posts(&engine);

        let basic = handle.fields(false).unwrap();
        assert_eq!(basic.get("status").unwrap().choices, None);

        let detailed = handle.fields(true).unwrap();
        let title = detailed.get("title").unwrap();
        assert_eq!(title.extra.get("label").map(String::as_str), Some("Title"));
        assert_eq!(title.extra.get("required").map(String::as_str), Some("true"));

        handle.fields(true).unwrap();
        handle.fields(false).unwrap();
        assert_eq!(engine.stats().field_loads, 1);
        assert_eq!(engine.stats().detail_loads, 1);
    }

    #[test]
    fn test_fieldset_projection_keeps_primary_key() {
        let engine = engine();
        let handle = DataHandle::new(
            "posts",
            engine.clone(),
            HandleOptions {
                fieldset: Some(vec!["title".into()]),
                ..HandleOptions::default()
            },
        );
        assert_eq!(handle.columns(), Some(vec!["id".to_string(), "title".to_string()]));
        let fields = handle.fields(false).unwrap();
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["id", "title"]);

        handle
            .put(&mut row(&[("title", Value::from("t")), ("status", Value::from("live"))]))
            .unwrap();
        let rows = handle.rows("").unwrap();
        assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["id", "title"]);
    }
}
