//! Materialized, cursor-navigable row snapshots.
//!
//! A [`View`] pulls rows from a [`RowSource`], passes each through an
//! optional row hook that may rewrite or drop it, numbers the survivors,
//! computes summaries and finally hands itself to an optional view hook.
//! Populated rows are cached until a refresh is requested.

mod cursor;

pub use cursor::{Cursor, Parity, ViewRow};

use crate::data::DataHandle;
use crate::error::{CmsError, Result};
use crate::registry::TypeRegistry;
use crate::schema::FieldInfo;
use crate::value::{Row, Value};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

pub const COUNT: &str = "COUNT";

/// Where a view gets its rows.
pub enum RowSource {
    /// Select from the owning handle with the view's filter.
    Query,
    /// One row per field of the owning handle, detailed metadata included.
    Fields,
    /// One row per live instance of a registry category.
    Registry {
        path: Vec<String>,
        registry: Weak<TypeRegistry>,
    },
    /// A fixed row collection.
    Static(Vec<Row>),
}

impl RowSource {
    pub fn registry(path: &str, registry: &Rc<TypeRegistry>) -> Self {
        RowSource::Registry {
            path: path.split('/').map(str::to_string).collect(),
            registry: Rc::downgrade(registry),
        }
    }
}

/// An aggregate computed over the surviving rows after population.
pub enum Summary {
    Sum(String),
    Min(String),
    Max(String),
    Avg(String),
    Custom(Box<dyn Fn(&[ViewRow]) -> Value>),
}

impl Summary {
    fn compute(&self, rows: &[ViewRow]) -> Value {
        let column = |field: &str| -> Vec<Value> {
            rows.iter()
                .filter_map(|r| r.row.get(field))
                .filter(|v| !v.is_null())
                .cloned()
                .collect()
        };
        match self {
            Summary::Sum(field) => {
                let values = column(field);
                if values.iter().all(|v| matches!(v, Value::Int(_))) {
                    Value::Int(values.iter().filter_map(Value::as_i64).sum())
                } else {
                    Value::Float(values.iter().filter_map(Value::to_number).sum())
                }
            }
            Summary::Min(field) => column(field)
                .into_iter()
                .min_by(|a, b| a.compare(b))
                .unwrap_or_default(),
            Summary::Max(field) => column(field)
                .into_iter()
                .max_by(|a, b| a.compare(b))
                .unwrap_or_default(),
            Summary::Avg(field) => {
                let numbers: Vec<f64> = column(field).iter().filter_map(Value::to_number).collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Summary::Custom(compute) => compute(rows),
        }
    }
}

type RowHook = Box<dyn Fn(&mut Row) -> bool>;
type ViewHook = Box<dyn Fn(&View) -> bool>;

enum Rows {
    Unpopulated,
    Failed,
    Ready(Rc<[ViewRow]>),
}

pub struct View {
    handle: Option<Rc<DataHandle>>,
    filter: String,
    source: RowSource,
    rows: RefCell<Rows>,
    summaries: RefCell<Row>,
    definitions: RefCell<Vec<(String, Summary)>>,
    on_row: RefCell<Option<RowHook>>,
    on_view: RefCell<Option<ViewHook>>,
    cursor: RefCell<Cursor>,
    fetches: Cell<usize>,
}

impl View {
    /// A view selecting `filter` from `handle`.
    pub fn query(handle: Rc<DataHandle>, filter: &str) -> Self {
        Self::build(Some(handle), filter, RowSource::Query)
    }

    /// A view over an alternate source, optionally tied to a handle.
    pub fn with_source(handle: Option<Rc<DataHandle>>, source: RowSource) -> Self {
        Self::build(handle, "", source)
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::build(None, "", RowSource::Static(rows))
    }

    fn build(handle: Option<Rc<DataHandle>>, filter: &str, source: RowSource) -> Self {
        View {
            handle,
            filter: filter.to_string(),
            source,
            rows: RefCell::new(Rows::Unpopulated),
            summaries: RefCell::new(Row::new()),
            definitions: RefCell::new(Vec::new()),
            on_row: RefCell::new(None),
            on_view: RefCell::new(None),
            cursor: RefCell::new(Cursor::empty()),
            fetches: Cell::new(0),
        }
    }

    pub fn handle(&self) -> Option<&Rc<DataHandle>> {
        self.handle.as_ref()
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Install the per-row hook. Returning `false` drops the row.
    pub fn on_row(&self, hook: impl Fn(&mut Row) -> bool + 'static) {
        *self.on_row.borrow_mut() = Some(Box::new(hook));
    }

    /// Install the hook run once after population. Its result is the
    /// result of [`populate`](Self::populate).
    pub fn on_view(&self, hook: impl Fn(&View) -> bool + 'static) {
        *self.on_view.borrow_mut() = Some(Box::new(hook));
    }

    /// Register a summary computed on every population, after `COUNT`.
    pub fn add_summary(&self, name: &str, summary: Summary) {
        let mut definitions = self.definitions.borrow_mut();
        definitions.retain(|(existing, _)| existing != name);
        definitions.push((name.to_string(), summary));
    }

    /// Fill the view. Cached rows are reused unless `refresh` is set.
    ///
    /// Returns `Err` when the source fails (the view is then marked failed)
    /// and otherwise the view hook's verdict, `true` without a hook.
    pub fn populate(&self, refresh: bool) -> Result<bool> {
        if !refresh && matches!(*self.rows.borrow(), Rows::Ready(_)) {
            log::debug!("View '{}' served from cache", self.describe());
            self.cursor.borrow_mut().unset();
            return Ok(true);
        }

        self.fetches.set(self.fetches.get() + 1);
        let fetched = match self.fetch() {
            Ok(rows) => rows.unwrap_or_default(),
            Err(err) => {
                log::warn!("View '{}' failed to populate: {err}", self.describe());
                *self.rows.borrow_mut() = Rows::Failed;
                *self.summaries.borrow_mut() = Row::new();
                *self.cursor.borrow_mut() = Cursor::empty();
                return Err(err);
            }
        };

        let hook = self.on_row.borrow_mut().take();
        let key_field = self.key_field();
        let mut survivors = Vec::with_capacity(fetched.len());
        for (position, mut row) in fetched.into_iter().enumerate() {
            if let Some(hook) = &hook {
                if !hook(&mut row) {
                    continue;
                }
            }
            let key = key_field
                .as_deref()
                .and_then(|field| row.get(field))
                .filter(|v| !v.is_null())
                .map(Value::to_text)
                .unwrap_or_else(|| (position + 1).to_string());
            let ordinal = survivors.len() + 1;
            survivors.push(ViewRow {
                key,
                ordinal,
                parity: Parity::of(ordinal),
                row,
            });
        }
        self.restore(&self.on_row, hook);

        let mut summaries = Row::new();
        summaries.insert(COUNT, Value::Int(survivors.len() as i64));
        for (name, summary) in self.definitions.borrow().iter() {
            summaries.insert(name.as_str(), summary.compute(&survivors));
        }

        let snapshot: Rc<[ViewRow]> = survivors.into();
        *self.summaries.borrow_mut() = summaries;
        *self.cursor.borrow_mut() = Cursor::new(snapshot.clone());
        *self.rows.borrow_mut() = Rows::Ready(snapshot);

        let hook = self.on_view.borrow_mut().take();
        let verdict = hook.as_ref().map_or(true, |hook| hook(self));
        self.restore(&self.on_view, hook);
        self.cursor.borrow_mut().unset();
        Ok(verdict)
    }

    /// Put a hook back unless a new one was installed while it ran.
    fn restore<H>(&self, slot: &RefCell<Option<H>>, hook: Option<H>) {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = hook;
        }
    }

    fn key_field(&self) -> Option<String> {
        match &self.source {
            RowSource::Query => self.handle.as_ref().map(|h| h.primary_key().to_string()),
            RowSource::Fields => Some("name".to_string()),
            RowSource::Registry { .. } | RowSource::Static(_) => Some("id".to_string()),
        }
    }

    fn require_handle(&self) -> Result<&Rc<DataHandle>> {
        self.handle
            .as_ref()
            .ok_or_else(|| CmsError::Validation("view has no data handle".into()))
    }

    fn fetch(&self) -> Result<Option<Vec<Row>>> {
        match &self.source {
            RowSource::Query => self.require_handle()?.select(&self.filter),
            RowSource::Fields => {
                let fields = self.require_handle()?.fields(true)?;
                Ok(Some(
                    fields.iter().map(|(name, info)| field_row(name, info)).collect(),
                ))
            }
            RowSource::Registry { path, registry } => {
                let registry = registry
                    .upgrade()
                    .ok_or_else(|| CmsError::Registry("registry has been dropped".into()))?;
                let path: Vec<&str> = path.iter().map(String::as_str).collect();
                registry.describe(&path).map(Some)
            }
            RowSource::Static(rows) => Ok(Some(rows.clone())),
        }
    }

    fn describe(&self) -> String {
        match (&self.handle, &self.source) {
            (Some(handle), RowSource::Query) => format!("{}[{}]", handle.id(), self.filter),
            (Some(handle), _) => format!("{}[special]", handle.id()),
            (None, _) => "rows".to_string(),
        }
    }

    // --- results ---

    /// How many times the source has been queried.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }

    pub fn is_populated(&self) -> bool {
        matches!(*self.rows.borrow(), Rows::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.rows.borrow(), Rows::Failed)
    }

    /// The surviving rows in ordinal order. Empty unless populated.
    pub fn rows(&self) -> Rc<[ViewRow]> {
        match &*self.rows.borrow() {
            Rows::Ready(rows) => rows.clone(),
            _ => Rc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<ViewRow> {
        self.rows().iter().find(|r| r.key == key).cloned()
    }

    pub fn summary(&self, name: &str) -> Option<Value> {
        self.summaries.borrow().get(name).cloned()
    }

    pub fn summaries(&self) -> Row {
        self.summaries.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.summary(COUNT).and_then(|v| v.as_i64()).unwrap_or(0) as usize
    }

    // --- cursor ---

    /// An independent cursor over the current snapshot.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.rows())
    }

    pub fn current(&self) -> Option<ViewRow> {
        self.cursor.borrow().current().cloned()
    }

    pub fn reset(&self) -> Option<ViewRow> {
        self.cursor.borrow_mut().reset().cloned()
    }

    pub fn end(&self) -> Option<ViewRow> {
        self.cursor.borrow_mut().end().cloned()
    }

    pub fn next(&self, rewind: bool) -> Option<ViewRow> {
        self.cursor.borrow_mut().next(rewind).cloned()
    }

    pub fn previous(&self, rewind: bool) -> Option<ViewRow> {
        self.cursor.borrow_mut().previous(rewind).cloned()
    }

    pub fn unset(&self) {
        self.cursor.borrow_mut().unset();
    }
}

/// Row shape of the field-metadata source.
fn field_row(name: &str, info: &FieldInfo) -> Row {
    let mut row = Row::new();
    row.insert("name", Value::from(name));
    row.insert("type", Value::from(info.field_type.as_str()));
    row.insert("subtype", Value::from(info.subtype.clone()));
    row.insert("length", Value::from(info.length.map(i64::from)));
    row.insert("nullable", Value::Bool(info.nullable));
    row.insert(
        "choices",
        Value::from(info.choices.as_ref().map(|c| c.join("|"))),
    );
    row.insert("info", Value::from(info.info.clone()));
    for (key, value) in &info.extra {
        if !row.contains_key(key) {
            row.insert(key.as_str(), Value::from(value.as_str()));
        }
    }
    row
}
