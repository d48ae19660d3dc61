use crate::context::Context;
use crate::data::DataHandle;
use crate::error::{CmsError, Result};
use crate::view::View;
use std::rc::Rc;

/// Nested active views of one consumer. The most recently started view is
/// the current one.
pub struct ViewStack<'c> {
    context: &'c Context,
    handle: Option<Rc<DataHandle>>,
    views: Vec<Rc<View>>,
}

impl<'c> ViewStack<'c> {
    pub fn new(context: &'c Context, handle: Option<Rc<DataHandle>>) -> Self {
        ViewStack {
            context,
            handle,
            views: Vec::new(),
        }
    }

    /// Populate the cached view for `filter` and make it current.
    pub fn start(&mut self, filter: &str) -> Result<Rc<View>> {
        self.start_with(filter, |_| {})
    }

    /// Like [`start`](Self::start), letting `configure` install hooks or
    /// summaries before the view is populated.
    pub fn start_with(&mut self, filter: &str, configure: impl FnOnce(&View)) -> Result<Rc<View>> {
        let handle = self.handle.as_ref().ok_or_else(|| {
            CmsError::Validation("this view stack has no data handle to query".into())
        })?;
        let view = self.context.view(handle, filter)?;
        configure(&view);
        self.push(view)
    }

    /// Start a view over a named alternate source.
    pub fn start_special(&mut self, name: &str) -> Result<Rc<View>> {
        let view = self.context.special_view(self.handle.as_deref(), name)?;
        self.push(view)
    }

    fn push(&mut self, view: Rc<View>) -> Result<Rc<View>> {
        if !view.populate(false)? {
            return Err(CmsError::Validation(
                "view was rejected by its view hook".into(),
            ));
        }
        self.views.push(view.clone());
        Ok(view)
    }

    /// Drop the current view and return the one below it, if any.
    pub fn end(&mut self) -> Result<Option<Rc<View>>> {
        if self.views.pop().is_none() {
            let err = CmsError::UnbalancedStack("end() without a matching start()".into());
            log::warn!("{err}");
            return Err(err);
        }
        Ok(self.current())
    }

    pub fn current(&self) -> Option<Rc<View>> {
        self.views.last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.views.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;
    use crate::engine::{field_map, MemoryEngine};
    use crate::schema::{FieldInfo, FieldType};
    use crate::value::Value;

    const CONFIG: &str = r#"
engines:
  mem: { kind: memory }
datasets:
  items: { engine: mem, path: items }
rowsets:
  colours:
    - { id: red }
    - { id: blue }
"#;

    fn context() -> (Context, Rc<DataHandle>) {
        let context = Context::new(parse_config_str(CONFIG).unwrap(), ".").unwrap();
        let engine = Rc::new(MemoryEngine::named("mem"));
        engine.create_table(
            "items",
            field_map([
                ("id", FieldInfo::new(FieldType::Integer)),
                ("v", FieldInfo::new(FieldType::Integer)),
            ]),
        );
        engine
            .seed(
                "items",
                [(1, 10), (2, 20), (3, 30)]
                    .into_iter()
                    .map(|(id, v)| [("id", Value::Int(id)), ("v", Value::Int(v))].into_iter().collect())
                    .collect(),
            )
            .unwrap();
        context.register_engine("mem", engine).unwrap();
        let items = context.dataset("items").unwrap();
        (context, items)
    }

    #[test]
    fn test_nesting_tracks_current() {
        let (context, items) = context();
        let mut stack = context.stack(Some(items.clone()));
        assert!(stack.current().is_none());

        let outer = stack.start("").unwrap();
        let inner = stack.start(&items.filter_with("v", ">", 15)).unwrap();
        assert_eq!(stack.depth(), 2);
        assert!(Rc::ptr_eq(&stack.current().unwrap(), &inner));
        assert_eq!(inner.count(), 2);

        let back = stack.end().unwrap().unwrap();
        assert!(Rc::ptr_eq(&back, &outer));
        assert!(stack.end().unwrap().is_none());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_unbalanced_end_is_reported() {
        let (context, items) = context();
        let mut stack = context.stack(Some(items));
        assert!(matches!(stack.end(), Err(CmsError::UnbalancedStack(_))));
        assert_eq!(stack.depth(), 0);

        stack.start("").unwrap();
        stack.end().unwrap();
        assert!(stack.end().is_err());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_failed_start_pushes_nothing() {
        let (context, items) = context();
        let mut stack = context.stack(Some(items));
        let outer = stack.start("").unwrap();

        assert!(stack.start("`v` ~ 3").is_err());
        assert_eq!(stack.depth(), 1);
        assert!(Rc::ptr_eq(&stack.current().unwrap(), &outer));

        let rejected = stack.start_with("`v` = 10", |view| view.on_view(|_| false));
        assert!(rejected.is_err());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_start_with_configures_before_populate() {
        let (context, items) = context();
        let mut stack = context.stack(Some(items));
        let view = stack
            .start_with("", |view| view.on_row(|row| row.get("v") != Some(&Value::Int(20))))
            .unwrap();
        let keys: Vec<String> = view.rows().iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["1".to_string(), "3".to_string()]);
        assert_eq!(view.get("3").unwrap().ordinal, 2);
    }

    #[test]
    fn test_start_reuses_cached_view() {
        let (context, items) = context();
        let mut stack = context.stack(Some(items));
        let first = stack.start("").unwrap();
        stack.end().unwrap();
        let second = stack.start("").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(second.fetch_count(), 1);
    }

    #[test]
    fn test_special_without_handle() {
        let (context, _items) = context();
        let mut stack = context.stack(None);
        let colours = stack.start_special("colours").unwrap();
        assert_eq!(colours.count(), 2);
        assert!(matches!(stack.start(""), Err(CmsError::Validation(_))));
        assert_eq!(stack.depth(), 1);
    }
}
