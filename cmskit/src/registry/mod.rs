//! Lazy, memoizing instance factory keyed by a category path and an id.
//!
//! Categories are loaded on first use through a [`CategoryLoader`]. A
//! category that fails to load is remembered as failed and never retried.
//! Each loaded category holds the instances it has constructed, keyed by the
//! id its id builder derives from the construction arguments.

use crate::error::{CmsError, Result};
use crate::value::{Row, Value};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A constructed registry instance
pub type Instance = Rc<dyn Any>;

type Factory = Box<dyn Fn(&TypeRegistry, &str, &[&str]) -> Result<Instance>>;
type IdBuilder = Box<dyn Fn(&[&str]) -> String>;
type Hook = Box<dyn Fn(&TypeRegistry, &Instance) -> Result<()>>;
type Describe = Box<dyn Fn(&Instance) -> Row>;

/// How the instances of one category are built and identified
pub struct Category {
    factory: Option<Factory>,
    build_id: Option<IdBuilder>,
    on_construct: Option<Hook>,
    describe: Option<Describe>,
}

impl Category {
    /// A category constructing instances with `factory(registry, id, args)`.
    pub fn new(
        factory: impl Fn(&TypeRegistry, &str, &[&str]) -> Result<Instance> + 'static,
    ) -> Self {
        Category {
            factory: Some(Box::new(factory)),
            build_id: None,
            on_construct: None,
            describe: None,
        }
    }

    /// A pure namespace node. It can hold sub-categories but not instances.
    pub fn namespace() -> Self {
        Category {
            factory: None,
            build_id: None,
            on_construct: None,
            describe: None,
        }
    }

    pub fn with_id(mut self, build_id: impl Fn(&[&str]) -> String + 'static) -> Self {
        self.build_id = Some(Box::new(build_id));
        self
    }

    /// Hook run after the instance is registered.
    pub fn with_hook(
        mut self,
        hook: impl Fn(&TypeRegistry, &Instance) -> Result<()> + 'static,
    ) -> Self {
        self.on_construct = Some(Box::new(hook));
        self
    }

    pub fn with_describe(mut self, describe: impl Fn(&Instance) -> Row + 'static) -> Self {
        self.describe = Some(Box::new(describe));
        self
    }

    pub fn is_namespace(&self) -> bool {
        self.factory.is_none()
    }

    pub fn build_id(&self, args: &[&str]) -> String {
        match &self.build_id {
            Some(build) => build(args),
            None => default_id(args),
        }
    }
}

/// Identity id: a single argument is its own id, several are joined by `:`.
pub fn default_id(args: &[&str]) -> String {
    args.join(":")
}

/// Source of category definitions, consulted once per category path.
pub trait CategoryLoader {
    /// Load the category at `path`, or `None` when it does not exist.
    fn load(&self, path: &[&str]) -> Option<Category>;
}

type CategoryMaker = Box<dyn Fn() -> Option<Category>>;

/// A static dispatch table from category paths to category makers.
///
/// Registering `a/b` makes `a` loadable as a namespace.
#[derive(Default)]
pub struct StaticLoader {
    table: HashMap<String, CategoryMaker>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: &[&str],
        make: impl Fn() -> Option<Category> + 'static,
    ) -> &mut Self {
        self.table.insert(path.join("/"), Box::new(make));
        self
    }

    pub fn with(mut self, path: &[&str], make: impl Fn() -> Option<Category> + 'static) -> Self {
        self.register(path, make);
        self
    }
}

impl CategoryLoader for StaticLoader {
    fn load(&self, path: &[&str]) -> Option<Category> {
        let key = path.join("/");
        if let Some(make) = self.table.get(&key) {
            return make();
        }
        let prefix = format!("{key}/");
        if self.table.keys().any(|k| k.starts_with(&prefix)) {
            Some(Category::namespace())
        } else {
            None
        }
    }
}

struct Node {
    category: Rc<Category>,
    instances: HashMap<String, Instance>,
    order: Vec<String>,
}

enum Slot {
    Loaded(Node),
    Failed,
}

/// The instance registry. Never borrowed across factory or hook calls, so
/// both may resolve further instances.
pub struct TypeRegistry {
    loader: Box<dyn CategoryLoader>,
    slots: RefCell<HashMap<String, Slot>>,
}

impl TypeRegistry {
    pub fn new(loader: impl CategoryLoader + 'static) -> Self {
        TypeRegistry {
            loader: Box::new(loader),
            slots: RefCell::new(HashMap::new()),
        }
    }

    /// Ensure every node along `path` is loaded.
    pub fn load(&self, path: &[&str]) -> Result<()> {
        self.category(path).map(|_| ())
    }

    /// Whether `path` was tried and is permanently unavailable.
    pub fn is_failed(&self, path: &[&str]) -> bool {
        matches!(self.slots.borrow().get(&path.join("/")), Some(Slot::Failed))
    }

    fn category(&self, path: &[&str]) -> Result<Rc<Category>> {
        if path.is_empty() {
            return Err(CmsError::Registry("empty category path".into()));
        }
        for depth in 1..path.len() {
            self.load_node(&path[..depth])?;
        }
        self.load_node(path)
    }

    fn load_node(&self, path: &[&str]) -> Result<Rc<Category>> {
        let key = path.join("/");
        if let Some(slot) = self.slots.borrow().get(&key) {
            return match slot {
                Slot::Loaded(node) => Ok(node.category.clone()),
                Slot::Failed => Err(CmsError::CategoryUnavailable(key)),
            };
        }

        let loaded = self.loader.load(path);
        let mut slots = self.slots.borrow_mut();
        match loaded {
            Some(category) => {
                log::debug!("Loaded category '{key}'");
                let category = Rc::new(category);
                slots.insert(
                    key,
                    Slot::Loaded(Node {
                        category: category.clone(),
                        instances: HashMap::new(),
                        order: Vec::new(),
                    }),
                );
                Ok(category)
            }
            None => {
                log::warn!("Category '{key}' could not be loaded");
                slots.insert(key.clone(), Slot::Failed);
                Err(CmsError::CategoryUnavailable(key))
            }
        }
    }

    /// Look up an already constructed instance without constructing one.
    pub fn get(&self, path: &[&str], id: &str) -> Option<Instance> {
        match self.slots.borrow().get(&path.join("/")) {
            Some(Slot::Loaded(node)) => node.instances.get(id).cloned(),
            _ => None,
        }
    }

    /// Resolve the instance of `path` identified by `args`, constructing and
    /// registering it on first request.
    ///
    /// If the category's construction hook fails, the instance is dropped
    /// from the registry again and the next resolve constructs a new one.
    pub fn resolve(&self, path: &[&str], args: &[&str]) -> Result<Instance> {
        let category = self.category(path)?;
        let factory = category.factory.as_ref().ok_or_else(|| {
            CmsError::Registry(format!(
                "category '{}' is a namespace and cannot construct instances",
                path.join("/")
            ))
        })?;
        let id = category.build_id(args);

        if let Some(existing) = self.get(path, &id) {
            return Ok(existing);
        }

        let instance = factory(self, &id, args)?;
        let instance = self.register(path, &id, instance);
        log::debug!("Constructed {}[{id}]", path.join("/"));

        // Registered first: a hook that resolves this id again gets this instance.
        if let Some(hook) = &category.on_construct {
            if let Err(err) = hook(self, &instance) {
                log::warn!("Hook for {}[{id}] failed: {err}", path.join("/"));
                self.unregister(path, &id, &instance);
                return Err(err);
            }
        }
        Ok(instance)
    }

    /// Like [`resolve`](Self::resolve), downcast to a concrete type.
    pub fn resolve_as<T: Any>(&self, path: &[&str], args: &[&str]) -> Result<Rc<T>> {
        self.resolve(path, args)?.downcast::<T>().map_err(|_| {
            CmsError::Registry(format!(
                "instance of '{}' is not a {}",
                path.join("/"),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Keep the first registration if the factory already registered `id`.
    fn register(&self, path: &[&str], id: &str, instance: Instance) -> Instance {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(&path.join("/")) {
            Some(Slot::Loaded(node)) => {
                if let Some(existing) = node.instances.get(id) {
                    return existing.clone();
                }
                node.instances.insert(id.to_string(), instance.clone());
                node.order.push(id.to_string());
                instance
            }
            _ => instance,
        }
    }

    fn unregister(&self, path: &[&str], id: &str, instance: &Instance) {
        let mut slots = self.slots.borrow_mut();
        if let Some(Slot::Loaded(node)) = slots.get_mut(&path.join("/")) {
            if node.instances.get(id).is_some_and(|i| Rc::ptr_eq(i, instance)) {
                node.instances.remove(id);
                node.order.retain(|o| o != id);
            }
        }
    }

    /// Live instances of a category, in construction order.
    pub fn instances(&self, path: &[&str]) -> Result<Vec<(String, Instance)>> {
        self.category(path)?;
        let slots = self.slots.borrow();
        Ok(match slots.get(&path.join("/")) {
            Some(Slot::Loaded(node)) => node
                .order
                .iter()
                .filter_map(|id| node.instances.get(id).map(|i| (id.clone(), i.clone())))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// One row per live instance: `id`, `category`, then whatever the
    /// category's describe function reports.
    pub fn describe(&self, path: &[&str]) -> Result<Vec<Row>> {
        let category = self.category(path)?;
        let key = path.join("/");
        let rows = self
            .instances(path)?
            .into_iter()
            .map(|(id, instance)| {
                let mut row = Row::new();
                row.insert("id", Value::Text(id));
                row.insert("category", Value::Text(key.clone()));
                if let Some(describe) = &category.describe {
                    for (name, value) in describe(&instance) {
                        if !row.contains_key(&name) {
                            row.insert(name, value);
                        }
                    }
                }
                row
            })
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Widget {
        id: String,
        args: Vec<String>,
    }

    fn widget_category() -> Category {
        Category::new(|_, id, args| {
            Ok(Rc::new(Widget {
                id: id.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            }) as Instance)
        })
    }

    fn registry_with(loads: Rc<Cell<usize>>) -> TypeRegistry {
        let loader = StaticLoader::new()
            .with(&["ui", "widget"], move || {
                loads.set(loads.get() + 1);
                Some(widget_category())
            })
            .with(&["broken"], || None);
        TypeRegistry::new(loader)
    }

    #[test]
    fn test_resolve_memoizes_instances() {
        let registry = registry_with(Rc::new(Cell::new(0)));
        let a = registry.resolve_as::<Widget>(&["ui", "widget"], &["menu", "top"]).unwrap();
        let b = registry.resolve_as::<Widget>(&["ui", "widget"], &["menu", "top"]).unwrap();
        let c = registry.resolve_as::<Widget>(&["ui", "widget"], &["menu", "side"]).unwrap();

        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(a.id, "menu:top");
        assert_eq!(a.args, vec!["menu".to_string(), "top".to_string()]);
    }

    #[test]
    fn test_category_loaded_once() {
        let loads = Rc::new(Cell::new(0));
        let registry = registry_with(loads.clone());
        registry.resolve(&["ui", "widget"], &["a"]).unwrap();
        registry.resolve(&["ui", "widget"], &["b"]).unwrap();
        registry.load(&["ui", "widget"]).unwrap();
        assert_eq!(loads.get(), 1);
    }

    #[test]
    fn test_intermediate_node_is_namespace() {
        let registry = registry_with(Rc::new(Cell::new(0)));
        registry.load(&["ui"]).unwrap();
        let result = registry.resolve(&["ui"], &["x"]);
        assert!(matches!(result, Err(CmsError::Registry(_))));
    }

    #[test]
    fn test_failed_category_is_permanent() {
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let loader = StaticLoader::new().with(&["flaky"], move || {
            counter.set(counter.get() + 1);
            None
        });
        let registry = TypeRegistry::new(loader);

        assert!(matches!(
            registry.resolve(&["flaky"], &["x"]),
            Err(CmsError::CategoryUnavailable(_))
        ));
        assert!(registry.resolve(&["flaky"], &["x"]).is_err());
        assert!(registry.is_failed(&["flaky"]));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_unknown_parent_fails_whole_path() {
        let registry = registry_with(Rc::new(Cell::new(0)));
        assert!(registry.resolve(&["nope", "widget"], &["x"]).is_err());
        assert!(registry.is_failed(&["nope"]));
        assert!(!registry.is_failed(&["broken"]));
        assert!(registry.load(&["broken"]).is_err());
        assert!(registry.is_failed(&["broken"]));
    }

    #[test]
    fn test_custom_id_builder() {
        let loader = StaticLoader::new().with(&["page"], || {
            Some(widget_category().with_id(|args| args[0].to_ascii_lowercase()))
        });
        let registry = TypeRegistry::new(loader);
        let a = registry.resolve(&["page"], &["Home", "v1"]).unwrap();
        let b = registry.resolve(&["page"], &["HOME", "v2"]).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(registry.get(&["page"], "home").is_some());
    }

    #[test]
    fn test_hook_sees_registered_instance() {
        let hook_runs = Rc::new(Cell::new(0));
        let runs = hook_runs.clone();
        let loader = StaticLoader::new().with(&["node"], move || {
            let runs = runs.clone();
            Some(widget_category().with_hook(move |registry, instance| {
                runs.set(runs.get() + 1);
                // Re-entrant resolve of the same id must not construct again.
                let again = registry.resolve(&["node"], &["self"])?;
                assert!(Rc::ptr_eq(&again, instance));
                Ok(())
            }))
        });
        let registry = TypeRegistry::new(loader);
        registry.resolve(&["node"], &["self"]).unwrap();
        assert_eq!(hook_runs.get(), 1);
    }

    #[test]
    fn test_failed_hook_drops_instance() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let loader = StaticLoader::new().with(&["node"], move || {
            let counter = counter.clone();
            Some(widget_category().with_hook(move |_, _| {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    Err(CmsError::Validation("not ready".into()))
                } else {
                    Ok(())
                }
            }))
        });
        let registry = TypeRegistry::new(loader);

        assert!(matches!(
            registry.resolve(&["node"], &["a"]),
            Err(CmsError::Validation(_))
        ));
        assert!(registry.get(&["node"], "a").is_none());
        assert!(registry.instances(&["node"]).unwrap().is_empty());

        registry.resolve(&["node"], &["a"]).unwrap();
        assert_eq!(runs.get(), 2);
        assert!(registry.get(&["node"], "a").is_some());
    }

    #[test]
    fn test_resolve_as_wrong_type() {
        let registry = registry_with(Rc::new(Cell::new(0)));
        let result = registry.resolve_as::<String>(&["ui", "widget"], &["a"]);
        assert!(matches!(result, Err(CmsError::Registry(_))));
    }

    #[test]
    fn test_describe_lists_instances_in_order() {
        let loader = StaticLoader::new().with(&["tag"], || {
            Some(widget_category().with_describe(|instance| {
                let widget = instance.downcast_ref::<Widget>().map(|w| w.args.len());
                [("arity", Value::from(widget.map(|n| n as i64)))].into_iter().collect()
            }))
        });
        let registry = TypeRegistry::new(loader);
        registry.resolve(&["tag"], &["b"]).unwrap();
        registry.resolve(&["tag"], &["a", "x"]).unwrap();

        let rows = registry.describe(&["tag"]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&Value::from("b")));
        assert_eq!(rows[1].get("id"), Some(&Value::from("a:x")));
        assert_eq!(rows[1].get("category"), Some(&Value::from("tag")));
        assert_eq!(rows[1].get("arity"), Some(&Value::Int(2)));
    }
}
