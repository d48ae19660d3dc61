use crate::config::{default_primary_key, parse_config, CoreConfig, EngineKind};
use crate::data::{DataHandle, HandleOptions};
use crate::engine::{DataEngine, MemoryEngine, SqliteEngine};
use crate::error::{CmsError, Result};
use crate::registry::{Category, Instance, StaticLoader, TypeRegistry};
use crate::stack::ViewStack;
use crate::value::{Row, Value};
use crate::view::{RowSource, View};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

const ENGINE: &[&str] = &["engine"];
const DATA: &[&str] = &["data"];
const VIEW: &[&str] = &["view"];
const SPECIAL: &[&str] = &["view", "special"];

/// State the category factories share with the context.
struct Shared {
    config: CoreConfig,
    base_dir: PathBuf,
    engines: RefCell<HashMap<String, Rc<dyn DataEngine>>>,
}

/// Registry instance wrapping an engine trait object.
struct EngineSlot(Rc<dyn DataEngine>);

/// The entry point: owns the configuration, the engines and the registry
/// every data handle and view is constructed and cached in.
pub struct Context {
    shared: Rc<Shared>,
    registry: Rc<TypeRegistry>,
}

impl Context {
    /// Open a context from a YAML config file. Relative database paths
    /// resolve against the file's directory.
    pub fn open(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(CmsError::Config(format!(
                "Config file does not exist: {}",
                config_path.display()
            )));
        }
        let config = parse_config(config_path)?;
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(config, base_dir)
    }

    pub fn new(config: CoreConfig, base_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let shared = Rc::new(Shared {
            config,
            base_dir: base_dir.into(),
            engines: RefCell::new(HashMap::new()),
        });
        let registry = Rc::new_cyclic(|weak: &Weak<TypeRegistry>| {
            TypeRegistry::new(loader(shared.clone(), weak.clone()))
        });
        Ok(Context { shared, registry })
    }

    /// Provide a ready-made engine under `name` instead of building it from
    /// the config. Must happen before the engine is first used, and the
    /// engine must report the same name.
    pub fn register_engine(&self, name: &str, engine: Rc<dyn DataEngine>) -> Result<()> {
        if engine.name() != name {
            return Err(CmsError::Config(format!(
                "Engine registered as '{name}' reports itself as '{}'",
                engine.name()
            )));
        }
        if self.registry.get(ENGINE, name).is_some() {
            return Err(CmsError::Config(format!("Engine '{name}' is already in use")));
        }
        self.shared
            .engines
            .borrow_mut()
            .insert(name.to_string(), engine);
        Ok(())
    }

    pub fn engine(&self, name: &str) -> Result<Rc<dyn DataEngine>> {
        Ok(self.registry.resolve_as::<EngineSlot>(ENGINE, &[name])?.0.clone())
    }

    /// The handle for `path` on `engine`, optionally projected to a named
    /// fieldset. Handles are constructed once and shared.
    pub fn data(&self, path: &str, engine: &str, fieldset: Option<&str>) -> Result<Rc<DataHandle>> {
        match fieldset {
            Some(fieldset) => self.registry.resolve_as(DATA, &[path, engine, fieldset]),
            None => self.registry.resolve_as(DATA, &[path, engine]),
        }
    }

    /// The handle of a configured dataset.
    pub fn dataset(&self, name: &str) -> Result<Rc<DataHandle>> {
        let definition = self
            .shared
            .config
            .datasets
            .get(name)
            .ok_or_else(|| CmsError::Config(format!("Unknown dataset '{name}'")))?;
        self.data(&definition.path, &definition.engine, None)
    }

    /// The view of `handle` for `filter`. The handle must come from this
    /// context.
    pub fn view(&self, handle: &DataHandle, filter: &str) -> Result<Rc<View>> {
        self.registry.resolve_as(VIEW, &[handle.id(), filter])
    }

    /// A view over a named alternate source: `fields`, `registry:<path>`
    /// or a configured rowset.
    pub fn special_view(&self, handle: Option<&DataHandle>, name: &str) -> Result<Rc<View>> {
        let handle_id = handle.map_or("", DataHandle::id);
        self.registry.resolve_as(SPECIAL, &[handle_id, name])
    }

    pub fn stack(&self, handle: Option<Rc<DataHandle>>) -> ViewStack<'_> {
        ViewStack::new(self, handle)
    }

    pub fn registry(&self) -> &Rc<TypeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }
}

fn loader(shared: Rc<Shared>, registry: Weak<TypeRegistry>) -> StaticLoader {
    let engines = shared.clone();
    let data = shared.clone();
    let special = shared;
    StaticLoader::new()
        .with(ENGINE, move || Some(engine_category(engines.clone())))
        .with(DATA, move || Some(data_category(data.clone())))
        .with(VIEW, || Some(view_category()))
        .with(SPECIAL, move || {
            Some(special_category(special.clone(), registry.clone()))
        })
}

fn engine_category(shared: Rc<Shared>) -> Category {
    Category::new(move |_, id, _| {
        let engine = build_engine(&shared, id)?;
        let instance: Instance = Rc::new(EngineSlot(engine));
        Ok(instance)
    })
    .with_describe(|instance| {
        let mut row = Row::new();
        if let Some(slot) = instance.downcast_ref::<EngineSlot>() {
            row.insert("name", Value::from(slot.0.name()));
        }
        row
    })
}

fn build_engine(shared: &Shared, name: &str) -> Result<Rc<dyn DataEngine>> {
    if let Some(engine) = shared.engines.borrow().get(name) {
        return Ok(engine.clone());
    }
    let definition = shared
        .config
        .engines
        .get(name)
        .ok_or_else(|| CmsError::Config(format!("Unknown engine '{name}'")))?;
    let engine: Rc<dyn DataEngine> = match definition.kind {
        EngineKind::Memory => Rc::new(MemoryEngine::named(name)),
        EngineKind::Sqlite => {
            let path = definition.path.as_deref().ok_or_else(|| {
                CmsError::Config(format!("Engine '{name}' is sqlite but has no path"))
            })?;
            let path = shared.base_dir.join(path);
            log::debug!("Opening sqlite engine '{name}' at {}", path.display());
            Rc::new(SqliteEngine::open(&path)?.with_name(name))
        }
    };
    Ok(engine)
}

fn data_category(shared: Rc<Shared>) -> Category {
    Category::new(move |registry, id, args| {
        let (path, engine_name) = match args {
            [path, engine, ..] => (*path, *engine),
            _ => {
                return Err(CmsError::Registry(
                    "a data handle needs a path and an engine".into(),
                ))
            }
        };
        let engine = registry.resolve_as::<EngineSlot>(ENGINE, &[engine_name])?.0.clone();
        let config = &shared.config;
        let definition = config.dataset_for(path, engine_name);

        let fieldset_name = args
            .get(2)
            .copied()
            .filter(|name| !name.is_empty())
            .or_else(|| definition.and_then(|d| d.fieldset.as_deref()));
        let fieldset = match fieldset_name {
            Some(name) => Some(config.fieldsets.get(name).cloned().ok_or_else(|| {
                CmsError::Config(format!("Unknown fieldset '{name}'"))
            })?),
            None => None,
        };

        let options = HandleOptions {
            primary_key: definition.map_or_else(default_primary_key, |d| d.primary_key.clone()),
            fieldset,
            join: definition.and_then(|d| d.join.clone()),
        };
        let instance: Instance = Rc::new(DataHandle::new(path, engine, options).with_id(id));
        Ok(instance)
    })
    .with_hook(|registry, instance| {
        // Resolving the join target may come back to this handle.
        if let Some(handle) = instance.downcast_ref::<DataHandle>() {
            if let Some(join) = handle.join() {
                registry.resolve(DATA, &[join.path.as_str(), handle.engine().name()])?;
            }
        }
        Ok(())
    })
    .with_describe(|instance| {
        let mut row = Row::new();
        if let Some(handle) = instance.downcast_ref::<DataHandle>() {
            row.insert("path", Value::from(handle.path()));
            row.insert("engine", Value::from(handle.engine().name()));
            row.insert("primary_key", Value::from(handle.primary_key()));
            row.insert("fieldset", Value::from(handle.columns().map(|c| c.join(","))));
            row.insert("join", Value::from(handle.join().map(|j| j.path.clone())));
        }
        row
    })
}

fn view_id(args: &[&str]) -> String {
    match args {
        [owner, rest @ ..] => format!("{owner}[{}]", rest.join("")),
        [] => String::new(),
    }
}

fn lookup_handle(registry: &TypeRegistry, id: &str) -> Result<Rc<DataHandle>> {
    registry
        .get(DATA, id)
        .and_then(|instance| instance.downcast::<DataHandle>().ok())
        .ok_or_else(|| CmsError::Registry(format!("No data handle '{id}' in this context")))
}

fn describe_view(instance: &Instance) -> Row {
    let mut row = Row::new();
    if let Some(view) = instance.downcast_ref::<View>() {
        row.insert("handle", Value::from(view.handle().map(|h| h.id().to_string())));
        row.insert("filter", Value::from(view.filter()));
        row.insert("populated", Value::Bool(view.is_populated()));
        row.insert("count", Value::Int(view.count() as i64));
    }
    row
}

fn view_category() -> Category {
    Category::new(|registry, _, args| {
        let [handle_id, filter] = args else {
            return Err(CmsError::Registry("a view needs a data handle and a filter".into()));
        };
        let handle = lookup_handle(registry, handle_id)?;
        let instance: Instance = Rc::new(View::query(handle, filter));
        Ok(instance)
    })
    .with_id(view_id)
    .with_describe(describe_view)
}

fn special_category(shared: Rc<Shared>, weak: Weak<TypeRegistry>) -> Category {
    Category::new(move |registry, _, args| {
        let [handle_id, name] = args else {
            return Err(CmsError::Registry("a special view needs a source name".into()));
        };
        let handle = if handle_id.is_empty() {
            None
        } else {
            Some(lookup_handle(registry, handle_id)?)
        };

        let source = if *name == "fields" {
            if handle.is_none() {
                return Err(CmsError::Validation(
                    "the fields view needs a data handle".into(),
                ));
            }
            RowSource::Fields
        } else if let Some(path) = name.strip_prefix("registry:") {
            RowSource::Registry {
                path: path.split('/').map(str::to_string).collect(),
                registry: weak.clone(),
            }
        } else if let Some(rows) = shared.config.rowsets.get(*name) {
            RowSource::Static(rows.clone())
        } else {
            return Err(CmsError::Config(format!("Unknown special view '{name}'")));
        };

        let instance: Instance = Rc::new(View::with_source(handle, source));
        Ok(instance)
    })
    .with_id(view_id)
    .with_describe(describe_view)
}
