pub mod config;
pub mod context;
pub mod data;
pub mod engine;
pub mod error;
pub mod registry;
pub mod schema;
pub mod stack;
pub mod value;
pub mod view;

pub use config::CoreConfig;
pub use context::Context;
pub use data::{DataHandle, HandleOptions};
pub use engine::{DataEngine, MemoryEngine, SqliteEngine};
pub use error::{CmsError, Result};
pub use registry::TypeRegistry;
pub use stack::ViewStack;
pub use value::{Row, Value};
pub use view::{Cursor, Summary, View, ViewRow};
