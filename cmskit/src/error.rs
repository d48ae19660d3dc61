use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmsError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Engine '{engine}' does not implement {operation}")]
    NotImplemented { engine: String, operation: String },

    #[error("Unbalanced view stack: {0}")]
    UnbalancedStack(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Category not available: {0}")]
    CategoryUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Row not found: {dataset}/{id}")]
    NotFound { dataset: String, id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, CmsError>;
