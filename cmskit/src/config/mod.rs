use crate::error::{CmsError, Result};
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration parsed from a YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub engines: HashMap<String, EngineDefinition>,
    #[serde(default)]
    pub datasets: HashMap<String, DatasetDefinition>,
    /// Named projections: fieldset name to the field ids it exposes
    #[serde(default)]
    pub fieldsets: HashMap<String, Vec<String>>,
    /// Static row collections replayed by special views
    #[serde(default)]
    pub rowsets: HashMap<String, Vec<Row>>,
}

/// A configured data engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefinition {
    pub kind: EngineKind,
    /// Database file for file-backed engines, relative to the config file
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Memory,
    Sqlite,
}

/// A named dataset: where it lives and how it is keyed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub engine: String,
    pub path: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub fieldset: Option<String>,
    #[serde(default)]
    pub join: Option<JoinSpec>,
}

/// Left join of another dataset on `local = foreign`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub path: String,
    pub local: String,
    pub foreign: String,
    /// Joined fields to expose; empty means every non-conflicting field
    #[serde(default)]
    pub fields: Vec<String>,
}

pub fn default_primary_key() -> String {
    "id".to_string()
}

impl CoreConfig {
    /// Find the dataset definition bound to a path on an engine.
    pub fn dataset_for(&self, path: &str, engine: &str) -> Option<&DatasetDefinition> {
        self.datasets
            .values()
            .find(|d| d.path == path && d.engine == engine)
    }

    /// Check cross references between datasets, engines and fieldsets.
    ///
    /// A path may be bound to at most one dataset per engine.
    pub fn validate(&self) -> Result<()> {
        let mut bound: HashMap<(&str, &str), &str> = HashMap::new();
        for (name, dataset) in &self.datasets {
            if let Some(other) = bound.insert((dataset.path.as_str(), dataset.engine.as_str()), name) {
                return Err(CmsError::Config(format!(
                    "Datasets '{other}' and '{name}' both bind path '{}' on engine '{}'",
                    dataset.path, dataset.engine
                )));
            }
            if !self.engines.contains_key(&dataset.engine) {
                return Err(CmsError::Config(format!(
                    "Dataset '{name}' uses unknown engine '{}'",
                    dataset.engine
                )));
            }
            if let Some(fieldset) = &dataset.fieldset {
                if !self.fieldsets.contains_key(fieldset) {
                    return Err(CmsError::Config(format!(
                        "Dataset '{name}' uses unknown fieldset '{fieldset}'"
                    )));
                }
            }
        }
        for (name, engine) in &self.engines {
            if engine.kind == EngineKind::Sqlite && engine.path.is_none() {
                return Err(CmsError::Config(format!(
                    "Engine '{name}' is sqlite but has no path"
                )));
            }
        }
        Ok(())
    }
}

/// Parse a config file into a CoreConfig
pub fn parse_config(path: &Path) -> Result<CoreConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a config YAML string into a CoreConfig
pub fn parse_config_str(content: &str) -> Result<CoreConfig> {
    let config: CoreConfig = serde_yaml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
