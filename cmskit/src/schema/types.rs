use crate::value::OrderedMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Declared scalar type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
    Text,
    Date,
    Datetime,
    Choice,
    Binary,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Choice => "choice",
            FieldType::Binary => "binary",
        }
    }
}

/// Metadata for a single field, as reported by a data engine.
///
/// `choices` and `info` belong to the detailed phase; engines leave them
/// empty when answering a basic field load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    /// Raw pipe-delimited annotation, e.g. `label=Title|searchable`
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl FieldInfo {
    pub fn new(field_type: FieldType) -> Self {
        FieldInfo {
            field_type,
            subtype: None,
            length: None,
            nullable: false,
            choices: None,
            info: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_info(mut self, info: &str) -> Self {
        self.info = Some(info.to_string());
        self
    }

    /// Copy of this metadata without the detailed-phase attributes.
    pub fn basic(&self) -> Self {
        FieldInfo {
            choices: None,
            info: None,
            extra: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Fold the `info` annotation into `extra`. Existing keys are kept.
    pub fn merge_info(&mut self) {
        if let Some(info) = &self.info {
            for (key, value) in parse_info(info) {
                self.extra.entry(key).or_insert(value);
            }
        }
    }
}

/// Field metadata keyed by field id, in declaration order.
pub type FieldMap = OrderedMap<FieldInfo>;

fn info_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w.-]*)\s*(?:=\s*(.*?))?\s*$").expect("static pattern")
    })
}

/// Parse a pipe-delimited annotation into key/value pairs.
/// `key=value` keeps the value, a bare `flag` maps to `"true"`, and
/// segments that are not identifiers are ignored.
pub fn parse_info(info: &str) -> Vec<(String, String)> {
    info.split('|')
        .filter_map(|segment| {
            let caps = info_pattern().captures(segment)?;
            let key = caps.get(1)?.as_str().to_string();
            let value = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "true".to_string());
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_info_pairs_and_flags() {
        let parsed = parse_info("label=Page title| searchable |widget = textarea||9bad");
        assert_eq!(
            parsed,
            vec![
                ("label".to_string(), "Page title".to_string()),
                ("searchable".to_string(), "true".to_string()),
                ("widget".to_string(), "textarea".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_info_keeps_existing_keys() {
        let mut info = FieldInfo::new(FieldType::String).with_info("label=Title|rows=3");
        info.extra.insert("label".into(), "Custom".into());
        info.merge_info();
        assert_eq!(info.extra["label"], "Custom");
        assert_eq!(info.extra["rows"], "3");
    }

    #[test]
    fn test_basic_strips_details() {
        let full = FieldInfo::new(FieldType::Choice)
            .with_choices(&["draft", "live"])
            .with_info("label=Status");
        let basic = full.basic();
        assert_eq!(basic.field_type, FieldType::Choice);
        assert!(basic.choices.is_none());
        assert!(basic.info.is_none());
    }

    #[test]
    fn test_field_info_from_yaml() {
        let info: FieldInfo =
            serde_yaml::from_str("{ type: string, length: 80, nullable: true }").unwrap();
        assert_eq!(info.field_type, FieldType::String);
        assert_eq!(info.length, Some(80));
        assert!(info.nullable);
    }
}
