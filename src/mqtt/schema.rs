//! Filesystem-backed schema loading and topic-keyed validation.
//!
//! Schemas live in a `schemas/` directory co-located with the binary. Every
//! known topic pattern must resolve to a schema at startup; a missing file is
//! fatal. Validation failures at publish time are not.

use jsonschema::JSONSchema;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema file missing or unreadable: {path}: {reason}")]
    Missing { path: String, reason: String },

    #[error("schema {path} failed to compile: {reason}")]
    Compile { path: String, reason: String },

    #[error("payload failed schema validation: {0}")]
    Validation(String),
}

/// Topic patterns and their schema files, as shipped in `schemas/`
const SCHEMA_TABLE: &[(&str, &str)] = &[
    ("hydrobotics/video/+/frame", "video_frame.schema.json"),
    ("hydrobotics/rov/+/telemetry", "rov_telemetry.schema.json"),
    ("hydrobotics/rov/+/command", "rov_command.schema.json"),
    ("hydrobotics/float/+/telemetry", "float_telemetry.schema.json"),
    ("hydrobotics/project/+/status", "project_status.schema.json"),
];

pub struct TopicSchema {
    pub pattern: String,
    pub raw: Value,
    compiled: JSONSchema,
}

impl std::fmt::Debug for TopicSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSchema")
            .field("pattern", &self.pattern)
            .field("raw", &self.raw)
            .finish()
    }
}

impl TopicSchema {
    pub fn validate(&self, instance: &Value) -> Result<(), SchemaError> {
        let result = self.compiled.validate(instance);
        match result {
            Ok(()) => Ok(()),
            Err(errors) => {
                let detail = errors
                    .map(|e| format!("{} at {}", e, e.instance_path))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(SchemaError::Validation(detail))
            }
        }
    }
}

#[derive(Debug)]
pub struct SchemaSet {
    schemas: Vec<TopicSchema>,
}

impl SchemaSet {
    /// Load every known schema from `dir`. All five must be present.
    pub fn load_dir(dir: &Path) -> Result<Self, SchemaError> {
        info!(dir = %dir.display(), "Loading topic schemas");
        let mut schemas = Vec::with_capacity(SCHEMA_TABLE.len());

        for (pattern, file) in SCHEMA_TABLE {
            let path = dir.join(file);
            let content = std::fs::read_to_string(&path).map_err(|e| SchemaError::Missing {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let raw: Value =
                serde_json::from_str(&content).map_err(|e| SchemaError::Missing {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            let compiled =
                JSONSchema::options()
                    .compile(&raw)
                    .map_err(|e| SchemaError::Compile {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;

            schemas.push(TopicSchema {
                pattern: pattern.to_string(),
                raw,
                compiled,
            });
        }

        Ok(SchemaSet { schemas })
    }

    /// Find the schema whose pattern matches `topic` (`+` spans one level)
    pub fn for_topic(&self, topic: &str) -> Option<&TopicSchema> {
        self.schemas
            .iter()
            .find(|schema| topic_matches(&schema.pattern, topic))
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    pattern_parts.len() == topic_parts.len()
        && pattern_parts
            .iter()
            .zip(&topic_parts)
            .all(|(p, t)| *p == "+" || p == t)
}

/// The schema directory co-located with the binary, falling back to the
/// working directory during development.
pub fn default_schemas_dir() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let co_located = dir.join("schemas");
            if co_located.is_dir() {
                return co_located;
            }
        }
    }
    PathBuf::from("schemas")
}

/// Extract the unit a property schema declares for its `unit` field:
/// the `const`, or the first `enum` entry.
pub fn property_unit(prop: &Value) -> Option<String> {
    let unit_schema = prop.get("properties")?.get("unit")?;
    if let Some(unit) = unit_schema.get("const").and_then(Value::as_str) {
        return Some(unit.to_string());
    }
    unit_schema
        .get("enum")?
        .as_array()?
        .first()?
        .as_str()
        .map(str::to_string)
}
