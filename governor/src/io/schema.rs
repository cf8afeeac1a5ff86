//! Embedded JSON schemas for agent-produced documents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

const TASK_SCHEMA: &str = include_str!("../../schemas/task.schema.json");
const BUILDER_RESULT_SCHEMA: &str = include_str!("../../schemas/builder_result.schema.json");
const REVIEWER_VERDICT_SCHEMA: &str = include_str!("../../schemas/reviewer_verdict.schema.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Task,
    BuilderResult,
    ReviewerVerdict,
}

impl SchemaKind {
    fn source(self) -> &'static str {
        match self {
            SchemaKind::Task => TASK_SCHEMA,
            SchemaKind::BuilderResult => BUILDER_RESULT_SCHEMA,
            SchemaKind::ReviewerVerdict => REVIEWER_VERDICT_SCHEMA,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            SchemaKind::Task => "task.schema.json",
            SchemaKind::BuilderResult => "builder_result.schema.json",
            SchemaKind::ReviewerVerdict => "reviewer_verdict.schema.json",
        }
    }
}

/// Validate `instance`, returning every schema violation (empty when valid).
pub fn schema_errors(kind: SchemaKind, instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(kind.source())
        .with_context(|| format!("parse embedded {}", kind.file_name()))?;
    let compiled = validator_for(&schema)
        .map_err(|err| anyhow!("invalid schema {}: {}", kind.file_name(), err))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

/// Write a schema into `dir` so out-of-process drivers can read it.
pub fn write_schema(dir: &Path, kind: SchemaKind) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create schema dir {}", dir.display()))?;
    let path = dir.join(kind.file_name());
    fs::write(&path, kind.source())
        .with_context(|| format!("write schema {}", path.display()))?;
    Ok(path)
}
