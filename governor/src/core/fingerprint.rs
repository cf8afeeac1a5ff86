//! Canonical, order-independent task fingerprints.
//!
//! The loop driver compares fingerprints of consecutive tasks to detect a
//! planner redispatching the same work. Only determinism and the exclusion
//! rules live here; storage belongs to the caller.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::Task;

/// Top-level fields that identify a task without describing its content.
const IDENTITY_FIELDS: &[&str] = &["task_id"];

/// Canonical string form of a task's semantic content.
pub fn canonicalize(task: &Task) -> Result<String> {
    let value = serde_json::to_value(task).context("serialize task for fingerprint")?;
    Ok(canonicalize_value(&value))
}

/// Canonicalize a raw task document.
///
/// Object keys are sorted, strings trimmed, `null` members dropped and
/// top-level identity fields removed. Array order is significant.
pub fn canonicalize_value(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            let filtered = map
                .iter()
                .filter(|(key, _)| !IDENTITY_FIELDS.contains(&key.as_str()));
            write_object(filtered, &mut out);
        }
        other => write_canonical(other, &mut out),
    }
    out
}

/// SHA-256 of the canonical form, as 64 lowercase hex characters.
pub fn fingerprint(task: &Task) -> Result<String> {
    Ok(digest(&canonicalize(task)?))
}

pub fn fingerprint_value(value: &Value) -> String {
    digest(&canonicalize_value(value))
}

fn digest(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_string(s.trim(), out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map.iter(), out),
    }
}

fn write_object<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>, out: &mut String) {
    let mut entries: Vec<_> = entries.filter(|(_, v)| !v.is_null()).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_string(key, out);
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}

fn push_string(s: &str, out: &mut String) {
    // serde_json escaping of a plain &str cannot fail.
    out.push_str(&Value::String(s.to_string()).to_string());
}
