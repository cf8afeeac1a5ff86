//! `{{param}}` interpolation and injection rules for verification argv.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::codes::ReportCode;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap());

pub const DEFAULT_SHELL_METACHAR_PATTERN: &str = r#"[;&|`$<>\\'"\r\n]"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("missing verification parameter `{name}`")]
    Missing { name: String },
    #[error("malformed placeholder in argument `{arg}`")]
    Malformed { arg: String },
    #[error("parameter `{name}` is {len} bytes, limit is {max}")]
    TooLong { name: String, len: usize, max: usize },
    #[error("parameter `{name}` contains whitespace")]
    Whitespace { name: String },
    #[error("parameter `{name}` contains a path traversal sequence")]
    Traversal { name: String },
    #[error("parameter `{name}` contains shell metacharacters")]
    ShellMetachar { name: String },
}

impl ParamError {
    /// Template mistakes are configuration errors; unsafe values are taint.
    pub fn stop_code(&self) -> ReportCode {
        match self {
            ParamError::Missing { .. } | ParamError::Malformed { .. } => {
                ReportCode::StopVerifyConfigInvalid
            }
            _ => ReportCode::StopVerifyTainted,
        }
    }
}

/// Configurable injection rules, as written in `governor.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamRules {
    pub max_param_length: usize,
    pub allow_whitespace: bool,
    pub shell_metachar_pattern: String,
}

impl Default for ParamRules {
    fn default() -> Self {
        Self {
            max_param_length: 256,
            allow_whitespace: false,
            shell_metachar_pattern: DEFAULT_SHELL_METACHAR_PATTERN.to_string(),
        }
    }
}

impl ParamRules {
    pub fn compile(&self) -> Result<ParamValidator> {
        let metachar = Regex::new(&self.shell_metachar_pattern).with_context(|| {
            format!(
                "compile shell metachar pattern {}",
                self.shell_metachar_pattern
            )
        })?;
        Ok(ParamValidator {
            max_len: self.max_param_length,
            allow_whitespace: self.allow_whitespace,
            metachar,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParamValidator {
    max_len: usize,
    allow_whitespace: bool,
    metachar: Regex,
}

impl ParamValidator {
    pub fn validate(&self, name: &str, value: &str) -> Result<(), ParamError> {
        let name = name.to_string();
        if value.len() > self.max_len {
            return Err(ParamError::TooLong {
                name,
                len: value.len(),
                max: self.max_len,
            });
        }
        if !self.allow_whitespace && value.chars().any(char::is_whitespace) {
            return Err(ParamError::Whitespace { name });
        }
        if value.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(ParamError::Traversal { name });
        }
        if self.metachar.is_match(value) {
            return Err(ParamError::ShellMetachar { name });
        }
        Ok(())
    }

    /// Validate every provided parameter, in name order.
    pub fn validate_all(&self, params: &BTreeMap<String, String>) -> Result<(), ParamError> {
        params
            .iter()
            .try_for_each(|(name, value)| self.validate(name, value))
    }
}

/// Names referenced by `{{...}}` placeholders in `argv`, in order of appearance.
pub fn placeholders(argv: &[String]) -> Vec<String> {
    argv.iter()
        .flat_map(|arg| PLACEHOLDER_RE.captures_iter(arg))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitute placeholders in every argument. A missing parameter is an error,
/// never an empty string.
pub fn interpolate_argv(
    argv: &[String],
    params: &BTreeMap<String, String>,
) -> Result<Vec<String>, ParamError> {
    argv.iter().map(|arg| interpolate_arg(arg, params)).collect()
}

fn interpolate_arg(arg: &str, params: &BTreeMap<String, String>) -> Result<String, ParamError> {
    let mut out = String::with_capacity(arg.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(arg) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = params
            .get(name.as_str())
            .ok_or_else(|| ParamError::Missing {
                name: name.as_str().to_string(),
            })?;
        push_literal(&mut out, &arg[last..whole.start()], arg)?;
        out.push_str(value);
        last = whole.end();
    }
    push_literal(&mut out, &arg[last..], arg)?;
    Ok(out)
}

/// Literal text between placeholders must not open another one.
fn push_literal(out: &mut String, literal: &str, arg: &str) -> Result<(), ParamError> {
    if literal.contains("{{") {
        return Err(ParamError::Malformed {
            arg: arg.to_string(),
        });
    }
    out.push_str(literal);
    Ok(())
}
