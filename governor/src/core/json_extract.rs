//! Pull a JSON object out of free-form agent text.
//!
//! Agents wrap their answer in prose or markdown more often than not. The
//! pipeline tries, in order: the whole text, the first fenced code block, and
//! a scan for balanced `{...}` spans.

use serde_json::Value;

use crate::core::builder_outcome::ParseErrorKind;

/// Which stage of the pipeline produced the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMethod {
    Direct,
    Fenced,
    Balanced,
}

/// Extract the first JSON object from `text`.
///
/// Top-level arrays and scalars are not accepted.
pub fn extract_json_object(text: &str) -> Result<(Value, ExtractMethod), ParseErrorKind> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseErrorKind::Empty);
    }
    if let Some(value) = parse_object(trimmed) {
        return Ok((value, ExtractMethod::Direct));
    }
    if let Some(body) = extract_fenced_block(trimmed)
        && let Some(value) = parse_object(body.trim())
    {
        return Ok((value, ExtractMethod::Fenced));
    }
    for (start, _) in trimmed.match_indices('{') {
        if let Some(candidate) = balanced_object(&trimmed[start..])
            && let Some(value) = parse_object(candidate)
        {
            return Ok((value, ExtractMethod::Balanced));
        }
    }
    Err(ParseErrorKind::NoJson)
}

fn parse_object(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Body of the first markdown fence, skipping its language tag line.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let fence_start = text.find("```")?;
    let after_open = &text[fence_start + 3..];
    let body_start = fence_start + 3 + after_open.find('\n')? + 1;
    let body_len = text[body_start..].find("```")?;
    (body_len > 0).then(|| &text[body_start..body_start + body_len])
}

/// The balanced object starting at byte 0 of `s`, honouring string literals.
fn balanced_object(s: &str) -> Option<&str> {
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
