//! Transport-stall classification for agent invocation errors.
//!
//! Only enriches diagnostics for one fault category. Everything else stays an
//! ordinary invocation failure.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Known signatures of a hung or dropped agent transport, in match priority.
const STALL_PATTERNS: &[(&str, &str)] = &[
    ("stream_disconnected", r"(?i)stream disconnected"),
    ("stream_idle_timeout", r"(?i)idle timeout"),
    ("connection_reset", r"(?i)connection reset|ECONNRESET"),
    ("connection_timeout", r"(?i)connection timed out|ETIMEDOUT|operation timed out"),
    ("connection_refused", r"(?i)ECONNREFUSED"),
    ("broken_pipe", r"(?i)broken pipe|EPIPE"),
    ("gateway_timeout", r"(?i)\b(502|503|504)\b.*(gateway|unavailable)"),
];

static STALL_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    STALL_PATTERNS
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).unwrap()))
        .collect()
});

static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)request[ _-]?id["']?\s*[:=]?\s*["']?([A-Za-z0-9][A-Za-z0-9_\-]{5,})"#)
        .unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StallClassification {
    pub stalled: bool,
    pub request_id: Option<String>,
    pub pattern: Option<String>,
}

/// Classify invoker error text. The request id is extracted only for stalls.
pub fn classify_stall(text: &str) -> StallClassification {
    let Some((name, _)) = STALL_RES.iter().find(|(_, re)| re.is_match(text)) else {
        return StallClassification::default();
    };
    let request_id = REQUEST_ID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    StallClassification {
        stalled: true,
        request_id,
        pattern: Some((*name).to_string()),
    }
}
