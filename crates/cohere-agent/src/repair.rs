//! Recovery for malformed tool-call argument strings.
//!
//! Models occasionally emit raw newlines inside JSON string values, which
//! strict parsing rejects. Sanitization escapes those control characters
//! inside string literals and nothing else; it is a stable point, so running
//! it on already-clean input changes nothing.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn string_literal_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)"((?:[^"\\]|\\.)*)""#).ok())
        .as_ref()
}

/// Escape raw `\n` and `\r` characters occurring inside JSON string literals.
pub fn sanitize(raw: &str) -> String {
    let Some(re) = string_literal_regex() else {
        return raw.to_string();
    };
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        let body = caps[1].replace('\n', "\\n").replace('\r', "\\r");
        format!("\"{body}\"")
    })
    .into_owned()
}

/// Parse tool-call arguments, attempting sanitization once on failure.
/// If the repaired text still does not parse, the original parse error is
/// returned so the model sees the diagnosis for what it actually emitted.
pub fn parse_tool_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(original) => serde_json::from_str(&sanitize(raw)).map_err(|_| original),
    }
}
