// ABOUTME: Defensive JSON extraction for free-form classifier output.
// ABOUTME: Strips markdown fences and surrounding prose, then repairs common LLM JSON mistakes.

use anyhow::{bail, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").ok());

static BARE_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").ok());

/// Remove a surrounding ```json ... ``` (or bare ```) fence if present
pub fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the language marker line
        text = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => rest,
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Slice from the first '{' to the last '}' so prose around the object is ignored
pub fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Best-effort repair: single quotes, trailing commas, unquoted keys
pub fn repair(text: &str) -> String {
    let mut fixed = if text.contains('"') {
        text.to_string()
    } else {
        text.replace('\'', "\"")
    };
    if let Some(re) = TRAILING_COMMA.as_ref() {
        fixed = re.replace_all(&fixed, "$1").into_owned();
    }
    if let Some(re) = BARE_KEY.as_ref() {
        fixed = re.replace_all(&fixed, "$1\"$2\":").into_owned();
    }
    fixed
}

/// Parse classifier output into a JSON object, repairing it if strict parsing fails
pub fn parse_object(raw: &str) -> Result<Value> {
    let stripped = strip_fences(raw);
    let Some(candidate) = extract_object(stripped) else {
        bail!("classifier output contains no JSON object");
    };

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let repaired = repair(candidate);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) if value.is_object() => {
            tracing::debug!("Classifier output required JSON repair");
            Ok(value)
        }
        Ok(_) => bail!("classifier output is not a JSON object"),
        Err(e) => bail!("classifier output is not valid JSON after repair: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fence() {
        let raw = "```json\n{\"intent\": \"build\"}\n```";
        assert_eq!(strip_fences(raw), "{\"intent\": \"build\"}");
    }

    #[test]
    fn test_strip_bare_fence_and_whitespace() {
        let raw = "  ```\n{}\n```  ";
        assert_eq!(strip_fences(raw), "{}");
    }

    #[test]
    fn test_plain_object_untouched() {
        let value = parse_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_object_inside_prose() {
        let raw = "Sure! Here is the analysis:\n{\"intent\": \"x\"}\nHope that helps.";
        let value = parse_object(raw).unwrap();
        assert_eq!(value["intent"], "x");
    }

    #[test]
    fn test_repair_single_quotes_and_trailing_comma() {
        let raw = "{'intent': 'write code', 'frameworks': ['flask',],}";
        let value = parse_object(raw).unwrap();
        assert_eq!(value["intent"], "write code");
        assert_eq!(value["frameworks"][0], "flask");
    }

    #[test]
    fn test_repair_bare_keys() {
        let raw = r#"{intent: "chat", confidence: 0.5}"#;
        let value = parse_object(raw).unwrap();
        assert_eq!(value["intent"], "chat");
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_object("no json here").is_err());
        assert!(parse_object("{not: [valid").is_err());
    }

    #[test]
    fn test_array_is_rejected() {
        assert!(parse_object("[1, 2, 3]").is_err());
    }
}
