use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static AGENT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*agent:([A-Za-z0-9._-]+)\s*-->").expect("agent marker regex"));

static AGENT_PREAMBLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^You are ([A-Z][A-Za-z0-9._-]{1,48}),").expect("agent preamble regex"));

// Best-effort peek at a buffered request body for an agent tag in the system
// prompt. Returns None for streaming bodies, non-JSON payloads, or prompts
// without a recognizable marker.
pub fn extract_agent_hint(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<Value>(body).ok()?;
    let system = value.get("system")?;

    let text = match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };

    if let Some(captures) = AGENT_MARKER.captures(&text) {
        return Some(captures[1].to_string());
    }
    AGENT_PREAMBLE
        .captures(text.trim_start())
        .map(|captures| captures[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_in_string_system_prompt() {
        let body = br#"{"system":"<!-- agent:code-reviewer -->\nReview the diff.","messages":[]}"#;
        assert_eq!(extract_agent_hint(body).as_deref(), Some("code-reviewer"));
    }

    #[test]
    fn test_marker_in_block_array() {
        let body = br#"{"system":[{"type":"text","text":"intro"},{"type":"text","text":"<!-- agent:planner -->"}]}"#;
        assert_eq!(extract_agent_hint(body).as_deref(), Some("planner"));
    }

    #[test]
    fn test_preamble_fallback() {
        let body = br#"{"system":"You are Navigator, a routing assistant."}"#;
        assert_eq!(extract_agent_hint(body).as_deref(), Some("Navigator"));
    }

    #[test]
    fn test_no_hint() {
        assert_eq!(extract_agent_hint(br#"{"system":"Be helpful."}"#), None);
        assert_eq!(extract_agent_hint(br#"{"messages":[]}"#), None);
        assert_eq!(extract_agent_hint(b"not json"), None);
    }
}
