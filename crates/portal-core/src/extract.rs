//! Structured output parsing for LLM extraction calls

use serde::de::DeserializeOwned;

/// Model output that could not be read as the expected JSON shape
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct ParseFailure {
    pub reason: String,
    /// The text exactly as the model returned it
    pub raw: String,
}

/// Strip markdown fences and parse the remaining JSON into `T`.
///
/// Accepts bare JSON, a reply that is wholly one fenced block (with or
/// without a `json` tag), or prose with a fenced block somewhere inside.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ParseFailure> {
    let body = strip_fences(raw);
    serde_json::from_str(body).map_err(|e| ParseFailure {
        reason: e.to_string(),
        raw: raw.to_string(),
    })
}

fn strip_fences(raw: &str) -> &str {
    let text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim();
    }

    // A fenced block embedded in surrounding prose
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Shape {
        facts: Vec<String>,
    }

    #[test]
    fn test_bare_json() {
        let parsed: Shape = parse_structured(r#"{"facts": ["a"]}"#).unwrap();
        assert_eq!(parsed.facts, vec!["a"]);
    }

    #[test]
    fn test_fenced_json() {
        let raw = "```json\n{\"facts\": [\"b\"]}\n```";
        let parsed: Shape = parse_structured(raw).unwrap();
        assert_eq!(parsed.facts, vec!["b"]);

        let raw = "```\n{\"facts\": []}\n```";
        let parsed: Shape = parse_structured(raw).unwrap();
        assert!(parsed.facts.is_empty());
    }

    #[test]
    fn test_fence_inside_prose() {
        let raw = "Here is what I found:\n```json\n{\"facts\": [\"c\"]}\n```\nHope it helps.";
        let parsed: Shape = parse_structured(raw).unwrap();
        assert_eq!(parsed.facts, vec!["c"]);
    }

    #[test]
    fn test_failure_keeps_raw_text() {
        let raw = "I could not find anything worth remembering.";
        let err = parse_structured::<Shape>(raw).unwrap_err();
        assert_eq!(err.raw, raw);

        // valid JSON, wrong shape
        assert!(parse_structured::<Shape>(r#"{"other": 1}"#).is_err());
    }
}
