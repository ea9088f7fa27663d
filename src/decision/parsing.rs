//! Three-layer tolerant JSON parsing (spec §4.2/§9): direct JSON, then a
//! fenced ` ```json ` block, then the first balanced `{…}`/`[…]` found
//! anywhere in the text. LLMs rarely return bare JSON; this mirrors what
//! they actually emit.

use serde::de::DeserializeOwned;

use crate::errors::EngineError;

pub fn parse_tolerant<T: DeserializeOwned>(text: &str) -> Result<T, EngineError> {
    if let Some(value) = parse_direct(text) {
        return Ok(value);
    }
    if let Some(value) = parse_fenced(text) {
        return Ok(value);
    }
    if let Some(value) = parse_first_structure(text) {
        return Ok(value);
    }
    Err(EngineError::DecisionParsing(format!(
        "could not recover a structured payload from model output: {}",
        truncate(text, 200)
    )))
}

fn parse_direct<T: DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_str(text.trim()).ok()
}

fn parse_fenced<T: DeserializeOwned>(text: &str) -> Option<T> {
    for marker in ["```json", "```"] {
        if let Some(start) = text.find(marker) {
            let rest = &text[start + marker.len()..];
            if let Some(end) = rest.find("```") {
                let candidate = rest[..end].trim();
                if let Some(value) = serde_json::from_str(candidate).ok() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Find the first balanced `{...}` or `[...]` substring and parse it,
/// tolerating trailing prose ("Here is my analysis: {...}").
fn parse_first_structure<T: DeserializeOwned>(text: &str) -> Option<T> {
    let start = text.find(['{', '['])?;
    let open = text[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        text.to_string()
    } else {
        format!("{}...", &text[..max_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn parses_direct_json() {
        let parsed: Point = parse_tolerant(r#"{"x": 1, "y": 2}"#).unwrap();
        assert_eq!(parsed, Point { x: 1, y: 2 });
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Here's the result:\n```json\n{\"x\": 3, \"y\": 4}\n```\nDone.";
        let parsed: Point = parse_tolerant(text).unwrap();
        assert_eq!(parsed, Point { x: 3, y: 4 });
    }

    #[test]
    fn parses_first_object_in_prose() {
        let text = "I think the answer is {\"x\": 5, \"y\": 6} based on the chart.";
        let parsed: Point = parse_tolerant(text).unwrap();
        assert_eq!(parsed, Point { x: 5, y: 6 });
    }

    #[test]
    fn fails_on_unparseable_text() {
        let result: Result<Point, _> = parse_tolerant("no structured data here");
        assert!(result.is_err());
    }
}
