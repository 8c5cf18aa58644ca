//! Defensive JSON parsing with surgical repair
//!
//! Providers truncate output, wrap JSON in markdown fences, leave trailing
//! commas, or emit JS-flavored syntax. The repair ladder tries progressively
//! more invasive strategies until one parses. Repair only closes what is
//! lexically present; it never invents content.

use serde_json::Value;
use tracing::debug;

/// Result of a repair attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub value: Option<Value>,
    pub repaired: bool,
    pub notes: Vec<String>,
}

impl RepairOutcome {
    fn success(value: Value, repaired: bool, notes: Vec<String>) -> Self {
        Self {
            value: Some(value),
            repaired,
            notes,
        }
    }

    fn failure(notes: Vec<String>) -> Self {
        Self {
            value: None,
            repaired: false,
            notes,
        }
    }
}

/// Parse a possibly malformed JSON string, repairing if necessary.
pub fn repair_json(input: &str) -> RepairOutcome {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return RepairOutcome::failure(vec!["empty input".to_string()]);
    }

    // 1. Strict parse
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return RepairOutcome::success(value, false, Vec::new());
    }

    // 2. Strip markdown fences and surrounding prose
    let mut notes = Vec::new();
    let candidate = match strip_wrapping(trimmed) {
        Some(stripped) => {
            if stripped != trimmed {
                notes.push("repaired JSON: stripped code fences or surrounding prose".to_string());
            }
            stripped.to_string()
        }
        None => {
            return RepairOutcome::failure(vec![
                "no JSON object or array found in input".to_string()
            ]);
        }
    };
    if !notes.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            return RepairOutcome::success(value, true, notes);
        }
    }

    // 3. Balance unmatched brackets
    let (balanced, appended, closed_string) = balance_brackets(&candidate);
    if appended > 0 || closed_string {
        let mut stage_notes = notes.clone();
        stage_notes.push(format!(
            "repaired JSON: appended {} missing closing bracket(s)",
            appended
        ));
        if closed_string {
            stage_notes.push("repaired JSON: terminated an unclosed string".to_string());
        }
        if let Ok(value) = serde_json::from_str::<Value>(&balanced) {
            return RepairOutcome::success(value, true, stage_notes);
        }
    }

    // 4. Normalize JS-isms, then balance again
    let normalized = remove_trailing_commas(&replace_single_quotes(&strip_comments(&candidate)));
    let (renormalized, appended2, closed_string2) = balance_brackets(&normalized);
    {
        let mut stage_notes = notes.clone();
        stage_notes
            .push("repaired JSON: normalized comments, quotes and trailing commas".to_string());
        if appended2 > 0 || closed_string2 {
            stage_notes.push(format!(
                "repaired JSON: appended {} missing closing bracket(s)",
                appended2
            ));
        }
        if let Ok(value) = serde_json::from_str::<Value>(&renormalized) {
            return RepairOutcome::success(value, true, stage_notes);
        }
    }

    // 5. Largest valid prefix
    if let Some((value, dropped)) = largest_valid_prefix(&normalized) {
        let mut stage_notes = notes;
        stage_notes.push(
            "repaired JSON: recovered largest valid prefix, trailing content dropped".to_string(),
        );
        if dropped {
            stage_notes.push("repaired JSON: a truncated array or object was closed early".to_string());
        }
        return RepairOutcome::success(value, true, stage_notes);
    }

    debug!("all repair strategies exhausted");
    RepairOutcome::failure(vec![
        "all repair strategies failed".to_string(),
        "input is not recoverable JSON".to_string(),
    ])
}

/// Cut markdown fences and prose surrounding the first JSON value.
/// Returns `None` when the input holds no `{` or `[` at all.
fn strip_wrapping(input: &str) -> Option<&str> {
    let mut body = input;

    if let Some(fence_start) = body.find("```") {
        let after_fence = &body[fence_start + 3..];
        // Skip an optional language tag on the fence line
        let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let fenced = &after_fence[content_start..];
        body = match fenced.find("```") {
            Some(end) => &fenced[..end],
            None => fenced,
        };
    }

    let open = body.find(|c| c == '{' || c == '[')?;
    let close = body.rfind(|c| c == '}' || c == ']');
    match close {
        Some(end) if end > open => Some(body[open..=end].trim()),
        _ => Some(body[open..].trim()),
    }
}

/// Scanner state shared by the lexical passes
struct Scanner {
    in_string: bool,
    escaped: bool,
}

impl Scanner {
    fn new() -> Self {
        Self {
            in_string: false,
            escaped: false,
        }
    }

    /// Advance over one char; returns true while inside a string literal
    fn step(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            true
        } else {
            if c == '"' {
                self.in_string = true;
            }
            false
        }
    }
}

/// Remove `//` and `/* */` comments outside string literals
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut scanner = Scanner::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !scanner.in_string && c == '/' && i + 1 < chars.len() {
            match chars[i + 1] {
                '/' => {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                '*' => {
                    i += 2;
                    while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                        i += 1;
                    }
                    i = (i + 2).min(chars.len());
                    continue;
                }
                _ => {}
            }
        }
        scanner.step(c);
        out.push(c);
        i += 1;
    }
    out
}

/// Convert single-quoted strings to double-quoted outside string literals
fn replace_single_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut scanner = Scanner::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !scanner.in_string && c == '\'' {
            out.push('"');
            i += 1;
            let mut escaped = false;
            while i < chars.len() {
                let inner = chars[i];
                if escaped {
                    out.push(inner);
                    escaped = false;
                } else if inner == '\\' {
                    out.push(inner);
                    escaped = true;
                } else if inner == '\'' {
                    break;
                } else if inner == '"' {
                    out.push('\\');
                    out.push('"');
                } else {
                    out.push(inner);
                }
                i += 1;
            }
            out.push('"');
            i += 1;
            continue;
        }
        scanner.step(c);
        out.push(c);
        i += 1;
    }
    out
}

/// Drop commas that directly precede a closing bracket
fn remove_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut scanner = Scanner::new();

    for (i, &c) in chars.iter().enumerate() {
        let in_string = scanner.step(c);
        if !in_string && c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Append closers for every unmatched opener. Returns the repaired text,
/// the number of appended closers and whether an unclosed string literal
/// had to be terminated.
fn balance_brackets(input: &str) -> (String, usize, bool) {
    let mut stack = Vec::new();
    let mut scanner = Scanner::new();

    for c in input.chars() {
        if scanner.step(c) {
            continue;
        }
        match c {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let closed_string = scanner.in_string;
    let mut out = input.trim_end().to_string();
    // A dangling comma or colon before appended closers would still fail
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
        out = out.trim_end().to_string();
    }
    if closed_string {
        out.push('"');
    }
    let appended = stack.len();
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    (out, appended, closed_string)
}

/// Find the largest prefix that parses after bracket balancing.
/// Returns the parsed value and whether content was dropped.
fn largest_valid_prefix(input: &str) -> Option<(Value, bool)> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut scanner = Scanner::new();
    let mut cut_points = Vec::new();

    for &(pos, c) in &chars {
        if scanner.step(c) {
            continue;
        }
        if matches!(c, '}' | ']') {
            cut_points.push(pos + c.len_utf8());
        } else if c == ',' {
            cut_points.push(pos);
        }
    }

    for &cut in cut_points.iter().rev().take(256) {
        let slice = &input[..cut];
        let (balanced, appended, _) = balance_brackets(slice);
        if let Ok(value) = serde_json::from_str::<Value>(&balanced) {
            let dropped = appended > 0 || cut < input.trim_end().len();
            return Some((value, dropped));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_json_is_not_marked_repaired() {
        let outcome = repair_json(r#"{"title": "ok", "n": 3}"#);
        assert!(!outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"title": "ok", "n": 3})));
        assert!(outcome.notes.is_empty());
    }

    #[test]
    fn markdown_fences_are_stripped() {
        let input = "Here is the scene:\n```json\n{\"title\": \"fenced\"}\n```\nHope you like it!";
        let outcome = repair_json(input);
        assert!(outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"title": "fenced"})));
        assert!(outcome.notes.iter().any(|n| n.contains("fences")));
    }

    #[test]
    fn leading_prose_is_stripped() {
        let outcome = repair_json("Sure! The JSON is {\"a\": 1}");
        assert_eq!(outcome.value, Some(json!({"a": 1})));
        assert!(outcome.repaired);
    }

    #[test]
    fn unmatched_brackets_are_closed() {
        let outcome = repair_json(r#"{"structures": [{"id": "s1""#);
        assert!(outcome.repaired);
        let value = outcome.value.unwrap();
        assert_eq!(value["structures"][0]["id"], "s1");
    }

    #[test]
    fn trailing_commas_are_removed() {
        let outcome = repair_json(r#"{"a": 1, "b": [1, 2,],}"#);
        assert!(outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"a": 1, "b": [1, 2]})));
    }

    #[test]
    fn single_quotes_become_double_quotes() {
        let outcome = repair_json("{'title': 'single quoted'}");
        assert!(outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"title": "single quoted"})));
    }

    #[test]
    fn js_comments_are_removed() {
        let input = "{\n  // scene title\n  \"title\": \"commented\", /* inline */ \"n\": 1\n}";
        let outcome = repair_json(input);
        assert!(outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"title": "commented", "n": 1})));
    }

    #[test]
    fn fenced_json_with_trailing_comma_repairs() {
        let input = "```json\n{\"title\": \"both\", \"tags\": [\"a\", \"b\",]}\n```";
        let outcome = repair_json(input);
        assert!(outcome.repaired);
        assert_eq!(
            outcome.value,
            Some(json!({"title": "both", "tags": ["a", "b"]}))
        );
    }

    #[test]
    fn truncated_output_recovers_prefix() {
        let input = r#"{"title": "cut", "structures": [{"id": "s1"}, {"id": "s2"}, {"id"#;
        let outcome = repair_json(input);
        assert!(outcome.repaired);
        let value = outcome.value.unwrap();
        assert_eq!(value["title"], "cut");
        let structures = value["structures"].as_array().unwrap();
        assert!(structures.len() >= 2);
        assert!(outcome.notes.iter().any(|n| n.contains("repaired")));
    }

    #[test]
    fn unclosed_string_is_terminated() {
        let outcome = repair_json(r#"{"title": "unterminated"#);
        assert!(outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"title": "unterminated"})));
    }

    #[test]
    fn hopeless_input_fails_cleanly() {
        let outcome = repair_json("no json here at all");
        assert!(outcome.value.is_none());
        assert!(!outcome.repaired);
        assert!(!outcome.notes.is_empty());
    }

    #[test]
    fn empty_input_fails_cleanly() {
        let outcome = repair_json("   ");
        assert!(outcome.value.is_none());
        assert_eq!(outcome.notes, vec!["empty input".to_string()]);
    }

    #[test]
    fn repair_does_not_invent_fields() {
        let outcome = repair_json(r#"{"only": "field""#);
        let value = outcome.value.unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        let outcome = repair_json(r#"{"text": "array [1, 2{ and more"}"#);
        assert!(!outcome.repaired);
        assert_eq!(outcome.value, Some(json!({"text": "array [1, 2{ and more"})));
    }
}
