// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::ConfidenceLevel;
use crate::schema::SchemaKind;

pub const INVALID_JSON: &str = "invalid_json";

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub parsed: Option<Value>,
    pub schema_valid: bool,
    pub violations: Vec<String>,
    pub confidence: Option<ConfidenceLevel>,
}

/// Validates raw model output against `schema`. Never fails; unusable
/// output is reported through `violations`.
pub fn validate_output(schema: SchemaKind, raw: &str) -> Validation {
    let Some(mut parsed) = extract_json_object(raw) else {
        return Validation {
            parsed: None,
            schema_valid: false,
            violations: vec![INVALID_JSON.to_string()],
            confidence: None,
        };
    };
    let violations = schema.validate(&mut parsed);
    let confidence = schema.confidence(&parsed);
    Validation {
        schema_valid: violations.is_empty(),
        parsed: Some(parsed),
        violations,
        confidence,
    }
}

/// First substring of `raw` that parses as a JSON object.
///
/// Each `{` is tried in order; its matching `}` is found by brace depth,
/// skipping braces inside string literals. Prose and code fences around the
/// object are ignored. One scan resolves every structural `{` it passes, so
/// unbalanced input is not rescanned per brace.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let mut matches: HashMap<usize, Option<usize>> = HashMap::new();
    let mut from = 0usize;
    while let Some(offset) = raw[from..].find('{') {
        let start = from + offset;
        let end = match matches.get(&start) {
            Some(end) => *end,
            None => scan_braces(bytes, start, &mut matches),
        };
        if let Some(end) = end
            && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&raw[start..=end])
        {
            return Some(value);
        }
        from = start + 1;
    }
    None
}

/// Scans from the `{` at `start`, recording in `matches` the closing brace
/// (or `None`) of every `{` outside a string literal. Returns the match for
/// `start`.
fn scan_braces(
    bytes: &[u8],
    start: usize,
    matches: &mut HashMap<usize, Option<usize>>,
) -> Option<usize> {
    let mut open: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                let opened = open.pop()?;
                matches.insert(opened, Some(i));
                if open.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    for opened in open {
        matches.insert(opened, None);
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const VALID_QNA: &str = r#"{"answer": "2 AM UTC", "confidence": "high", "answer_type": "direct"}"#;

    #[test]
    fn accepts_bare_object() {
        let v = validate_output(SchemaKind::Qna, VALID_QNA);
        assert!(v.schema_valid, "{:?}", v.violations);
        assert_eq!(v.confidence, Some(ConfidenceLevel::High));
    }

    #[test]
    fn tolerates_prose_and_fences() {
        let raw = format!("Sure! Here is the result:\n```json\n{VALID_QNA}\n```\nLet me know.");
        let v = validate_output(SchemaKind::Qna, &raw);
        assert!(v.schema_valid);
        assert_eq!(v.parsed, Some(serde_json::from_str(VALID_QNA).expect("json")));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"note {not json} then {"answer": "use {curly} \"quotes\"", "confidence": "low", "answer_type": "inferred"}"#;
        let v = validate_output(SchemaKind::Qna, raw);
        assert!(v.schema_valid, "{:?}", v.violations);
        assert_eq!(v.parsed.as_ref().map(|p| p["answer"].clone()), Some(json!("use {curly} \"quotes\"")));
    }

    #[test]
    fn first_well_formed_object_wins() {
        let raw = r#"{"answer": "first", "confidence": "low", "answer_type": "direct"} {"answer": "second"}"#;
        let v = validate_output(SchemaKind::Qna, raw);
        assert_eq!(v.parsed.as_ref().map(|p| p["answer"].clone()), Some(json!("first")));
    }

    #[test]
    fn object_after_unclosed_brace_is_found() {
        let raw = format!("draft: {{ unfinished {VALID_QNA}");
        let v = validate_output(SchemaKind::Qna, &raw);
        assert!(v.schema_valid, "{:?}", v.violations);
    }

    #[test]
    fn long_runs_of_unclosed_braces_stay_linear() {
        let raw = "{".repeat(200_000);
        assert!(extract_json_object(&raw).is_none());
        let raw = format!("{}{VALID_QNA}", "{ ".repeat(100_000));
        assert!(extract_json_object(&raw).is_some());
    }

    #[test]
    fn malformed_output_is_invalid_json() {
        for raw in ["", "no json here", "{\"answer\": ", "}{", "[1, 2, 3]", "{{{{", "\"{\""] {
            let v = validate_output(SchemaKind::Rag, raw);
            assert!(!v.schema_valid);
            assert_eq!(v.violations, vec![INVALID_JSON]);
            assert!(v.parsed.is_none());
        }
    }

    #[test]
    fn never_panics_on_arbitrary_text() {
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let alphabet: Vec<char> = "{}[]\"\\:,. abc123\n\té€😀".chars().collect();
        for _ in 0..500 {
            let len = (seed % 64) as usize;
            let mut text = String::new();
            for _ in 0..len {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                text.push(alphabet[(seed % alphabet.len() as u64) as usize]);
            }
            for kind in SchemaKind::ALL {
                let v = validate_output(kind, &text);
                assert_eq!(v.schema_valid, v.violations.is_empty());
            }
        }
    }

    #[test]
    fn parsed_but_invalid_keeps_json() {
        let v = validate_output(SchemaKind::Qna, r#"{"answer": "x"}"#);
        assert!(!v.schema_valid);
        assert!(v.parsed.is_some());
        assert!(v.violations.contains(&"missing_field:confidence".to_string()));
    }
}
