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

//! The closed set of output schemas and their field constraints.
//!
//! The same [`FieldSpec`] tables render the output section of a prompt and
//! drive validation, so the two cannot disagree.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::RagError;
use crate::model::ConfidenceLevel;

pub const CONFIDENCE_LEVELS: &[&str] = &["high", "medium", "low"];

/// Output schemas. Tasks that name none use `generic_extraction`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    #[default]
    GenericExtraction,
    Classification,
    Qna,
    Summarization,
    ActionPlan,
    Rag,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text,
    Number,
    Integer,
    OneOf(&'static [&'static str]),
    TextList,
    IntegerList,
    /// Object mapping arbitrary keys to numbers.
    NumberMap,
    Objects(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub nullable: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
        nullable: false,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
        nullable: false,
    }
}

const fn nullable(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
        nullable: true,
    }
}

const CONFIDENCE: FieldKind = FieldKind::OneOf(CONFIDENCE_LEVELS);

const ENTITY_FIELDS: &[FieldSpec] = &[
    required("value", FieldKind::Text),
    required("type", FieldKind::Text),
    required("confidence", CONFIDENCE),
    nullable("source_snippet", FieldKind::Text),
];

const GENERIC_EXTRACTION_FIELDS: &[FieldSpec] = &[
    required("entities", FieldKind::Objects(ENTITY_FIELDS)),
    required("extraction_summary", FieldKind::Text),
    nullable("notes", FieldKind::Text),
];

const CLASSIFICATION_FIELDS: &[FieldSpec] = &[
    required("primary_category", FieldKind::Text),
    required("confidence_primary", CONFIDENCE),
    optional("secondary_categories", FieldKind::TextList),
    required("confidence_scores", FieldKind::NumberMap),
    required("reasoning", FieldKind::Text),
    nullable("uncertainty_notes", FieldKind::Text),
];

const QNA_FIELDS: &[FieldSpec] = &[
    required("answer", FieldKind::Text),
    required("confidence", CONFIDENCE),
    optional("source_evidence", FieldKind::TextList),
    optional("source_documents", FieldKind::TextList),
    required(
        "answer_type",
        FieldKind::OneOf(&["direct", "inferred", "insufficient_context"]),
    ),
    optional("follow_up_questions", FieldKind::TextList),
    nullable("limitations", FieldKind::Text),
];

const SUMMARIZATION_FIELDS: &[FieldSpec] = &[
    required("summary", FieldKind::Text),
    required("key_points", FieldKind::TextList),
    optional("entities_mentioned", FieldKind::TextList),
    optional("topics", FieldKind::TextList),
    required("tone", FieldKind::OneOf(&["formal", "informal", "neutral"])),
    required("compression_ratio", FieldKind::Number),
    required("completeness", CONFIDENCE),
];

const STEP_FIELDS: &[FieldSpec] = &[
    required("step_number", FieldKind::Integer),
    required("action", FieldKind::Text),
    required("details", FieldKind::Text),
    required("time_estimate", FieldKind::Text),
    optional("dependencies", FieldKind::IntegerList),
    required("success_criteria", FieldKind::Text),
];

const ACTION_PLAN_FIELDS: &[FieldSpec] = &[
    required("objective", FieldKind::Text),
    required("steps", FieldKind::Objects(STEP_FIELDS)),
    required("total_duration", FieldKind::Text),
    optional("risks", FieldKind::TextList),
    required("success_rate", CONFIDENCE),
];

const RAG_FIELDS: &[FieldSpec] = &[
    required("answer", FieldKind::Text),
    required("confidence", CONFIDENCE),
    optional("evidence_used", FieldKind::TextList),
    required("context_coverage", CONFIDENCE),
    required(
        "answer_status",
        FieldKind::OneOf(&["answered", "partial", "unable_to_answer"]),
    ),
];

impl SchemaKind {
    pub const ALL: [SchemaKind; 6] = [
        SchemaKind::GenericExtraction,
        SchemaKind::Classification,
        SchemaKind::Qna,
        SchemaKind::Summarization,
        SchemaKind::ActionPlan,
        SchemaKind::Rag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::GenericExtraction => "generic_extraction",
            SchemaKind::Classification => "classification",
            SchemaKind::Qna => "qna",
            SchemaKind::Summarization => "summarization",
            SchemaKind::ActionPlan => "action_plan",
            SchemaKind::Rag => "rag",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SchemaKind::GenericExtraction => "Extract typed entities with confidence levels",
            SchemaKind::Classification => "Assign a primary category with per-category scores",
            SchemaKind::Qna => "Answer a question with evidence and an answer type",
            SchemaKind::Summarization => "Summarize text with key points and tone",
            SchemaKind::ActionPlan => "Produce an ordered plan with dependencies and risks",
            SchemaKind::Rag => "Answer strictly from retrieved context with coverage",
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            SchemaKind::GenericExtraction => GENERIC_EXTRACTION_FIELDS,
            SchemaKind::Classification => CLASSIFICATION_FIELDS,
            SchemaKind::Qna => QNA_FIELDS,
            SchemaKind::Summarization => SUMMARIZATION_FIELDS,
            SchemaKind::ActionPlan => ACTION_PLAN_FIELDS,
            SchemaKind::Rag => RAG_FIELDS,
        }
    }

    /// Field reported as the result's confidence.
    pub fn confidence_field(&self) -> Option<&'static str> {
        match self {
            SchemaKind::Qna | SchemaKind::Rag => Some("confidence"),
            SchemaKind::Classification => Some("confidence_primary"),
            SchemaKind::GenericExtraction | SchemaKind::Summarization | SchemaKind::ActionPlan => {
                None
            }
        }
    }

    /// Free-text field compared against a reference text.
    pub fn text_field(&self) -> Option<&'static str> {
        match self {
            SchemaKind::Qna | SchemaKind::Rag => Some("answer"),
            SchemaKind::Summarization => Some("summary"),
            SchemaKind::GenericExtraction | SchemaKind::Classification | SchemaKind::ActionPlan => {
                None
            }
        }
    }

    /// Field compared against a ground-truth class label.
    pub fn label_field(&self) -> Option<&'static str> {
        match self {
            SchemaKind::Classification => Some("primary_category"),
            _ => None,
        }
    }

    pub fn names() -> String {
        Self::ALL
            .iter()
            .map(SchemaKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Normalizes `value` in place and returns every constraint violation.
    ///
    /// Enumerated strings are trimmed and lower-cased; confidence fields
    /// given as a number in `[0, 1]` become the matching level.
    pub fn validate(&self, value: &mut Value) -> Vec<String> {
        let mut violations = Vec::new();
        match value.as_object_mut() {
            Some(object) => check_object(self.fields(), object, "", &mut violations),
            None => violations.push("not_an_object".to_string()),
        }
        violations
    }

    pub fn confidence(&self, value: &Value) -> Option<ConfidenceLevel> {
        let field = self.confidence_field()?;
        value.get(field)?.as_str().and_then(ConfidenceLevel::parse)
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SchemaKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| RagError::UnknownSchema {
                name: s.to_string(),
                available: SchemaKind::names(),
            })
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn check_object(
    specs: &[FieldSpec],
    object: &mut Map<String, Value>,
    prefix: &str,
    violations: &mut Vec<String>,
) {
    for spec in specs {
        let path = join_path(prefix, spec.name);
        match object.get_mut(spec.name) {
            None => {
                if spec.required {
                    violations.push(format!("missing_field:{path}"));
                }
            }
            Some(Value::Null) => {
                if !spec.nullable {
                    violations.push(format!("wrong_type:{path}:{}", expected(spec.kind)));
                }
            }
            Some(value) => check_value(spec.kind, value, &path, violations),
        }
    }
}

fn check_value(kind: FieldKind, value: &mut Value, path: &str, violations: &mut Vec<String>) {
    let ok = match kind {
        FieldKind::Text => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Integer => is_integer(value),
        FieldKind::OneOf(allowed) => {
            normalize_choice(value, allowed);
            match value.as_str() {
                Some(text) if allowed.contains(&text) => true,
                Some(_) => {
                    violations.push(format!("invalid_value:{path}:{}", allowed.join("|")));
                    return;
                }
                None => false,
            }
        }
        FieldKind::TextList => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        FieldKind::IntegerList => value
            .as_array()
            .is_some_and(|items| items.iter().all(is_integer)),
        FieldKind::NumberMap => value
            .as_object()
            .is_some_and(|map| map.values().all(Value::is_number)),
        FieldKind::Objects(specs) => match value.as_array_mut() {
            Some(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    match item.as_object_mut() {
                        Some(object) => check_object(specs, object, &item_path, violations),
                        None => violations.push(format!("wrong_type:{item_path}:object")),
                    }
                }
                true
            }
            None => false,
        },
    };
    if !ok {
        violations.push(format!("wrong_type:{path}:{}", expected(kind)));
    }
}

fn normalize_choice(value: &mut Value, allowed: &[&str]) {
    match value {
        Value::String(text) => {
            let normalized = text.trim().to_lowercase();
            if normalized != *text {
                *text = normalized;
            }
        }
        Value::Number(number) if allowed == CONFIDENCE_LEVELS => {
            if let Some(score) = number.as_f64()
                && (0.0..=1.0).contains(&score)
            {
                *value = Value::String(ConfidenceLevel::from_score(score).as_str().to_string());
            }
        }
        _ => {}
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
        _ => false,
    }
}

fn expected(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "string",
        FieldKind::Number => "number",
        FieldKind::Integer => "integer",
        FieldKind::OneOf(_) => "string",
        FieldKind::TextList => "string[]",
        FieldKind::IntegerList => "integer[]",
        FieldKind::NumberMap => "object<number>",
        FieldKind::Objects(_) => "object[]",
    }
}
