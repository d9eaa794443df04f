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

//! Deterministic prompt assembly. Identical inputs render byte-identical
//! prompts.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Map;
use serde_json::Value;

use crate::model::ScoredEntry;
use crate::schema::FieldKind;
use crate::schema::FieldSpec;
use crate::schema::SchemaKind;

pub const INSUFFICIENT_CONTEXT: &str = "insufficient_context";

const RULES: &[&str] = &[
    "Use only the information supplied below. Do not add facts from memory.",
    "Respond with exactly one JSON object and nothing else: no prose, no markdown, no code fences.",
    "Include every required field, spelled exactly as listed, with the listed types and allowed values.",
    "When the supplied information does not support an answer, apply the FALLBACK instruction using the value \"insufficient_context\".",
    "Copy evidence verbatim from the supplied text when a field asks for evidence or snippets.",
    "Choose a lower confidence level whenever you are unsure.",
];

/// Task input as rendered into the prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub query: &'a str,
    pub fields: &'a BTreeMap<String, String>,
}

impl<'a> PromptInput<'a> {
    pub fn new(query: &'a str, fields: &'a BTreeMap<String, String>) -> Self {
        Self { query, fields }
    }
}

/// Renders the prompt. `context` is `Some` in retrieval mode (possibly
/// empty) and `None` in direct mode.
pub fn assemble(schema: SchemaKind, input: PromptInput<'_>, context: Option<&[ScoredEntry]>) -> String {
    let mut out = String::new();
    out.push_str("You are a careful assistant that answers with structured JSON.\n\nRULES:\n");
    for (i, rule) in RULES.iter().enumerate() {
        let _ = writeln!(out, "{}. {rule}", i + 1);
    }

    let _ = write!(out, "\nTASK ({}):\n{}\n", schema.as_str(), task(schema));
    out.push_str("\nCONSTRAINTS:\n");
    for line in constraints(schema) {
        let _ = writeln!(out, "- {line}");
    }
    let _ = write!(out, "\nFALLBACK:\n{}\n", fallback(schema));
    out.push_str("\nOUTPUT FORMAT:\nReturn one JSON object with these fields:\n");
    render_fields(&mut out, schema.fields(), 0);

    match context {
        Some(chunks) => {
            out.push_str("\nCONTEXT:\n");
            if chunks.is_empty() {
                out.push_str("(no context was retrieved)\n");
                let _ = writeln!(
                    out,
                    "No supporting context is available, so apply the FALLBACK instruction with \"{INSUFFICIENT_CONTEXT}\"."
                );
            } else {
                for (i, chunk) in chunks.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "[{}] source: {} | score: {:.3}\n{}\n",
                        i + 1,
                        chunk.entry.source_path,
                        chunk.score,
                        chunk.entry.chunk_text.trim_end()
                    );
                }
            }
            let _ = write!(out, "\nQUERY:\n{}\n", input.query);
            if !input.fields.is_empty() {
                out.push_str("\nFIELDS:\n");
                for (key, value) in input.fields {
                    let _ = writeln!(out, "{key}: {value}");
                }
            }
        }
        None => {
            let mut object = Map::new();
            object.insert("input".to_string(), Value::String(input.query.to_string()));
            for (key, value) in input.fields {
                object.insert(key.clone(), Value::String(value.clone()));
            }
            let rendered = serde_json::to_string_pretty(&Value::Object(object))
                .unwrap_or_else(|_| input.query.to_string());
            let _ = write!(out, "\nINPUT:\n{rendered}\n");
        }
    }

    out.push_str("\nJSON:\n");
    out
}

fn task(schema: SchemaKind) -> &'static str {
    match schema {
        SchemaKind::GenericExtraction => {
            "Extract the named entities that appear in the input: people, organizations, places, dates, amounts, identifiers and other key values. Give each entity a short type label."
        }
        SchemaKind::Classification => {
            "Classify the input into the single most fitting category and score every category you considered."
        }
        SchemaKind::Qna => "Answer the question using the supplied information.",
        SchemaKind::Summarization => {
            "Summarize the input faithfully, listing its key points, the entities and topics it mentions, and its tone."
        }
        SchemaKind::ActionPlan => {
            "Turn the request into an ordered, executable plan with time estimates, dependencies between steps, and risks."
        }
        SchemaKind::Rag => {
            "Answer the query strictly from the CONTEXT passages and report how well the context covers the query."
        }
    }
}

fn constraints(schema: SchemaKind) -> &'static [&'static str] {
    match schema {
        SchemaKind::GenericExtraction => &[
            "Only extract entities that literally appear in the input.",
            "source_snippet quotes the text the entity was taken from.",
            "extraction_summary is one sentence.",
        ],
        SchemaKind::Classification => &[
            "confidence_scores maps each considered category to a number between 0 and 1.",
            "secondary_categories lists other plausible categories, best first.",
            "reasoning cites the words that drove the decision.",
        ],
        SchemaKind::Qna => &[
            "answer_type is \"direct\" when the answer is stated, \"inferred\" when it follows from the text.",
            "source_evidence quotes the supporting sentences.",
            "follow_up_questions holds at most three questions.",
        ],
        SchemaKind::Summarization => &[
            "summary is at most five sentences.",
            "key_points holds three to seven short items.",
            "compression_ratio is summary length divided by input length.",
        ],
        SchemaKind::ActionPlan => &[
            "step_number starts at 1 and increases by 1.",
            "dependencies lists the step_number values a step waits for.",
            "total_duration accounts for every step.",
        ],
        SchemaKind::Rag => &[
            "evidence_used quotes the context passages the answer relies on.",
            "answer_status is \"partial\" when the context answers only part of the query.",
            "context_coverage rates how much of the query the context covers.",
        ],
    }
}

fn fallback(schema: SchemaKind) -> &'static str {
    match schema {
        SchemaKind::GenericExtraction => {
            "Return \"entities\": [], set \"extraction_summary\" to \"insufficient_context\" and explain in \"notes\"."
        }
        SchemaKind::Classification => {
            "Set \"primary_category\" to \"insufficient_context\", \"confidence_primary\" to \"low\" and explain in \"uncertainty_notes\"."
        }
        SchemaKind::Qna => {
            "Set \"answer\" to \"insufficient_context\", \"answer_type\" to \"insufficient_context\" and \"confidence\" to \"low\"."
        }
        SchemaKind::Summarization => {
            "Set \"summary\" to \"insufficient_context\", \"key_points\" to [] and \"completeness\" to \"low\"."
        }
        SchemaKind::ActionPlan => {
            "Set \"objective\" to \"insufficient_context\", \"steps\" to [] and \"success_rate\" to \"low\"."
        }
        SchemaKind::Rag => {
            "Set \"answer\" to \"insufficient_context\", \"answer_status\" to \"unable_to_answer\", and both \"confidence\" and \"context_coverage\" to \"low\"."
        }
    }
}

fn render_fields(out: &mut String, specs: &[FieldSpec], depth: usize) {
    let indent = "  ".repeat(depth);
    for spec in specs {
        let presence = if spec.required {
            "required"
        } else if spec.nullable {
            "optional, may be null"
        } else {
            "optional"
        };
        let _ = writeln!(
            out,
            "{indent}- \"{}\" ({}, {presence})",
            spec.name,
            describe(spec.kind)
        );
        if let FieldKind::Objects(nested) = spec.kind {
            render_fields(out, nested, depth + 1);
        }
    }
}

fn describe(kind: FieldKind) -> String {
    match kind {
        FieldKind::Text => "string".to_string(),
        FieldKind::Number => "number".to_string(),
        FieldKind::Integer => "integer".to_string(),
        FieldKind::OneOf(allowed) => allowed
            .iter()
            .map(|v| format!("\"{v}\""))
            .collect::<Vec<_>>()
            .join(" | "),
        FieldKind::TextList => "array of strings".to_string(),
        FieldKind::IntegerList => "array of integers".to_string(),
        FieldKind::NumberMap => "object of string to number".to_string(),
        FieldKind::Objects(_) => "array of objects, each with".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use crate::model::IndexEntry;

    use super::*;

    fn scored(text: &str, score: f32) -> ScoredEntry {
        ScoredEntry {
            score,
            entry: IndexEntry {
                chunk_id: "kb_0".to_string(),
                document_id: "kb".to_string(),
                source_path: "kb/backups.md".to_string(),
                start_offset: 0,
                end_offset: text.chars().count(),
                chunk_text: text.to_string(),
                metadata: BTreeMap::new(),
                embedding: Vec::new(),
            },
        }
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let fields = BTreeMap::from([("team".to_string(), "ops".to_string())]);
        let chunks = vec![scored("Daily backups run at 2 AM UTC.", 0.8123)];
        let input = PromptInput::new("What is the backup schedule?", &fields);
        let a = assemble(SchemaKind::Qna, input, Some(chunks.as_slice()));
        let b = assemble(SchemaKind::Qna, input, Some(chunks.as_slice()));
        assert_eq!(a, b);
        assert!(a.contains("[1] source: kb/backups.md | score: 0.812\nDaily backups run at 2 AM UTC."));
        assert!(a.contains("QUERY:\nWhat is the backup schedule?"));
        assert!(a.contains("team: ops"));
    }

    #[test]
    fn empty_context_still_instructs_fallback() {
        let fields = BTreeMap::new();
        let prompt = assemble(
            SchemaKind::Qna,
            PromptInput::new("What is the backup schedule?", &fields),
            Some(&[][..]),
        );
        assert!(prompt.contains("(no context was retrieved)"));
        assert!(prompt.contains(INSUFFICIENT_CONTEXT));
        assert!(prompt.contains("\"answer_type\" to \"insufficient_context\""));
    }

    #[test]
    fn output_format_lists_schema_fields() {
        let fields = BTreeMap::new();
        for kind in SchemaKind::ALL {
            let prompt = assemble(kind, PromptInput::new("q", &fields), None);
            for spec in kind.fields() {
                assert!(prompt.contains(&format!("- \"{}\" (", spec.name)), "{kind}: {}", spec.name);
            }
        }
        let prompt = assemble(SchemaKind::ActionPlan, PromptInput::new("q", &fields), None);
        assert!(prompt.contains("  - \"step_number\" (integer, required)"));
    }

    #[test]
    fn direct_mode_renders_input_object() {
        let fields = BTreeMap::from([("source".to_string(), "email".to_string())]);
        let prompt = assemble(
            SchemaKind::Classification,
            PromptInput::new("Invoice overdue", &fields),
            None,
        );
        assert!(!prompt.contains("CONTEXT:"));
        assert!(prompt.contains("INPUT:\n{\n  \"input\": \"Invoice overdue\",\n  \"source\": \"email\"\n}"));
    }
}
