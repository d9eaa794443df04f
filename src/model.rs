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

//! Shared domain types used across indexing, querying, and evaluation.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorKind;
use crate::error::RagError;
use crate::schema::SchemaKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub source_path: String,
    pub content: String,
    pub metadata: BTreeMap<String, String>,
}

/// A window of a document. Offsets count characters, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub chunk_text: String,
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntry {
    pub score: f32,
    #[serde(flatten)]
    pub entry: IndexEntry,
}

/// One unit of work for the query pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub input: String,
    /// Unresolved schema name; falls back to the run's default.
    #[serde(default, alias = "task_type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    /// Ground truth: a class label or a reference text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            input: input.into(),
            schema_type: None,
            fields: BTreeMap::new(),
            expected: None,
        }
    }

    pub fn with_schema(mut self, schema_type: impl Into<String>) -> Self {
        self.schema_type = Some(schema_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Rag,
    Direct,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Rag => "rag",
            RunMode::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub const ALL: [ConfidenceLevel; 3] = [
        ConfidenceLevel::High,
        ConfidenceLevel::Medium,
        ConfidenceLevel::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "high" => Some(ConfidenceLevel::High),
            "medium" => Some(ConfidenceLevel::Medium),
            "low" => Some(ConfidenceLevel::Low),
            _ => None,
        }
    }

    /// Buckets a numeric score in `[0, 1]`.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RagError> for TaskError {
    fn from(err: &RagError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub chunk_id: String,
    pub source: String,
    pub score: f32,
    pub preview: String,
}

/// Outcome of one task. Exactly one is produced per [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    /// `None` only when the requested schema did not resolve.
    pub schema_type: Option<SchemaKind>,
    pub mode: RunMode,
    pub query: String,
    pub raw_model_output: Option<String>,
    pub parsed_json: Option<Value>,
    pub schema_valid: bool,
    #[serde(default)]
    pub violations: Vec<String>,
    pub confidence: Option<ConfidenceLevel>,
    #[serde(default)]
    pub retrieved_chunk_ids: Vec<String>,
    #[serde(default)]
    pub context: Vec<ContextRef>,
    pub latency_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub expected: Option<String>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub created_at: String,
}

impl TaskResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Reads a top-level string field of the parsed output.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.parsed_json.as_ref()?.get(name)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_buckets_follow_thresholds() {
        assert_eq!(ConfidenceLevel::from_score(0.95), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.8), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.5), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.49), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::parse(" High "), Some(ConfidenceLevel::High));
        assert_eq!(ConfidenceLevel::parse("certain"), None);
    }

    #[test]
    fn task_accepts_task_type_alias() {
        let task: Task =
            serde_json::from_str(r#"{"task_id":"t1","input":"hi","task_type":"qna"}"#)
                .expect("parse task");
        assert_eq!(task.schema_type.as_deref(), Some("qna"));
        assert!(task.fields.is_empty());
    }
}
