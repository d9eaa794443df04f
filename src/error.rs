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

//! Error taxonomy shared by the pipeline components.
//!
//! Components return [`Result`]; the command layer wraps these in
//! `anyhow::Error`. Task-level failures are folded into a `TaskResult`
//! through [`RagError::kind`] instead of aborting a batch.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model unavailable ({backend}): {message}")]
    ModelUnavailable { backend: String, message: String },

    #[error("model request rejected ({backend}): {message}")]
    ModelRejected { backend: String, message: String },

    #[error("generation timed out after {timeout_secs}s")]
    GenerationTimeout { timeout_secs: u64 },

    #[error("unknown schema '{name}'; available: {available}")]
    UnknownSchema { name: String, available: String },

    #[error("vector index error: {0}")]
    Index(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Stable, serializable classification of a [`RagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    ModelUnavailable,
    ModelRejected,
    GenerationTimeout,
    UnknownSchema,
    Index,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ModelRejected => "model_rejected",
            ErrorKind::GenerationTimeout => "generation_timeout",
            ErrorKind::UnknownSchema => "unknown_schema",
            ErrorKind::Index => "index",
            ErrorKind::Internal => "internal",
        }
    }
}

impl RagError {
    pub fn config(message: impl Into<String>) -> Self {
        RagError::Config(message.into())
    }

    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        RagError::ModelUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Config(_) => ErrorKind::Config,
            RagError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            RagError::ModelRejected { .. } => ErrorKind::ModelRejected,
            RagError::GenerationTimeout { .. } => ErrorKind::GenerationTimeout,
            RagError::UnknownSchema { .. } => ErrorKind::UnknownSchema,
            RagError::Index(_) | RagError::Sqlite(_) => ErrorKind::Index,
            RagError::Io(_) | RagError::Json(_) | RagError::Csv(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt against the same backend may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::ModelUnavailable { .. } | RagError::GenerationTimeout { .. }
        )
    }
}
