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

//! Composes the components into the indexing and query pipelines.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::config::RetrievalConfig;
use crate::embed::Embedder;
use crate::error::ErrorKind;
use crate::error::RagError;
use crate::error::Result;
use crate::generate::DecodingConfig;
use crate::generate::Generator;
use crate::generate::RetryPolicy;
use crate::generate::generate_with_retry;
use crate::generate::with_retry;
use crate::model::ContextRef;
use crate::model::Document;
use crate::model::IndexEntry;
use crate::model::RunMode;
use crate::model::ScoredEntry;
use crate::model::Task;
use crate::model::TaskError;
use crate::model::TaskResult;
use crate::prompt;
use crate::prompt::PromptInput;
use crate::schema::SchemaKind;
use crate::store::EmbeddingSignature;
use crate::store::UpsertReport;
use crate::store::VectorIndex;
use crate::validate::validate_output;

const EMBED_BATCH: usize = 32;
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub documents: usize,
    pub chunks: usize,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

impl IndexReport {
    fn add(&mut self, chunks: usize, upsert: UpsertReport) {
        self.documents += 1;
        self.chunks += chunks;
        self.inserted += upsert.inserted;
        self.updated += upsert.updated;
        self.removed += upsert.removed;
    }
}

/// Chunks, embeds and stores documents.
pub struct Indexer {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    retry: RetryPolicy,
}

impl Indexer {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>) -> Self {
        Self {
            chunker,
            embedder,
            index,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn signature(&self) -> EmbeddingSignature {
        EmbeddingSignature {
            model: self.embedder.model_id(),
            dim: self.embedder.dimensions(),
        }
    }

    /// Replaces each document's entries with freshly embedded chunks. Each
    /// document is written in its own transaction.
    pub async fn index_documents(&self, documents: &[Document]) -> Result<IndexReport> {
        let signature = self.signature();
        let mut report = IndexReport::default();
        for document in documents {
            let entries = self.embed_document(document).await?;
            let upsert = self
                .index
                .replace_document(&document.id, &entries, &signature)?;
            debug!(
                source = %document.source_path,
                chunks = entries.len(),
                inserted = upsert.inserted,
                updated = upsert.updated,
                removed = upsert.removed,
                "indexed document"
            );
            report.add(entries.len(), upsert);
        }
        info!(
            documents = report.documents,
            chunks = report.chunks,
            "indexing finished"
        );
        Ok(report)
    }

    /// Embeds every document, then swaps the whole index for the result in
    /// one transaction. A failure before the swap leaves the index as it was.
    /// Rebuilding from no chunks clears the index and its signature.
    pub async fn rebuild(&self, documents: &[Document]) -> Result<IndexReport> {
        let signature = self.signature();
        let mut entries = Vec::new();
        for document in documents {
            entries.extend(self.embed_document(document).await?);
        }
        let mut report = IndexReport::default();
        if entries.is_empty() {
            report.removed = self.index.len();
            self.index.clear()?;
        } else {
            let upsert = self.index.rebuild(&entries, &signature)?;
            report.add(entries.len(), upsert);
        }
        report.documents = documents.len();
        info!(
            documents = report.documents,
            chunks = report.chunks,
            removed = report.removed,
            "index rebuilt"
        );
        Ok(report)
    }

    async fn embed_document(&self, document: &Document) -> Result<Vec<IndexEntry>> {
        let chunks = self.chunker.chunk_document(document);
        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let (vectors, attempts) = with_retry(self.retry, "embedding", || {
                self.embedder.embed_batch(&texts)
            })
            .await;
            let vectors = vectors?;
            if attempts > 1 {
                debug!(source = %document.source_path, attempts, "embedding succeeded after retry");
            }
            for (chunk, embedding) in batch.iter().zip(vectors) {
                entries.push(IndexEntry {
                    chunk_id: chunk.id.clone(),
                    document_id: document.id.clone(),
                    source_path: document.source_path.clone(),
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    chunk_text: chunk.content.clone(),
                    metadata: document.metadata.clone(),
                    embedding,
                });
            }
        }
        Ok(entries)
    }
}

struct Prepared {
    schema: SchemaKind,
    mode: RunMode,
    context: Vec<ScoredEntry>,
    prompt: String,
}

/// Query pipeline: retrieve, assemble, generate, validate.
pub struct Pipeline {
    embedder: Arc<dyn Embedder>,
    index: Option<Arc<VectorIndex>>,
    generator: Arc<dyn Generator>,
    retrieval: RetrievalConfig,
    decoding: DecodingConfig,
    retry: RetryPolicy,
    generation_gate: Arc<Semaphore>,
    default_schema: SchemaKind,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Option<Arc<VectorIndex>>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            retrieval: config.retrieval.clone(),
            decoding: DecodingConfig::from(&config.generation),
            retry: RetryPolicy::from_config(&config.generation),
            generation_gate: Arc::new(Semaphore::new(
                config.batch.generation_concurrency.max(1),
            )),
            default_schema: SchemaKind::default(),
        }
    }

    /// Nearest chunks for `query`; empty without an index.
    pub async fn retrieve(&self, query: &str, top_k: usize, min_score: f32) -> Result<Vec<ScoredEntry>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        index.check_query_model(&self.embedder.model_id())?;
        let (vector, _) =
            with_retry(self.retry, "embedding", || self.embedder.embed(query)).await;
        let vector = vector?;
        index.retrieve(&vector, top_k, min_score)
    }

    /// The prompt `run` would send for `task`.
    pub async fn render_prompt(&self, task: &Task, mode: RunMode) -> Result<String> {
        Ok(self.prepare(task, mode).await?.prompt)
    }

    /// Runs one task. Failures are recorded on the result, never returned.
    pub async fn run(&self, task: &Task, mode: RunMode) -> TaskResult {
        let started = Instant::now();
        let prepared = match self.prepare(task, mode).await {
            Ok(prepared) => prepared,
            Err(err) => {
                let schema = match &err {
                    RagError::UnknownSchema { .. } => None,
                    _ => self.resolve_schema(task).ok(),
                };
                warn!(task_id = %task.task_id, error = %err, "task failed before generation");
                let mut result = empty_result(task, schema, mode);
                result.error = Some(TaskError::from(&err));
                result.latency_ms = elapsed_ms(started);
                return result;
            }
        };

        let mut result = empty_result(task, Some(prepared.schema), prepared.mode);
        result.retrieved_chunk_ids = prepared
            .context
            .iter()
            .map(|c| c.entry.chunk_id.clone())
            .collect();
        result.context = prepared.context.iter().map(context_ref).collect();

        let (outcome, attempts) = {
            let _permit = self.generation_gate.acquire().await.ok();
            generate_with_retry(
                self.generator.as_ref(),
                &prepared.prompt,
                &self.decoding,
                self.retry,
            )
            .await
        };
        result.attempts = attempts;

        match outcome {
            Ok(raw) => {
                let validation = validate_output(prepared.schema, &raw);
                result.raw_model_output = Some(raw);
                result.parsed_json = validation.parsed;
                result.schema_valid = validation.schema_valid;
                result.violations = validation.violations;
                result.confidence = validation.confidence;
            }
            Err(err) => {
                warn!(task_id = %task.task_id, attempts, error = %err, "generation failed");
                result.error = Some(TaskError::from(&err));
            }
        }
        result.latency_ms = elapsed_ms(started);
        debug!(
            task_id = %task.task_id,
            schema = %prepared.schema,
            valid = result.schema_valid,
            latency_ms = result.latency_ms,
            "task finished"
        );
        result
    }

    /// Runs `tasks` with at most `workers` in flight. Returns one result per
    /// task, in input order.
    pub async fn run_batch(self: &Arc<Self>, tasks: &[Task], mode: RunMode, workers: usize) -> Vec<TaskResult> {
        let total = tasks.len();
        info!(tasks = total, workers, mode = mode.as_str(), "batch started");
        let slots_gate = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();
        for (i, task) in tasks.iter().cloned().enumerate() {
            let permit = Arc::clone(&slots_gate).acquire_owned().await.ok();
            let pipeline = Arc::clone(self);
            set.spawn(async move {
                let _permit = permit;
                (i, pipeline.run(&task, mode).await)
            });
        }

        let mut slots: Vec<Option<TaskResult>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, result)) => slots[i] = Some(result),
                Err(err) => error!(error = %err, "batch worker failed"),
            }
        }

        let results: Vec<TaskResult> = slots
            .into_iter()
            .zip(tasks)
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| {
                    let mut result = empty_result(task, self.resolve_schema(task).ok(), mode);
                    result.error = Some(TaskError {
                        kind: ErrorKind::Internal,
                        message: "worker terminated before producing a result".to_string(),
                    });
                    result
                })
            })
            .collect();
        let failed = results.iter().filter(|r| r.is_error()).count();
        info!(tasks = total, failed, "batch finished");
        results
    }

    fn resolve_schema(&self, task: &Task) -> Result<SchemaKind> {
        match task.schema_type.as_deref() {
            Some(name) => name.parse(),
            None => Ok(self.default_schema),
        }
    }

    fn effective_mode(&self, mode: RunMode) -> RunMode {
        if mode == RunMode::Rag && self.index.is_none() {
            warn!("no index available, running in direct mode");
            return RunMode::Direct;
        }
        mode
    }

    async fn prepare(&self, task: &Task, mode: RunMode) -> Result<Prepared> {
        let schema = self.resolve_schema(task)?;
        let mode = self.effective_mode(mode);
        let input = PromptInput::new(&task.input, &task.fields);
        let (context, prompt) = match mode {
            RunMode::Rag => {
                let context = self
                    .retrieve(
                        &task.input,
                        self.retrieval.top_k,
                        self.retrieval.min_similarity_score,
                    )
                    .await?;
                let prompt = prompt::assemble(schema, input, Some(context.as_slice()));
                (context, prompt)
            }
            RunMode::Direct => (Vec::new(), prompt::assemble(schema, input, None)),
        };
        Ok(Prepared {
            schema,
            mode,
            context,
            prompt,
        })
    }
}

fn empty_result(task: &Task, schema: Option<SchemaKind>, mode: RunMode) -> TaskResult {
    TaskResult {
        task_id: task.task_id.clone(),
        schema_type: schema,
        mode,
        query: task.input.clone(),
        raw_model_output: None,
        parsed_json: None,
        schema_valid: false,
        violations: Vec::new(),
        confidence: None,
        retrieved_chunk_ids: Vec::new(),
        context: Vec::new(),
        latency_ms: 0,
        attempts: 0,
        expected: task.expected.clone(),
        error: None,
        created_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
    }
}

fn context_ref(scored: &ScoredEntry) -> ContextRef {
    ContextRef {
        chunk_id: scored.entry.chunk_id.clone(),
        source: scored.entry.source_path.clone(),
        score: scored.score,
        preview: scored.entry.chunk_text.chars().take(PREVIEW_CHARS).collect(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tempfile::tempdir;

    use super::*;
    use crate::embed::HashEmbedder;
    use crate::store::StoreMode;

    const BACKUP_DOC: &str = "Daily backups run at 2 AM UTC.";

    /// Answers from the prompt text, recording every prompt it sees.
    #[derive(Default)]
    struct ScriptedGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        async fn generate(&self, prompt: &str, _decoding: &DecodingConfig) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            if prompt.contains("PANIC") {
                panic!("scripted panic");
            }
            if prompt.contains("UNAVAILABLE") {
                return Err(RagError::config("not retryable"));
            }
            if prompt.contains("2 AM UTC") {
                Ok(r#"Here you go: {"answer": "Backups run daily at 2 AM UTC.", "confidence": "HIGH", "answer_type": "direct"}"#.to_string())
            } else {
                Ok(r#"{"answer": "insufficient_context", "confidence": "low", "answer_type": "insufficient_context"}"#.to_string())
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.retrieval.min_similarity_score = 0.0;
        config.generation.max_retries = 0;
        config
    }

    fn open_index(dir: &TempDir) -> Arc<VectorIndex> {
        let path = dir.path().join("ragkit.db");
        VectorIndex::init(&path).expect("init index");
        Arc::new(VectorIndex::open(&path, StoreMode::ReadWrite).expect("open index"))
    }

    fn document(source: &str, content: &str) -> Document {
        Document {
            id: crate::ingest::document_id(source),
            source_path: source.to_string(),
            content: content.to_string(),
            metadata: BTreeMap::from([("source".to_string(), source.to_string())]),
        }
    }

    fn pipeline(
        index: Option<Arc<VectorIndex>>,
        generator: Arc<ScriptedGenerator>,
    ) -> Arc<Pipeline> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        Arc::new(Pipeline::new(&test_config(), embedder, index, generator))
    }

    #[tokio::test]
    async fn answers_from_indexed_context() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        let indexer = Indexer::new(Chunker::new(900, 200)?, embedder, Arc::clone(&index));
        let report = indexer
            .index_documents(&[document("kb/backups.md", BACKUP_DOC)])
            .await?;
        assert_eq!(report.chunks, 1);

        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(Some(index), Arc::clone(&generator));
        let task = Task::new("t1", "What is the backup schedule?").with_schema("qna");
        let result = pipeline.run(&task, RunMode::Rag).await;

        assert!(result.error.is_none(), "{:?}", result.error);
        assert!(result.schema_valid, "{:?}", result.violations);
        assert_eq!(result.schema_type, Some(SchemaKind::Qna));
        assert!(result.field_str("answer").is_some_and(|a| a.contains("2 AM UTC")));
        assert_eq!(result.field_str("confidence"), Some("high"));
        assert_eq!(result.retrieved_chunk_ids.len(), 1);
        assert_eq!(result.context[0].preview, BACKUP_DOC);
        assert_eq!(result.attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_still_prompts_for_fallback() -> Result<()> {
        let dir = tempdir()?;
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(Some(open_index(&dir)), Arc::clone(&generator));
        let task = Task::new("t1", "What is the backup schedule?").with_schema("qna");
        let result = pipeline.run(&task, RunMode::Rag).await;

        assert!(result.retrieved_chunk_ids.is_empty());
        assert_eq!(result.mode, RunMode::Rag);
        let prompts = generator.prompts.lock();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("(no context was retrieved)"));
        assert!(prompts[0].contains(prompt::INSUFFICIENT_CONTEXT));
        assert_eq!(result.field_str("answer"), Some("insufficient_context"));
        assert!(result.schema_valid);
        Ok(())
    }

    #[tokio::test]
    async fn tasks_without_schema_use_generic_extraction() {
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(None, Arc::clone(&generator));
        let result = pipeline.run(&Task::new("t1", "hello"), RunMode::Direct).await;

        assert_eq!(result.schema_type, Some(SchemaKind::GenericExtraction));
        assert!(generator.prompts.lock()[0].contains("TASK (generic_extraction)"));
    }

    #[tokio::test]
    async fn unknown_schema_yields_error_result() {
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(None, Arc::clone(&generator));
        let task = Task::new("t1", "hello").with_schema("haiku");
        let result = pipeline.run(&task, RunMode::Direct).await;

        assert_eq!(result.schema_type, None);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::UnknownSchema));
        assert!(!result.schema_valid);
        assert!(generator.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_index_degrades_to_direct() {
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(None, Arc::clone(&generator));
        let result = pipeline.run(&Task::new("t1", "hello"), RunMode::Rag).await;
        assert_eq!(result.mode, RunMode::Direct);
        assert!(!generator.prompts.lock()[0].contains("CONTEXT:"));
    }

    #[tokio::test]
    async fn generation_failure_is_recorded() {
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(None, generator);
        let result = pipeline
            .run(&Task::new("t1", "UNAVAILABLE"), RunMode::Direct)
            .await;
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Config));
        assert_eq!(result.schema_type, Some(SchemaKind::GenericExtraction));
        assert!(result.raw_model_output.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_keeps_order_and_survives_failures() {
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = pipeline(None, generator);
        let tasks = vec![
            Task::new("a", "first"),
            Task::new("b", "PANIC"),
            Task::new("c", "third").with_schema("nope"),
            Task::new("d", "UNAVAILABLE"),
            Task::new("e", "fifth").with_schema("rag"),
        ];
        let results = pipeline.run_batch(&tasks, RunMode::Direct, 2).await;

        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error.as_ref().map(|e| e.kind), Some(ErrorKind::Internal));
        assert_eq!(results[2].error.as_ref().map(|e| e.kind), Some(ErrorKind::UnknownSchema));
        assert!(results[3].is_error());
        assert_eq!(results[4].schema_type, Some(SchemaKind::Rag));
        assert!(!results[4].schema_valid);
    }

    struct RenamedEmbedder(HashEmbedder);

    #[async_trait]
    impl Embedder for RenamedEmbedder {
        fn model_id(&self) -> String {
            "other-model".to_string()
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn query_with_other_embedding_model_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        let indexer = Indexer::new(Chunker::new(900, 200)?, embedder, Arc::clone(&index));
        indexer
            .index_documents(&[document("kb/backups.md", BACKUP_DOC)])
            .await?;

        let other: Arc<dyn Embedder> = Arc::new(RenamedEmbedder(HashEmbedder::new(256)));
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = Pipeline::new(&test_config(), other, Some(index), generator);
        let err = pipeline
            .retrieve("backup schedule", 5, 0.0)
            .await
            .expect_err("model mismatch");
        assert_eq!(err.kind(), ErrorKind::Index);
        Ok(())
    }

    /// Fails the first `failures` calls with a retryable error.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        failures: u32,
        calls: Mutex<u32>,
    }

    impl FlakyEmbedder {
        fn new(failures: u32) -> Self {
            Self {
                inner: HashEmbedder::new(256),
                failures,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_id(&self) -> String {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            if call <= self.failures {
                return Err(RagError::unavailable("flaky", "connection reset"));
            }
            self.inner.embed_batch(texts).await
        }
    }

    fn retrying_config() -> Config {
        let mut config = test_config();
        config.generation.max_retries = 2;
        config.generation.retry_backoff_ms = 1;
        config
    }

    #[tokio::test]
    async fn embedding_calls_are_retried() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let retry = RetryPolicy::from_config(&retrying_config().generation);

        let flaky = Arc::new(FlakyEmbedder::new(1));
        let indexer = Indexer::new(Chunker::new(900, 200)?, flaky.clone(), Arc::clone(&index))
            .with_retry(retry);
        let report = indexer
            .index_documents(&[document("kb/backups.md", BACKUP_DOC)])
            .await?;
        assert_eq!(report.chunks, 1);
        assert_eq!(flaky.calls(), 2);

        let flaky = Arc::new(FlakyEmbedder::new(2));
        let generator = Arc::new(ScriptedGenerator::default());
        let pipeline = Pipeline::new(&retrying_config(), flaky.clone(), Some(index), generator);
        let hits = pipeline.retrieve("backup schedule", 5, 0.0).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(flaky.calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn embedding_retries_are_bounded() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let flaky = Arc::new(FlakyEmbedder::new(u32::MAX));
        let indexer = Indexer::new(Chunker::new(900, 200)?, flaky.clone(), Arc::clone(&index))
            .with_retry(RetryPolicy::from_config(&retrying_config().generation));
        let err = indexer
            .rebuild(&[document("kb/backups.md", BACKUP_DOC)])
            .await
            .expect_err("embedder never recovers");
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(flaky.calls(), 3);
        assert_eq!(index.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_from_nothing_clears_index() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let indexer = Indexer::new(Chunker::new(900, 200)?, embedder, Arc::clone(&index));
        indexer
            .index_documents(&[document("kb/backups.md", BACKUP_DOC)])
            .await?;
        assert!(index.stats().embedding.is_some());

        let report = indexer.rebuild(&[]).await?;
        assert_eq!(report.removed, 1);
        assert_eq!(index.len(), 0);
        assert!(index.stats().embedding.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reindexing_replaces_document_entries() -> Result<()> {
        let dir = tempdir()?;
        let index = open_index(&dir);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let indexer = Indexer::new(Chunker::new(40, 10)?, embedder, Arc::clone(&index));
        let long = "Backups run nightly. ".repeat(10);
        indexer.index_documents(&[document("kb/a.md", &long)]).await?;
        let before = index.len();
        assert!(before > 1);

        let report = indexer
            .index_documents(&[document("kb/a.md", BACKUP_DOC)])
            .await?;
        assert_eq!(index.len(), 1);
        assert_eq!(report.removed, before - 1);
        Ok(())
    }
}
