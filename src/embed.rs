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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::config::EmbeddingBackend;
use crate::config::EmbeddingConfig;
use crate::error::RagError;
use crate::error::Result;
use crate::ollama;
use crate::ollama::OllamaClient;

pub const HASH_MODEL_ID: &str = "hash-v1";

/// Maps text to fixed-dimension vectors. One embedder serves both indexing
/// and querying so all vectors in an index are comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> String;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::unavailable(self.model_id(), "no embedding returned"))
    }
}

pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend {
        EmbeddingBackend::Hash => Ok(Arc::new(HashEmbedder::new(config.dim))),
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaEmbedder::new(config)?)),
    }
}

/// Offline embedder: signed feature hashing over word and character-trigram
/// features.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in tokens(text) {
            let (idx, sign) = hash_feature(&format!("w:{token}"), self.dim);
            vec[idx] += sign;
            let padded: Vec<char> = format!("<{token}>").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let (idx, sign) = hash_feature(&format!("g:{gram}"), self.dim);
                vec[idx] += sign;
            }
        }
        l2_normalize(vec)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> String {
        HASH_MODEL_ID.to_string()
    }

    fn dimensions(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Function words skipped by the hash embedder. Part of the `hash-v1` model:
/// changing the list requires a rebuild.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "were", "what", "when",
    "where", "which", "who", "why", "with",
];

/// Lower-cased alphanumeric tokens, stopwords dropped, trailing plural `s`
/// removed.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|lower| {
            if lower.chars().count() > 3 && lower.ends_with('s') && !lower.ends_with("ss") {
                lower[..lower.len() - 1].to_string()
            } else {
                lower
            }
        })
}

fn hash_feature(feature: &str, dim: usize) -> (usize, f32) {
    let mut hasher = Sha256::new();
    hasher.update(feature.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    let val = u64::from_le_bytes(bytes);
    let idx = (val as usize) % dim;
    let sign = if (val & (1 << 63)) != 0 { 1.0 } else { -1.0 };
    (idx, sign)
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
    dim: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = OllamaClient::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs.max(1)),
        )?;
        Ok(Self {
            client,
            model: config.model.clone(),
            dim: config.dim,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> String {
        format!("{}:{}", ollama::BACKEND, self.model)
    }

    fn dimensions(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, batch_size = texts.len(), "embedding batch");
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let response: EmbedResponse = self
            .client
            .post_json("/api/embed", &request)
            .await
            .map_err(|err| match err {
                RagError::GenerationTimeout { timeout_secs } => RagError::unavailable(
                    ollama::BACKEND,
                    format!("embedding request timed out after {timeout_secs}s"),
                ),
                other => other,
            })?;

        if response.embeddings.len() != texts.len() {
            return Err(RagError::unavailable(
                ollama::BACKEND,
                format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    response.embeddings.len()
                ),
            ));
        }
        if let Some(bad) = response.embeddings.iter().find(|v| v.len() != self.dim) {
            return Err(RagError::Index(format!(
                "model {} returned dimension {}, configured embedding.dim is {}",
                self.model,
                bad.len(),
                self.dim
            )));
        }
        Ok(response.embeddings.into_iter().map(l2_normalize).collect())
    }
}

pub fn l2_normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let norm = vec.iter().map(|v| v * v).sum::<f32>();
    if norm > 0.0 {
        let inv = 1.0 / norm.sqrt();
        for v in &mut vec {
            *v *= inv;
        }
    }
    vec
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn to_bytes(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_text("Daily backups run at 2 AM UTC.");
        let b = embedder.embed_text("Daily backups run at 2 AM UTC.");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_scores_higher_than_unrelated() {
        let embedder = HashEmbedder::new(256);
        let doc = embedder.embed_text("Daily backups run at 2 AM UTC.");
        let related = embedder.embed_text("What is the backup schedule?");
        let unrelated = embedder.embed_text("Quarterly revenue grew in Europe.");
        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
        assert!(cosine_similarity(&doc, &related) > 0.0);
    }

    #[test]
    fn plural_and_case_fold_together() {
        let tokens: Vec<String> = tokens("The Backups, a BACKUP class").collect();
        assert_eq!(tokens, vec!["backup", "backup", "class"]);
    }

    #[test]
    fn stopwords_do_not_contribute() {
        let embedder = HashEmbedder::new(128);
        assert_eq!(
            embedder.embed_text("what is the backup schedule"),
            embedder.embed_text("backup schedule")
        );
        assert!(embedder.embed_text("the of and").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn bytes_round_trip() {
        let vec = vec![0.25f32, -1.5, 3.0];
        assert_eq!(from_bytes(&to_bytes(&vec)), vec);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    fn ollama_config(base_url: String, dim: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            backend: EmbeddingBackend::Ollama,
            model: "gte-large".to_string(),
            dim,
            base_url,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn ollama_embedder_batches_and_normalizes() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gte-large",
                "embeddings": [[3.0, 4.0], [0.0, 2.0]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&ollama_config(server.uri(), 2))?;
        let vectors = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await?;
        let expected = [[0.6f32, 0.8], [0.0, 1.0]];
        assert_eq!(vectors.len(), 2);
        for (got, want) in vectors.iter().zip(expected) {
            for (g, w) in got.iter().zip(want) {
                assert!((g - w).abs() < 1e-6, "{got:?} vs {want:?}");
            }
        }
        assert_eq!(embedder.model_id(), "ollama:gte-large");
        Ok(())
    }

    #[tokio::test]
    async fn ollama_embedder_rejects_wrong_dimension() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": [[1.0, 0.0, 0.0]]})),
            )
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&ollama_config(server.uri(), 2))?;
        let err = embedder.embed("text").await.unwrap_err();
        assert!(matches!(err, RagError::Index(_)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_model_is_rejected() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "model \"gte-large\" not found"})),
            )
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&ollama_config(server.uri(), 2))?;
        let err = embedder.embed("text").await.unwrap_err();
        assert!(matches!(err, RagError::ModelRejected { .. }));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not found"));
        Ok(())
    }

    #[tokio::test]
    async fn overloaded_backend_is_model_unavailable() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&ollama_config(server.uri(), 2))?;
        let err = embedder.embed("text").await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable { .. }));
        assert!(err.is_retryable());
        Ok(())
    }
}
