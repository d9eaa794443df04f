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

//! Project configuration.
//!
//! Values are layered: built-in defaults, then `ragkit.toml` at the project
//! root, then `RAGKIT_*` environment variables (`__` separates sections, e.g.
//! `RAGKIT_GENERATION__MODEL=llama3.2`). The resulting [`Config`] is
//! immutable and handed to each component at construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use figment::Figment;
use figment::providers::Env;
use figment::providers::Format;
use figment::providers::Serialized;
use figment::providers::Toml;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RagError;

pub const CONFIG_FILE: &str = "ragkit.toml";
pub const ENV_PREFIX: &str = "RAGKIT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: PathBuf,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive windows; must be below `chunk_size`.
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity_score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Hash,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Model name for the `ollama` backend.
    pub model: String,
    pub dim: usize,
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub num_ctx: u32,
    pub json_mode: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    pub generation_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub modules: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("ragkit.db"),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 900,
            chunk_overlap: 200,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity_score: 0.3,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            model: "gte-large".to_string(),
            dim: 256,
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
            num_ctx: 4096,
            json_mode: true,
            timeout_secs: 120,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            generation_concurrency: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
            modules: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Layers defaults, `config_file` (when present) and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(RagError::config("chunking.chunk_size must be greater than 0"));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(RagError::config(format!(
                "chunking.chunk_overlap ({}) must be less than chunking.chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::config("retrieval.top_k must be greater than 0"));
        }
        let min_score = self.retrieval.min_similarity_score;
        if !(-1.0..=1.0).contains(&min_score) {
            return Err(RagError::config(format!(
                "retrieval.min_similarity_score ({min_score}) must be within [-1, 1]"
            )));
        }
        if self.embedding.dim == 0 {
            return Err(RagError::config("embedding.dim must be greater than 0"));
        }
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            return Err(RagError::config(format!(
                "generation.temperature ({}) must be within [0, 2]",
                generation.temperature
            )));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(RagError::config(format!(
                "generation.top_p ({}) must be within (0, 1]",
                generation.top_p
            )));
        }
        if generation.max_tokens == 0 {
            return Err(RagError::config("generation.max_tokens must be greater than 0"));
        }
        if generation.timeout_secs == 0 {
            return Err(RagError::config("generation.timeout_secs must be greater than 0"));
        }
        if self.batch.workers == 0 || self.batch.generation_concurrency == 0 {
            return Err(RagError::config(
                "batch.workers and batch.generation_concurrency must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigCtx {
    pub root: PathBuf,
    pub config: Config,
    /// False when no `ragkit.toml` was found and defaults are in use.
    pub project: bool,
}

impl ConfigCtx {
    /// Loads the enclosing project; fails outside one.
    pub fn load_from_cwd() -> Result<Self> {
        let cwd = std::env::current_dir().context("get current dir")?;
        Self::load_from(&cwd)
    }

    pub fn load_from(start: &Path) -> Result<Self> {
        let root = find_project_root(start)
            .ok_or_else(|| anyhow::anyhow!("project not found; run `ragkit init` first"))?;
        let config = Config::load(Some(&root.join(CONFIG_FILE)))?;
        Ok(Self {
            root,
            config,
            project: true,
        })
    }

    /// Like [`ConfigCtx::load_from_cwd`], but falls back to defaults plus
    /// environment when no project encloses the working directory.
    pub fn discover_from_cwd() -> Result<Self> {
        let cwd = std::env::current_dir().context("get current dir")?;
        match find_project_root(&cwd) {
            Some(_) => Self::load_from(&cwd),
            None => Ok(Self {
                root: cwd,
                config: Config::load(None)?,
                project: false,
            }),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        if self.config.store_path.is_absolute() {
            self.config.store_path.clone()
        } else {
            self.root.join(&self.config.store_path)
        }
    }
}

pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut cur = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    loop {
        if cur.join(CONFIG_FILE).is_file() {
            return Some(cur);
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => return None,
        }
    }
}

pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    let text = toml::to_string_pretty(config).context("serialize config")?;
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
