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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::ollama;
use crate::ollama::OllamaClient;

/// Decoding parameters sent with every generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub num_ctx: u32,
    pub json_mode: bool,
}

impl From<&GenerationConfig> for DecodingConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_tokens: config.max_tokens,
            num_ctx: config.num_ctx,
            json_mode: config.json_mode,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> String;

    /// Raw model text for `prompt`.
    async fn generate(&self, prompt: &str, decoding: &DecodingConfig) -> Result<String>;
}

/// Bounded retry for backend calls. The default makes a single attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling up to 8x.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(3);
        self.backoff * factor
    }
}

/// Runs `op`, retrying retryable failures per `policy`. Returns the final
/// outcome and the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    backend: &str,
    mut op: F,
) -> (Result<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    backend,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

/// Calls `generator` under `policy`.
pub async fn generate_with_retry(
    generator: &dyn Generator,
    prompt: &str,
    decoding: &DecodingConfig,
    policy: RetryPolicy,
) -> (Result<String>, u32) {
    let name = generator.name();
    with_retry(policy, &name, || generator.generate(prompt, decoding)).await
}

pub fn build_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(OllamaGenerator::new(config)?))
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    num_predict: u32,
    num_ctx: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaGenerator {
    client: OllamaClient,
    model: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = OllamaClient::new(&config.base_url, Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }

    /// Overrides the per-call timeout.
    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = OllamaClient::new(self.client.base_url(), timeout)?;
        Ok(self)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> String {
        format!("{}:{}", ollama::BACKEND, self.model)
    }

    async fn generate(&self, prompt: &str, decoding: &DecodingConfig) -> Result<String> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "generate");
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: decoding.json_mode.then_some("json"),
            options: GenerateOptions {
                temperature: decoding.temperature,
                top_p: decoding.top_p,
                top_k: decoding.top_k,
                num_predict: decoding.max_tokens,
                num_ctx: decoding.num_ctx,
            },
        };
        let response: GenerateResponse = self.client.post_json("/api/generate", &request).await?;
        Ok(response.response)
    }
}
