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

//! Minimal JSON-over-HTTP client for a local Ollama server.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::error;

use crate::error::RagError;
use crate::error::Result;

pub const BACKEND: &str = "ollama";

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::config(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    #[cfg(test)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POSTs `body` to `path`. A timeout maps to
    /// [`RagError::GenerationTimeout`], a client error status to
    /// [`RagError::ModelRejected`], and every other transport or status
    /// failure to [`RagError::ModelUnavailable`].
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(backend = BACKEND, %url, "request");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            error!(backend = BACKEND, %url, %status, "backend error");
            return Err(status_error(status, format!("{url} returned {status}: {detail}")));
        }

        response.json::<R>().await.map_err(|e| {
            if e.is_timeout() {
                return self.timeout_error();
            }
            error!(backend = BACKEND, %url, error = %e, "failed to parse response");
            RagError::unavailable(BACKEND, format!("invalid response from {url}: {e}"))
        })
    }

    fn transport_error(&self, url: &str, err: reqwest::Error) -> RagError {
        if err.is_timeout() {
            error!(backend = BACKEND, %url, "request timed out");
            return self.timeout_error();
        }
        error!(backend = BACKEND, %url, error = %err, "request failed");
        RagError::unavailable(BACKEND, format!("request to {url} failed: {err}"))
    }

    fn timeout_error(&self) -> RagError {
        RagError::GenerationTimeout {
            timeout_secs: self.timeout.as_secs().max(1),
        }
    }
}

/// Client errors other than 408 and 429 will not succeed on retry.
fn status_error(status: StatusCode, message: String) -> RagError {
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable || !status.is_client_error() {
        RagError::unavailable(BACKEND, message)
    } else {
        RagError::ModelRejected {
            backend: BACKEND.to_string(),
            message,
        }
    }
}
