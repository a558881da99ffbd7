use super::{Engine, EngineError, EngineFactory, TextStream};
use crate::params::GenerationParameters;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "gemma2:2b";

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
struct OllamaOptions {
    temperature: f32,
    top_k: i32,
    num_predict: i32,
}

impl From<&GenerationParameters> for OllamaOptions {
    fn from(params: &GenerationParameters) -> Self {
        Self {
            temperature: params.temperature,
            top_k: params.top_k,
            num_predict: params.max_output_tokens,
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<i32>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

/// Splits a newline-delimited JSON byte stream into response fragments.
///
/// Bytes may arrive cut anywhere, including inside a UTF-8 sequence, so
/// complete lines are only decoded once their newline has been seen.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the non-empty fragments it completed, in order
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, EngineError> {
        self.buf.extend_from_slice(chunk);
        let mut fragments = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(fragment) = decode_line(&line)? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }

    /// Decode whatever is left once the byte stream ends
    pub fn finish(&mut self) -> Result<Option<String>, EngineError> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<String>, EngineError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| EngineError::InvalidResponse(format!("stream is not UTF-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaResponse =
        serde_json::from_str(text).map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(EngineError::Backend(error));
    }
    if chunk.response.is_empty() {
        Ok(None)
    } else {
        Ok(Some(chunk.response))
    }
}

fn map_send_error(base_url: &str, err: reqwest::Error) -> EngineError {
    if err.is_connect() || err.is_timeout() {
        EngineError::Unavailable(format!(
            "Ollama is not reachable at {}. Make sure Ollama is running with: ollama serve",
            base_url
        ))
    } else {
        EngineError::Backend(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<OllamaResponse>(&body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or(body);
    Err(EngineError::Backend(format!(
        "Ollama request failed with status {}: {}",
        status, detail
    )))
}

/// Generation engine backed by a local Ollama server
#[derive(Clone)]
pub struct OllamaEngine {
    client: Client,
    base_url: String,
    model: String,
    options: OllamaOptions,
}

impl OllamaEngine {
    pub fn new(base_url: &str, model: &str, params: &GenerationParameters) -> Self {
        Self::with_client(Client::new(), base_url, model, params)
    }

    fn with_client(client: Client, base_url: &str, model: &str, params: &GenerationParameters) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            options: params.into(),
        }
    }

    async fn post_generate(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream,
            options: Some(self.options),
            keep_alive: None,
        };

        debug!(model = %self.model, stream, prompt_len = prompt.len(), "sending generate request");
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(&self.base_url, e))?;
        check_status(response).await
    }
}

#[async_trait]
impl Engine for OllamaEngine {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate_once(&self, prompt: &str) -> Result<String, EngineError> {
        let response = self.post_generate(prompt, false).await?;
        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
        match body.error {
            Some(error) => Err(EngineError::Backend(error)),
            None => Ok(body.response),
        }
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, EngineError> {
        let response = self.post_generate(prompt, true).await?;
        let base_url = self.base_url.clone();

        let stream = async_stream::stream! {
            let mut bytes = response.bytes_stream();
            let mut decoder = NdjsonDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let decoded = match chunk {
                    Ok(chunk) => decoder.push(&chunk),
                    Err(e) => Err(map_send_error(&base_url, e)),
                };
                match decoded {
                    Ok(fragments) => {
                        for fragment in fragments {
                            yield Ok(fragment);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            match decoder.finish() {
                Ok(Some(fragment)) => {
                    yield Ok(fragment);
                }
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn release(&self) {
        // keep_alive 0 asks the server to unload the model right away
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaRequest {
            model: &self.model,
            prompt: "",
            stream: false,
            options: None,
            keep_alive: Some(0),
        };
        match self.client.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(model = %self.model, "model unloaded");
            }
            Ok(response) => {
                warn!(model = %self.model, status = %response.status(), "model unload rejected");
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "model unload failed");
            }
        }
    }
}

/// Builds [`OllamaEngine`] handles for one server and model
#[derive(Clone)]
pub struct OllamaFactory {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaFactory {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_send_error(&self.base_url, e))?;
        let response = check_status(response).await?;

        let models_response: OllamaModelsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
        Ok(models_response
            .models
            .into_iter()
            .map(|model| model.name)
            .collect())
    }

    pub async fn has_model(&self, name: &str) -> Result<bool, EngineError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m == name))
    }
}

impl EngineFactory for OllamaFactory {
    fn initialize(&self, params: &GenerationParameters) -> Result<Arc<dyn Engine>, EngineError> {
        if self.model.trim().is_empty() {
            return Err(EngineError::Config("no model configured".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(EngineError::Config(format!(
                "server URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        debug!(
            model = %self.model,
            temperature = params.temperature,
            top_k = params.top_k,
            max_output_tokens = params.max_output_tokens,
            "initializing Ollama engine"
        );
        Ok(Arc::new(OllamaEngine::with_client(
            self.client.clone(),
            &self.base_url,
            &self.model,
            params,
        )))
    }
}
