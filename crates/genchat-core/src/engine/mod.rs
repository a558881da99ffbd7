//! Boundary to the text generation engine.
//!
//! The session only ever talks to `dyn Engine`, created through an injected
//! [`EngineFactory`], so front ends and tests can swap the backend freely.

pub mod ollama;

pub use ollama::{NdjsonDecoder, OllamaEngine, OllamaFactory};

use crate::params::GenerationParameters;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Backend(String),
    #[error("invalid response from engine: {0}")]
    InvalidResponse(String),
    #[error("invalid engine configuration: {0}")]
    Config(String),
}

/// Ordered text deltas for one request. Ends after the last delta or the first error.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Generate the whole response in one call
    async fn generate_once(&self, prompt: &str) -> Result<String, EngineError>;

    /// Start a generation whose text arrives incrementally
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, EngineError>;

    /// Free whatever the engine holds. Called once, when the handle is replaced
    /// or the session shuts down.
    async fn release(&self) {}
}

/// Creates engine handles configured with the given parameters
pub trait EngineFactory: Send + Sync {
    fn initialize(&self, params: &GenerationParameters) -> Result<Arc<dyn Engine>, EngineError>;
}
