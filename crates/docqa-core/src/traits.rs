use async_trait::async_trait;

use crate::error::Result;

pub trait Embedder: Send + Sync {
    /// Stable identifier for the provider/model (e.g. `local:minilm:d384`).
    fn embedder_id(&self) -> &str;
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], declared_filename: &str) -> Result<String>;
}

/// API credentials handed to the synthesizer on every call.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub context: &'a [String],
    pub temperature: f32,
}

#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>, credentials: &Credentials) -> Result<String>;
}
