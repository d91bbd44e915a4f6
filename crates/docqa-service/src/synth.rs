//! Answer synthesis through an OpenAI-compatible chat completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use docqa_core::config::GenerationSettings;
use docqa_core::traits::{AnswerSynthesizer, Credentials, GenerationRequest};
use docqa_core::{Error, Result};

/// Question-answering prompt: retrieved passages first, then the question.
pub fn build_prompt(question: &str, context: &[String]) -> String {
    format!(
        "Context information is below.\n\
         ---------------------\n\
         {}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {question}\n\
         Answer: ",
        context.join("\n\n")
    )
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Holds one pooled HTTP client for the lifetime of the service.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiSynthesizer {
    pub fn new(settings: &GenerationSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url: settings.base_url.clone(), model: settings.model.clone() })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AnswerSynthesizer for OpenAiSynthesizer {
    async fn generate(&self, request: &GenerationRequest<'_>, credentials: &Credentials) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: build_prompt(request.question, request.context),
            }],
            temperature: request.temperature,
        };
        debug!(model = %self.model, temperature = request.temperature, passages = request.context.len(), "requesting answer");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&credentials.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("Failed to call chat API: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("Chat API returned {status}: {body}")));
        }

        let parsed: ChatResponse =
            resp.json().await.map_err(|e| Error::Generation(format!("Malformed chat API response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Generation("Chat API returned an empty answer".to_string()))
    }
}
