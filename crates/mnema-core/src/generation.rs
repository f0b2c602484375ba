//! Text-generation seam.
//!
//! Resynthesis and reference resolution call a [`GenerationService`] for the
//! actual prose. The default OpenRouter backend is OpenAI-compatible;
//! callers gather graph context first and hand it over in the prompt, so the
//! backend reasons over grounded material and the graph stays the source of
//! truth. The mock backend keeps the whole pipeline runnable offline.
//!
//! API key: `MNEMA_GENERATION_API_KEY` or `OPENROUTER_API_KEY` in `.env`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Prompt in, prose out. Callers map failures onto their own deferral
    /// handling.
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;

    /// Backend description for logs and status surfaces.
    fn describe(&self) -> String;
}

// OpenAI-compatible request/response for OpenRouter
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// OpenRouter-backed generation.
pub struct OpenRouterGeneration {
    api_key: String,
    model: String,
    api_base: String,
    client: reqwest::Client,
}

impl OpenRouterGeneration {
    /// Create a backend using the API key from the environment. Returns
    /// `None` when no key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("MNEMA_GENERATION_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        let key = api_key?.trim().to_string();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key))
    }

    /// Create a backend with an explicit API key.
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key: api_key.trim().to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_base: OPENROUTER_API_BASE.to_string(),
            client,
        }
    }

    /// Set the model (e.g. `meta-llama/llama-3.3-70b-instruct`).
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl GenerationService for OpenRouterGeneration {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(0.4),
            max_tokens: Some(1024),
        };

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://mnema.local")
            .header("X-Title", "Mnema-Memory-Substrate")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("generation request failed: {}", e))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("generation API error {}: {}", status, body).into());
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| format!("generation response parse failed: {}", e))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err("generation returned an empty completion".into());
        }
        Ok(text)
    }

    fn describe(&self) -> String {
        format!("openrouter ({})", self.model)
    }
}

/// Offline backend returning a fixed response. Keeps the scheduler and
/// resynthesis paths exercisable without a network or key.
pub struct MockGeneration {
    response: String,
}

impl Default for MockGeneration {
    fn default() -> Self {
        Self {
            response: "The pattern connecting these entries holds steady: what began as a \
                       single note now reads as part of a larger arc, and the surrounding \
                       context deepens the original claim rather than replacing it."
                .to_string(),
        }
    }
}

impl MockGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl GenerationService for MockGeneration {
    async fn generate(
        &self,
        _system: &str,
        _prompt: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.response.clone())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Build the generation backend named by the config. An `openrouter` mode
/// without a key falls back to the mock backend with a warning, so nothing
/// downstream has to handle a missing backend.
pub fn create_generation_service(config: &GenerationConfig) -> Arc<dyn GenerationService> {
    match config.mode.as_str() {
        "openrouter" => match OpenRouterGeneration::from_env() {
            Some(mut backend) => {
                if let Some(model) = &config.model {
                    backend = backend.with_model(model);
                }
                if let Some(api_base) = &config.api_base {
                    backend = backend.with_api_base(api_base);
                }
                tracing::info!(
                    target: "mnema::generation",
                    backend = backend.describe(),
                    "generation backend ready"
                );
                Arc::new(backend)
            }
            None => {
                tracing::warn!(
                    target: "mnema::generation",
                    "openrouter mode requested but no API key found, using mock backend"
                );
                Arc::new(MockGeneration::new())
            }
        },
        "mock" => Arc::new(MockGeneration::new()),
        other => {
            tracing::warn!(
                target: "mnema::generation",
                mode = other,
                "unknown generation mode, using mock backend"
            );
            Arc::new(MockGeneration::new())
        }
    }
}
