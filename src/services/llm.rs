use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;

use crate::core::config::{resolve_secret, Config};
use crate::core::error::{StoryError, StoryResult};
use crate::utils::retry::{status_error, RetryError, RetryPolicy};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default)]
    pub retry: RetryPolicy,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            retry: RetryPolicy::default(),
            gemini: None,
            ollama: None,
            openai: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

/// Text-generation service that answers with JSON shaped by `schema`
/// (a JSON Schema object).
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate_json(&self, system: &str, user: &str, schema: &Value) -> Result<String>;
}

pub fn create_llm(config: &Config) -> StoryResult<Box<dyn LlmClient>> {
    let retry = config.llm.retry.clone();
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.clone().unwrap_or_else(|| GeminiConfig {
                api_key: None,
                model: default_gemini_model(),
            });
            let api_key = resolve_secret(
                cfg.api_key.as_deref(),
                &["GEMINI_API_KEY", "API_KEY"],
                "text-generation API key",
            )?;
            Ok(Box::new(GeminiClient::new(&api_key, &cfg.model, retry)))
        }
        "ollama" => {
            let cfg = config
                .llm
                .ollama
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("Ollama config missing".into()))?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model, retry)))
        }
        "openai" => {
            let cfg = config
                .llm
                .openai
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("OpenAI config missing".into()))?;
            let api_key = resolve_secret(cfg.api_key.as_deref(), &["OPENAI_API_KEY"], "OpenAI API key")?;
            Ok(Box::new(OpenAIClient::new(&api_key, &cfg.model, cfg.base_url.as_deref(), retry)))
        }
        other => Err(StoryError::Configuration(format!("Unknown LLM provider: {}", other))),
    }
}

/// Gemini spells schema types in upper case.
fn to_gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = match (k.as_str(), v) {
                        ("type", Value::String(t)) => Value::String(t.to_uppercase()),
                        ("properties", Value::Object(props)) => Value::Object(
                            props.iter().map(|(name, p)| (name.clone(), to_gemini_schema(p))).collect(),
                        ),
                        _ => to_gemini_schema(v),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(to_gemini_schema).collect()),
        other => other.clone(),
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, retry: RetryPolicy) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, request_body: &GeminiRequest) -> std::result::Result<String, RetryError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request_body)
            .send()
            .await?;

        let status = resp.status();
        let response_text = resp.text().await?;
        if !status.is_success() {
            return Err(status_error("Gemini", status, &response_text));
        }

        Ok(extract_gemini_text(&response_text)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
    response_schema: Value,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn extract_gemini_text(response_text: &str) -> Result<String> {
    let result: GeminiResponse = serde_json::from_str(response_text)
        .with_context(|| format!("Failed to parse Gemini response. Body: {}", response_text))?;

    if let Some(err) = result.error {
        return Err(anyhow!("Gemini API returned error: {}", err.message));
    }

    if let Some(first) = result.candidates.as_ref().and_then(|c| c.first()) {
        if let Some(content) = &first.content {
            let text: String = content.parts.iter().map(|p| p.text.as_str()).collect();
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
    }

    Err(anyhow!("Gemini response format unexpected or empty. Body: {}", response_text))
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate_json(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: to_gemini_schema(schema),
            },
        };

        debug!("Requesting structured output from Gemini model {}", self.model);
        self.retry.run("Gemini", || self.call(&request_body)).await
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, request_body: &OllamaRequest) -> std::result::Result<String, RetryError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self.client.post(&url).json(request_body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(status_error("Ollama", status, &error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: Value,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate_json(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user.to_string() },
            ],
            stream: false,
            format: schema.clone(),
        };

        self.retry.run("Ollama", || self.call(&request_body)).await
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>, retry: RetryPolicy) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.unwrap_or("https://api.openai.com/v1").trim_end_matches('/').to_string(),
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, request_body: &Value) -> std::result::Result<String, RetryError> {
        let url = format!("{}/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(status_error("OpenAI", status, &error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RetryError::Permanent(anyhow!("OpenAI response empty or missing content")))
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn generate_json(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let request_body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "story", "schema": schema },
            },
        });

        self.retry.run("OpenAI", || self.call(&request_body)).await
    }
}
