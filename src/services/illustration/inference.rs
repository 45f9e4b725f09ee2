use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ImageClient, ImagePayload};
use crate::utils::retry::{status_error, RetryError, RetryPolicy};

/// A hosted text-to-image model that answers with raw image bytes and may
/// report 503 while the model is still loading.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InferenceConfig {
    pub api_key: Option<String>,
    pub url: String,
}

#[derive(Debug)]
pub struct InferenceClient {
    config: InferenceConfig,
    api_key: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig, api_key: String, retry: RetryPolicy) -> Self {
        Self {
            config,
            api_key,
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn infer(&self, prompt: &str) -> std::result::Result<ImagePayload, RetryError> {
        let resp = self
            .client
            .post(&self.config.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "image/jpeg")
            .json(&json!({ "inputs": prompt }))
            .send()
            .await?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;
        classify_response(status, content_type.as_deref(), &body)
    }
}

/// Decides what one reply means: an image, a model still warming up, or a
/// final failure.
pub fn classify_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> std::result::Result<ImagePayload, RetryError> {
    if !status.is_success() {
        return Err(status_error("Inference endpoint", status, &String::from_utf8_lossy(body)));
    }

    let mime_type = content_type.unwrap_or("image/jpeg").to_string();
    if mime_type.starts_with("application/json") {
        return Err(RetryError::Permanent(anyhow!(
            "Inference endpoint answered JSON instead of an image: {}",
            String::from_utf8_lossy(body)
        )));
    }
    if body.is_empty() {
        return Err(RetryError::Permanent(anyhow!("Inference endpoint returned an empty image")));
    }
    Ok(ImagePayload {
        mime_type,
        bytes: body.to_vec(),
    })
}

#[async_trait]
impl ImageClient for InferenceClient {
    async fn generate(&self, prompt: &str) -> Result<ImagePayload> {
        debug!("Inference prompt: {}", prompt);
        self.retry.run("Inference endpoint", || self.infer(prompt)).await
    }
}
