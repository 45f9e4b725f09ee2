use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ImageClient, ImagePayload};
use crate::utils::retry::{status_error, RetryError, RetryPolicy};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImagenConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_mime_type")]
    pub output_mime_type: String,
}

impl Default for ImagenConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            aspect_ratio: default_aspect_ratio(),
            output_mime_type: default_mime_type(),
        }
    }
}

fn default_model() -> String {
    "imagen-4.0-generate-001".to_string()
}
fn default_aspect_ratio() -> String {
    "4:3".to_string()
}
fn default_mime_type() -> String {
    "image/jpeg".to_string()
}

/// Managed image API (`:predict`), one sample per request.
#[derive(Debug)]
pub struct ImagenClient {
    config: ImagenConfig,
    api_key: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
    rai_filtered_reason: Option<String>,
}

impl ImagenClient {
    pub fn new(config: ImagenConfig, api_key: String, retry: RetryPolicy) -> Self {
        Self {
            config,
            api_key,
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn predict(&self, prompt: &str) -> std::result::Result<ImagePayload, RetryError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:predict",
            self.config.model
        );
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": self.config.aspect_ratio,
                "outputOptions": { "mimeType": self.config.output_mime_type },
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(status_error("Imagen", status, &text));
        }

        Ok(parse_prediction(&text, &self.config.output_mime_type)?)
    }
}

fn parse_prediction(body: &str, fallback_mime: &str) -> Result<ImagePayload> {
    let response: PredictResponse =
        serde_json::from_str(body).context("Failed to parse Imagen response")?;
    let prediction = response
        .predictions
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Imagen returned no images"))?;

    let encoded = match prediction.bytes_base64_encoded {
        Some(data) if !data.is_empty() => data,
        _ => {
            let reason = prediction.rai_filtered_reason.as_deref().unwrap_or("no image bytes");
            return Err(anyhow!("Imagen returned an empty image: {}", reason));
        }
    };
    let bytes = STANDARD.decode(encoded).context("Imagen image bytes are not base64")?;

    Ok(ImagePayload {
        mime_type: prediction.mime_type.unwrap_or_else(|| fallback_mime.to_string()),
        bytes,
    })
}

#[async_trait]
impl ImageClient for ImagenClient {
    async fn generate(&self, prompt: &str) -> Result<ImagePayload> {
        debug!("Imagen prompt: {}", prompt);
        self.retry.run("Imagen", || self.predict(prompt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prediction_success() {
        let body = r#"{"predictions":[{"bytesBase64Encoded":"/9j/4A==","mimeType":"image/png"}]}"#;
        let payload = parse_prediction(body, "image/jpeg").unwrap();
        assert_eq!(payload.mime_type, "image/png");
        assert_eq!(payload.bytes, vec![0xff, 0xd8, 0xff, 0xe0]);
    }

    #[test]
    fn test_parse_prediction_filtered() {
        let body = r#"{"predictions":[{"raiFilteredReason":"blocked"}]}"#;
        let err = parse_prediction(body, "image/jpeg").unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn test_parse_prediction_empty() {
        assert!(parse_prediction("{}", "image/jpeg").is_err());
    }
}
