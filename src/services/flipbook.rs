use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{error, info};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::core::config::{resolve_secret, Config};
use crate::core::error::{StoryError, StoryResult};
use crate::core::model::FlipbookResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FlipbookConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    #[serde(default = "default_logo_remove")]
    pub logo_remove: bool,
}

impl Default for FlipbookConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            background_color: default_background_color(),
            logo_remove: default_logo_remove(),
        }
    }
}

fn default_api_url() -> String {
    "https://heyzine.com/api/v1/flipbooks".to_string()
}
fn default_background_color() -> String {
    "#F1F5F9".to_string()
}
fn default_logo_remove() -> bool {
    true
}

/// Hosting service that turns a PDF into a page-turnable viewer. Returns the
/// service's raw JSON reply.
#[async_trait]
pub trait FlipbookHost: Send + Sync + Debug {
    async fn upload(&self, pdf: Vec<u8>, title: &str) -> Result<Value>;
}

pub fn create_flipbook_host(config: &Config) -> StoryResult<Box<dyn FlipbookHost>> {
    let api_key = resolve_secret(
        config.flipbook.api_key.as_deref(),
        &["HEYZINE_API_KEY"],
        "flipbook API key",
    )?;
    Ok(Box::new(HeyzineClient::new(config.flipbook.clone(), api_key)))
}

pub fn pdf_file_name(title: &str) -> String {
    format!("{}.pdf", title.trim().replace(' ', "_"))
}

#[derive(Debug)]
pub struct HeyzineClient {
    config: FlipbookConfig,
    api_key: String,
    client: reqwest::Client,
}

impl HeyzineClient {
    pub fn new(config: FlipbookConfig, api_key: String) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FlipbookHost for HeyzineClient {
    async fn upload(&self, pdf: Vec<u8>, title: &str) -> Result<Value> {
        let part = multipart::Part::bytes(pdf)
            .file_name(pdf_file_name(title))
            .mime_str("application/pdf")
            .context("Invalid mime type")?;

        let form = multipart::Form::new()
            .text("key", self.api_key.clone())
            .part("pdf", part)
            .text("title", title.to_string())
            .text("background_color", self.config.background_color.clone())
            .text("logo_remove", if self.config.logo_remove { "1" } else { "0" });

        let resp = self
            .client
            .post(&self.config.api_url)
            .multipart(form)
            .send()
            .await
            .context("Failed to send flipbook upload")?;

        let status = resp.status();
        let body = resp.text().await?;
        let result: Value = serde_json::from_str(&body)
            .with_context(|| format!("Flipbook service answered non-JSON ({}): {}", status, body))?;

        if !status.is_success() {
            let message = result["message"].as_str().unwrap_or("Flipbook API error");
            return Err(anyhow!("{} ({})", message, status));
        }
        Ok(result)
    }
}

/// A transport-level success is not enough: the reply has to name a URL.
pub fn extract_url(reply: &Value) -> StoryResult<FlipbookResult> {
    match reply.get("url").and_then(Value::as_str).map(str::trim) {
        Some(url) if !url.is_empty() => Ok(FlipbookResult { url: url.to_string() }),
        _ => Err(StoryError::Publish("missing url".into())),
    }
}

pub struct FlipbookPublisher {
    host: Box<dyn FlipbookHost>,
}

impl FlipbookPublisher {
    pub fn new(host: Box<dyn FlipbookHost>) -> Self {
        Self { host }
    }

    pub async fn publish(&self, pdf: Vec<u8>, title: &str) -> StoryResult<FlipbookResult> {
        if title.trim().is_empty() {
            return Err(StoryError::Validation("title must not be empty".into()));
        }
        info!("Publishing {:?} ({} bytes)", title, pdf.len());

        let reply = self.host.upload(pdf, title).await.map_err(|e| {
            error!("Failed to create flipbook: {:#}", e);
            StoryError::Publish(format!("{:#}", e))
        })?;
        let result = extract_url(&reply).inspect_err(|_| {
            error!("Flipbook service reply has no url: {}", reply);
        })?;
        info!("Flipbook ready at {}", result.url);
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub(crate) struct MockFlipbookHost {
        pub reply: std::result::Result<Value, String>,
        pub uploads: Arc<Mutex<Vec<(usize, String)>>>,
    }

    impl MockFlipbookHost {
        pub(crate) fn replying(reply: Value) -> Self {
            Self {
                reply: Ok(reply),
                uploads: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl FlipbookHost for MockFlipbookHost {
        async fn upload(&self, pdf: Vec<u8>, title: &str) -> Result<Value> {
            self.uploads.lock().unwrap().push((pdf.len(), title.to_string()));
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    #[test]
    fn test_pdf_file_name() {
        assert_eq!(pdf_file_name("Nutmeg the Brave"), "Nutmeg_the_Brave.pdf");
    }

    #[tokio::test]
    async fn test_publish_returns_url() {
        let host = MockFlipbookHost::replying(json!({ "id": "abc", "url": "https://heyzine.com/flip-book/abc.html" }));
        let uploads = host.uploads.clone();
        let publisher = FlipbookPublisher::new(Box::new(host));

        let result = publisher.publish(vec![1, 2, 3], "Nutmeg").await.unwrap();
        assert_eq!(result.url, "https://heyzine.com/flip-book/abc.html");
        assert_eq!(uploads.lock().unwrap()[0], (3, "Nutmeg".to_string()));
    }

    #[tokio::test]
    async fn test_publish_without_url_is_failure() {
        let publisher = FlipbookPublisher::new(Box::new(MockFlipbookHost::replying(json!({ "id": "abc" }))));
        let err = publisher.publish(vec![1], "Nutmeg").await.unwrap_err();
        assert_eq!(err, StoryError::Publish("missing url".into()));
    }

    #[tokio::test]
    async fn test_publish_transport_failure() {
        let host = MockFlipbookHost {
            reply: Err("connection reset".into()),
            uploads: Arc::new(Mutex::new(Vec::new())),
        };
        let err = FlipbookPublisher::new(Box::new(host)).publish(vec![1], "Nutmeg").await.unwrap_err();
        assert!(matches!(err, StoryError::Publish(m) if m.contains("connection reset")));
    }

    #[test]
    fn test_missing_key_is_configuration_failure() {
        if std::env::var("HEYZINE_API_KEY").is_ok() {
            return;
        }
        let err = create_flipbook_host(&Config::default()).unwrap_err();
        assert!(matches!(err, StoryError::Configuration(_)));
    }
}
