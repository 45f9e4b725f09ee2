use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, error};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{FlipbookResult, GenerationRequest, StoryData};
use crate::services::assembler::Document;
use crate::services::backend::StoryBackend;

/// Talks to a running `storyflip serve` over its two endpoints. The PDF is
/// base64-encoded for transport.
#[derive(Debug)]
pub struct RemoteBackend {
    base_url: Url,
    client: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(base_url: &str) -> StoryResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| StoryError::Configuration(format!("Invalid remote URL {:?}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self, path: &str) -> StoryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| StoryError::Configuration(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// POSTs `body` and decodes the reply. Failures keep the server's own
    /// message; `fail` picks the variant for non-client errors.
    async fn post<B, T>(&self, path: &str, body: &B, fail: fn(String) -> StoryError) -> StoryResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!("POST {}", url);
        let resp = self.client.post(url.clone()).json(body).send().await.map_err(|e| {
            error!("Request to {} failed: {}", url, e);
            fail(format!("could not reach {}: {}", url, e))
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| fail(format!("could not read reply: {}", e)))?;

        if !status.is_success() {
            return Err(reply_error(status, &text, fail));
        }

        serde_json::from_str(&text).map_err(|e| fail(format!("unexpected reply: {}", e)))
    }
}

/// Rebuilds the failure the server reported. Replies without a known `kind`
/// fall back to the status class.
fn reply_error(status: StatusCode, text: &str, fail: fn(String) -> StoryError) -> StoryError {
    let reply = serde_json::from_str::<Value>(text).unwrap_or(Value::Null);
    let detail = reply["detail"].as_str().or_else(|| reply["message"].as_str());
    if let (Some(kind), Some(detail)) = (reply["kind"].as_str(), detail) {
        if let Some(err) = StoryError::from_kind(kind, detail) {
            return err;
        }
    }

    let message = reply["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", status, text));
    if status.is_client_error() {
        StoryError::Validation(message)
    } else {
        fail(message)
    }
}

#[async_trait]
impl StoryBackend for RemoteBackend {
    async fn generate_story(&self, request: &GenerationRequest) -> StoryResult<StoryData> {
        self.post("api/generate-story", request, StoryError::Generation).await
    }

    async fn create_flipbook(&self, document: &Document, title: &str) -> StoryResult<FlipbookResult> {
        let body = json!({
            "pdfData": STANDARD.encode(&document.bytes),
            "title": title,
        });
        let reply: Value = self.post("api/create-flipbook", &body, StoryError::Publish).await?;
        crate::services::flipbook::extract_url(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::IllustrationStyle;
    use crate::services::backend::tests::MockFactory;
    use crate::services::server::{create_router, AppState};
    use std::sync::Arc;

    async fn spawn_server(factory: MockFactory) -> RemoteBackend {
        let app = create_router(AppState::new(Arc::new(factory)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        RemoteBackend::new(&format!("http://{}", addr)).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a brave squirrel", IllustrationStyle::Cartoon, "for Mia", 4).unwrap()
    }

    #[tokio::test]
    async fn test_remote_story_round_trip() {
        let remote = spawn_server(MockFactory::happy(4)).await;
        let story = remote.generate_story(&request()).await.unwrap();
        assert_eq!(story.title, "Nutmeg the Brave");
        assert_eq!(story.pages.len(), 4);
    }

    #[tokio::test]
    async fn test_remote_illustration_failure_keeps_its_type() {
        let mut factory = MockFactory::happy(4);
        factory.fail_image_on = Some("scene 2".into());
        let remote = spawn_server(factory).await;

        let err = remote.generate_story(&request()).await.unwrap_err();
        assert_eq!(
            err,
            StoryError::ImageGeneration("Failed to generate 1 of 5 required illustrations for the story.".into())
        );
        assert_eq!(err.stage(), "illustration");
    }

    #[tokio::test]
    async fn test_remote_rejected_request_is_validation() {
        let remote = spawn_server(MockFactory::happy(4)).await;
        let mut bad = request();
        bad.page_count = 5;
        let err = remote.generate_story(&bad).await.unwrap_err();
        assert!(matches!(err, StoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_remote_flipbook_upload() {
        let factory = MockFactory::happy(4);
        let uploads = factory.host.uploads.clone();
        let remote = spawn_server(factory).await;
        let document = Document {
            bytes: b"%PDF-1.5 test".to_vec(),
            page_count: 1,
        };

        let result = remote.create_flipbook(&document, "Nutmeg").await.unwrap();
        assert_eq!(result.url, "https://flip.example/book");
        assert_eq!(uploads.lock().unwrap()[0], (13, "Nutmeg".to_string()));
    }

    #[tokio::test]
    async fn test_remote_missing_url_is_publish_failure() {
        let remote = spawn_server(MockFactory::new("{}", json!({ "id": "abc" }))).await;
        let document = Document {
            bytes: b"%PDF".to_vec(),
            page_count: 1,
        };
        let err = remote.create_flipbook(&document, "Nutmeg").await.unwrap_err();
        assert_eq!(err, StoryError::Publish("missing url".into()));
    }

    #[test]
    fn test_reply_without_kind_falls_back_to_status() {
        let err = reply_error(StatusCode::BAD_GATEWAY, "upstream down", StoryError::Generation);
        assert!(matches!(err, StoryError::Generation(m) if m.contains("upstream down")));
        let err = reply_error(StatusCode::BAD_REQUEST, r#"{"message":"nope"}"#, StoryError::Publish);
        assert_eq!(err, StoryError::Validation("nope".into()));
    }

    #[test]
    fn test_endpoint_join_keeps_base_path() {
        let remote = RemoteBackend::new("http://localhost:3000/storyflip").unwrap();
        assert_eq!(
            remote.endpoint("api/generate-story").unwrap().as_str(),
            "http://localhost:3000/storyflip/api/generate-story"
        );

        let remote = RemoteBackend::new("http://localhost:3000").unwrap();
        assert_eq!(
            remote.endpoint("api/create-flipbook").unwrap().as_str(),
            "http://localhost:3000/api/create-flipbook"
        );
    }

    #[test]
    fn test_invalid_url_is_configuration_failure() {
        let err = RemoteBackend::new("not a url").unwrap_err();
        assert!(matches!(err, StoryError::Configuration(_)));
    }
}
