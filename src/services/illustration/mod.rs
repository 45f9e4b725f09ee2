use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::core::config::{resolve_secret, Config};
use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{IllustrationStyle, StoryStructure};
use crate::utils::data_uri;
use crate::utils::retry::RetryPolicy;

pub mod imagen;
pub mod inference;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "imagen" or "inference"
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Upper bound on requests in flight. Unset means every illustration is
    /// requested at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    pub imagen: Option<imagen::ImagenConfig>,
    pub inference: Option<inference::InferenceConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            retry: RetryPolicy::default(),
            max_concurrency: None,
            imagen: None,
            inference: None,
        }
    }
}

fn default_provider() -> String {
    "imagen".to_string()
}

/// One generated picture as returned by a backend.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    async fn generate(&self, prompt: &str) -> Result<ImagePayload>;
}

pub fn create_image_client(config: &Config) -> StoryResult<Box<dyn ImageClient>> {
    let retry = config.image.retry.clone();
    info!("Initializing image client for provider: {}", config.image.provider);
    match config.image.provider.as_str() {
        "imagen" => {
            let cfg = config.image.imagen.clone().unwrap_or_default();
            let api_key = resolve_secret(
                cfg.api_key.as_deref(),
                &["IMAGE_API_KEY", "GEMINI_API_KEY", "API_KEY"],
                "image-generation API key",
            )?;
            Ok(Box::new(imagen::ImagenClient::new(cfg, api_key, retry)))
        }
        "inference" => {
            let cfg = config
                .image
                .inference
                .clone()
                .ok_or_else(|| StoryError::Configuration("Inference endpoint config missing".into()))?;
            let api_key = resolve_secret(cfg.api_key.as_deref(), &["IMAGE_API_KEY"], "image-generation API key")?;
            Ok(Box::new(inference::InferenceClient::new(cfg, api_key, retry)))
        }
        other => Err(StoryError::Configuration(format!("Unknown image provider: {}", other))),
    }
}

pub fn cover_prompt(structure: &StoryStructure, style: IllustrationStyle) -> String {
    format!(
        "A beautiful and captivating book cover for a story titled \"{}\". Style: {}. Featuring: {}. \
         The cover should be vibrant and inviting for a child, without any text.",
        structure.title, style, structure.character_description
    )
}

pub fn scene_prompts(structure: &StoryStructure, style: IllustrationStyle) -> Vec<String> {
    structure
        .scenes
        .iter()
        .map(|scene| {
            format!(
                "{}. Style: {}. Characters: {}",
                scene.image_prompt.trim_end_matches('.'),
                style,
                structure.character_description
            )
        })
        .collect()
}

/// Cover prompt first, then one per scene.
pub fn illustration_prompts(structure: &StoryStructure, style: IllustrationStyle) -> Vec<String> {
    let mut prompts = vec![cover_prompt(structure, style)];
    prompts.extend(scene_prompts(structure, style));
    prompts
}

fn validate_payload(payload: ImagePayload) -> Result<String> {
    if payload.bytes.is_empty() {
        anyhow::bail!("image payload is empty");
    }
    let format = image::guess_format(&payload.bytes)
        .map_err(|e| anyhow::anyhow!("image payload is not a recognised image: {}", e))?;
    let mime_type = if payload.mime_type.starts_with("image/") {
        payload.mime_type
    } else {
        format.to_mime_type().to_string()
    };
    Ok(data_uri::encode(&mime_type, &payload.bytes))
}

pub struct IllustrationGenerator {
    client: Box<dyn ImageClient>,
    max_concurrency: Option<usize>,
}

impl IllustrationGenerator {
    pub fn new(client: Box<dyn ImageClient>, max_concurrency: Option<usize>) -> Self {
        Self {
            client,
            max_concurrency,
        }
    }

    /// Requests the cover and every scene illustration concurrently and waits
    /// for all of them. Returns `scenes + 1` data URIs, cover first, or fails
    /// as a whole if any single picture is missing.
    pub async fn illustrate(
        &self,
        structure: &StoryStructure,
        style: IllustrationStyle,
    ) -> StoryResult<Vec<String>> {
        let prompts = illustration_prompts(structure, style);
        let concurrency = self.max_concurrency.unwrap_or(prompts.len()).max(1);
        info!("Requesting {} illustrations ({} at a time)", prompts.len(), concurrency);

        let client = self.client.as_ref();
        let results: Vec<Result<String>> = futures_util::stream::iter(prompts.iter().cloned())
            .map(|prompt| async move { validate_payload(client.generate(&prompt).await?) })
            .buffered(concurrency)
            .collect()
            .await;

        let mut images = Vec::with_capacity(results.len());
        let mut failures = 0;
        for (i, res) in results.into_iter().enumerate() {
            match res {
                Ok(uri) => images.push(uri),
                Err(e) => {
                    error!("Image generation failed for prompt {:?}: {:#}", prompts[i], e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(StoryError::ImageGeneration(format!(
                "Failed to generate {} of {} required illustrations for the story.",
                failures,
                prompts.len()
            )));
        }
        Ok(images)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::model::SceneSpec;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// A tiny valid JPEG with the given dimensions.
    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[derive(Debug, Default)]
    pub(crate) struct MockImageClient {
        /// Prompts containing this marker fail.
        pub fail_on: Option<String>,
        pub calls: Arc<AtomicUsize>,
        pub prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ImageClient for MockImageClient {
        async fn generate(&self, prompt: &str) -> Result<ImagePayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(marker) = &self.fail_on {
                if prompt.contains(marker.as_str()) {
                    anyhow::bail!("model overloaded");
                }
            }
            Ok(ImagePayload {
                mime_type: "image/jpeg".to_string(),
                bytes: jpeg_bytes(8, 6),
            })
        }
    }

    fn structure(n: usize) -> StoryStructure {
        StoryStructure {
            title: "Nutmeg the Brave".into(),
            character_description: "a small red squirrel with a blue scarf".into(),
            scenes: (0..n)
                .map(|i| SceneSpec {
                    page_text: format!("Page {}", i + 1),
                    image_prompt: format!("Squirrel scene {}.", i + 1),
                })
                .collect(),
        }
    }

    #[test]
    fn test_prompts_share_character_description() {
        let prompts = illustration_prompts(&structure(2), IllustrationStyle::Watercolor);
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("book cover"));
        assert!(prompts[0].contains("Nutmeg the Brave"));
        assert_eq!(
            prompts[2],
            "Squirrel scene 2. Style: Watercolor. Characters: a small red squirrel with a blue scarf"
        );
        assert!(prompts.iter().all(|p| p.contains("blue scarf")));
    }

    #[tokio::test]
    async fn test_illustrate_returns_cover_plus_scenes() {
        let client = MockImageClient::default();
        let calls = client.calls.clone();
        let generator = IllustrationGenerator::new(Box::new(client), None);

        let images = generator
            .illustrate(&structure(4), IllustrationStyle::Cartoon)
            .await
            .unwrap();
        assert_eq!(images.len(), 5);
        assert!(images.iter().all(|uri| uri.starts_with("data:image/jpeg;base64,")));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_one_failure_fails_everything_without_cancelling_siblings() {
        let client = MockImageClient {
            fail_on: Some("scene 3".to_string()),
            ..Default::default()
        };
        let calls = client.calls.clone();
        let generator = IllustrationGenerator::new(Box::new(client), Some(2));

        let err = generator
            .illustrate(&structure(4), IllustrationStyle::Cartoon)
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::ImageGeneration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_validate_payload_rejects_garbage() {
        let empty = ImagePayload { mime_type: "image/jpeg".into(), bytes: vec![] };
        assert!(validate_payload(empty).is_err());
        let text = ImagePayload { mime_type: "image/jpeg".into(), bytes: b"not an image".to_vec() };
        assert!(validate_payload(text).is_err());
        let octets = ImagePayload { mime_type: "application/octet-stream".into(), bytes: jpeg_bytes(2, 2) };
        assert!(validate_payload(octets).unwrap().starts_with("data:image/jpeg;base64,"));
    }
}
