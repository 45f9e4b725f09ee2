use async_trait::async_trait;
use log::info;

use crate::core::config::Config;
use crate::core::error::StoryResult;
use crate::core::model::{FlipbookResult, GenerationRequest, StoryData};
use crate::services::assembler::Document;
use crate::services::flipbook::{create_flipbook_host, FlipbookPublisher};
use crate::services::illustration::{create_image_client, IllustrationGenerator};
use crate::services::llm::create_llm;
use crate::services::story::StoryGenerator;

/// Story text plus every illustration: the combined generation step.
pub struct StoryService {
    story: StoryGenerator,
    illustrations: IllustrationGenerator,
}

impl StoryService {
    pub fn new(story: StoryGenerator, illustrations: IllustrationGenerator) -> Self {
        Self { story, illustrations }
    }

    pub fn from_config(config: &Config) -> StoryResult<Self> {
        let llm = create_llm(config)?;
        let images = create_image_client(config)?;
        Ok(Self::new(
            StoryGenerator::new(llm),
            IllustrationGenerator::new(images, config.image.max_concurrency),
        ))
    }

    pub async fn generate(&self, request: &GenerationRequest) -> StoryResult<StoryData> {
        let structure = self.story.generate(request).await?;
        let images = self.illustrations.illustrate(&structure, request.style).await?;
        let story = StoryData::assemble(structure, images)?;
        info!("Story {:?} ready with {} pages", story.title, story.pages.len());
        Ok(story)
    }
}

/// Builds the services for each request, so that credentials are looked up
/// when they are needed rather than at startup.
pub trait ServiceFactory: Send + Sync {
    fn story_service(&self) -> StoryResult<StoryService>;
    fn publisher(&self) -> StoryResult<FlipbookPublisher>;
}

pub struct ConfigServiceFactory {
    config: Config,
}

impl ConfigServiceFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ServiceFactory for ConfigServiceFactory {
    fn story_service(&self) -> StoryResult<StoryService> {
        StoryService::from_config(&self.config)
    }

    fn publisher(&self) -> StoryResult<FlipbookPublisher> {
        Ok(FlipbookPublisher::new(create_flipbook_host(&self.config)?))
    }
}

/// The two network round-trips the workflow delegates.
#[async_trait]
pub trait StoryBackend: Send + Sync {
    async fn generate_story(&self, request: &GenerationRequest) -> StoryResult<StoryData>;
    async fn create_flipbook(&self, document: &Document, title: &str) -> StoryResult<FlipbookResult>;
}

/// Calls the providers directly from this process.
pub struct LocalBackend {
    story: StoryService,
    publisher: FlipbookPublisher,
}

impl LocalBackend {
    pub fn new(story: StoryService, publisher: FlipbookPublisher) -> Self {
        Self { story, publisher }
    }

    pub fn from_factory(factory: &dyn ServiceFactory) -> StoryResult<Self> {
        Ok(Self::new(factory.story_service()?, factory.publisher()?))
    }
}

#[async_trait]
impl StoryBackend for LocalBackend {
    async fn generate_story(&self, request: &GenerationRequest) -> StoryResult<StoryData> {
        self.story.generate(request).await
    }

    async fn create_flipbook(&self, document: &Document, title: &str) -> StoryResult<FlipbookResult> {
        self.publisher.publish(document.bytes.clone(), title).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::error::StoryError;
    use crate::core::model::IllustrationStyle;
    use crate::services::flipbook::tests::MockFlipbookHost;
    use crate::services::illustration::tests::MockImageClient;
    use crate::services::story::tests::{story_json, MockLlmClient};
    use serde_json::{json, Value};

    /// Factory wired to mocks, shared by workflow and server tests.
    pub(crate) struct MockFactory {
        pub llm: MockLlmClient,
        pub fail_image_on: Option<String>,
        pub host: MockFlipbookHost,
    }

    impl MockFactory {
        pub(crate) fn new(llm_reply: &str, flipbook_reply: Value) -> Self {
            Self {
                llm: MockLlmClient::replying(llm_reply),
                fail_image_on: None,
                host: MockFlipbookHost::replying(flipbook_reply),
            }
        }

        pub(crate) fn happy(scenes: usize) -> Self {
            Self::new(&story_json(scenes), json!({ "url": "https://flip.example/book" }))
        }
    }

    impl ServiceFactory for MockFactory {
        fn story_service(&self) -> StoryResult<StoryService> {
            let images = MockImageClient {
                fail_on: self.fail_image_on.clone(),
                ..Default::default()
            };
            Ok(StoryService::new(
                StoryGenerator::new(Box::new(self.llm.clone())),
                IllustrationGenerator::new(Box::new(images), None),
            ))
        }

        fn publisher(&self) -> StoryResult<FlipbookPublisher> {
            Ok(FlipbookPublisher::new(Box::new(self.host.clone())))
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a brave squirrel", IllustrationStyle::Cartoon, "for Mia", 4).unwrap()
    }

    #[tokio::test]
    async fn test_story_service_builds_story_data() {
        let service = MockFactory::happy(4).story_service().unwrap();
        let story = service.generate(&request()).await.unwrap();

        assert_eq!(story.title, "Nutmeg the Brave");
        assert_eq!(story.pages.len(), 4);
        assert!(story.cover_image_url.starts_with("data:image/"));
        assert!(story.pages.iter().all(|p| p.image_url.starts_with("data:image/")));
    }

    #[tokio::test]
    async fn test_pages_follow_parsed_scenes_not_request() {
        let service = MockFactory::happy(6).story_service().unwrap();
        let story = service.generate(&request()).await.unwrap();
        assert_eq!(story.pages.len(), 6);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_configuration_failure() {
        let mut config = Config::default();
        config.llm.provider = "openai".into();
        let err = ConfigServiceFactory::new(config).story_service().err().unwrap();
        assert!(matches!(err, StoryError::Configuration(_)));
    }
}
