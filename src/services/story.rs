use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{GenerationRequest, StoryStructure};
use crate::services::llm::LlmClient;
use crate::utils::json::strip_code_blocks;

const SYSTEM_PROMPT: &str = "You are a children's author and art director. Reply only with JSON matching the requested schema.";

/// Output contract the text-generation service is asked to honour.
pub fn story_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {
                "type": "string",
                "description": "A creative, short title for the story."
            },
            "characterDescriptions": {
                "type": "string",
                "description": "A consistent, detailed visual description of the main character(s) to be used in every image prompt."
            },
            "scenes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "pageText": {
                            "type": "string",
                            "description": "One to two paragraphs of the story for this scene."
                        },
                        "imagePrompt": {
                            "type": "string",
                            "description": "A detailed visual prompt for an illustration of this scene, referencing the character descriptions."
                        }
                    },
                    "required": ["pageText", "imagePrompt"]
                }
            }
        },
        "required": ["title", "characterDescriptions", "scenes"]
    })
}

pub fn build_story_prompt(request: &GenerationRequest) -> String {
    format!(
        "Create a short story for a child.\n\
         Primary subject: {}\n\
         Incorporate this personalization: {}\n\
         The story must have exactly {} scenes.\n\
         For each scene, provide the story text and a detailed image prompt in a {} style that describes the scene visually.\n\
         The image prompts MUST maintain character consistency. First, describe the main characters in the 'characterDescriptions' field. \
         Then, reference those descriptions in each scene's 'imagePrompt' to ensure the characters look the same in every picture.",
        request.subject.trim(),
        request.personalization.trim(),
        request.page_count,
        request.style,
    )
}

/// Parses the service's reply. A scene count that differs from the request
/// is tolerated; no scenes at all is not.
pub fn parse_story(response: &str) -> StoryResult<StoryStructure> {
    let clean_json = strip_code_blocks(response);
    if clean_json.is_empty() {
        return Err(StoryError::Generation("parse error".into()));
    }

    let structure: StoryStructure = serde_json::from_str(&clean_json).map_err(|e| {
        error!("Failed to parse story structure JSON: {} ({})", clean_json, e);
        StoryError::Generation("parse error".into())
    })?;

    if structure.title.trim().is_empty() {
        return Err(StoryError::Generation("parse error".into()));
    }
    if structure.scenes.is_empty() {
        return Err(StoryError::Generation("empty story".into()));
    }
    Ok(structure)
}

pub struct StoryGenerator {
    llm: Box<dyn LlmClient>,
}

impl StoryGenerator {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// One outbound call to the text-generation service.
    pub async fn generate(&self, request: &GenerationRequest) -> StoryResult<StoryStructure> {
        request.validate()?;
        info!("Generating story structure for {:?} ({} scenes)", request.subject, request.page_count);

        let prompt = build_story_prompt(request);
        let response = self
            .llm
            .generate_json(SYSTEM_PROMPT, &prompt, &story_schema())
            .await
            .map_err(|e| {
                error!("Text generation failed: {:#}", e);
                StoryError::Generation(format!("{:#}", e))
            })?;
        debug!("Story response: {} bytes", response.len());

        let structure = parse_story(&response)?;
        if structure.scenes.len() != request.page_count {
            warn!(
                "Requested {} scenes but the storyteller wrote {}",
                request.page_count,
                structure.scenes.len()
            );
        }
        Ok(structure)
    }
}
