use thiserror::Error;

/// Failure surfaced by a pipeline component. Each component reports exactly
/// one of these; the workflow turns it into the single message the user sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoryError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Server configuration error: {0}")]
    Configuration(String),
    #[error("Story generation failed: {0}")]
    Generation(String),
    #[error("Illustration failed: {0}")]
    ImageGeneration(String),
    #[error("Could not assemble the storybook: {0}")]
    Assembly(String),
    #[error("Could not publish the flipbook: {0}")]
    Publish(String),
}

impl StoryError {
    /// Human name of the stage that produced the failure.
    pub fn stage(&self) -> &'static str {
        match self {
            StoryError::Validation(_) => "request validation",
            StoryError::Configuration(_) => "configuration",
            StoryError::Generation(_) => "story generation",
            StoryError::ImageGeneration(_) => "illustration",
            StoryError::Assembly(_) => "page assembly",
            StoryError::Publish(_) => "publishing",
        }
    }

    /// HTTP status the boundary answers with for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            StoryError::Validation(_) => 400,
            _ => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StoryError::Validation(m)
            | StoryError::Configuration(m)
            | StoryError::Generation(m)
            | StoryError::ImageGeneration(m)
            | StoryError::Assembly(m)
            | StoryError::Publish(m) => m,
        }
    }

    /// Stable tag for the variant, carried in HTTP error replies so that a
    /// remote caller gets the same failure back.
    pub fn kind(&self) -> &'static str {
        match self {
            StoryError::Validation(_) => "validation",
            StoryError::Configuration(_) => "configuration",
            StoryError::Generation(_) => "generation",
            StoryError::ImageGeneration(_) => "image_generation",
            StoryError::Assembly(_) => "assembly",
            StoryError::Publish(_) => "publish",
        }
    }

    pub fn from_kind(kind: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        Some(match kind {
            "validation" => StoryError::Validation(message),
            "configuration" => StoryError::Configuration(message),
            "generation" => StoryError::Generation(message),
            "image_generation" => StoryError::ImageGeneration(message),
            "assembly" => StoryError::Assembly(message),
            "publish" => StoryError::Publish(message),
            _ => return None,
        })
    }
}

pub type StoryResult<T> = std::result::Result<T, StoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StoryError::Validation("x".into()).status_code(), 400);
        assert_eq!(StoryError::Configuration("x".into()).status_code(), 500);
        assert_eq!(StoryError::Publish("x".into()).status_code(), 500);
    }

    #[test]
    fn test_display_carries_stage_context() {
        let err = StoryError::Publish("missing url".into());
        assert_eq!(err.to_string(), "Could not publish the flipbook: missing url");
        assert_eq!(err.message(), "missing url");
        assert_eq!(err.stage(), "publishing");
    }

    #[test]
    fn test_kind_round_trips_every_variant() {
        let all = [
            StoryError::Validation("a".into()),
            StoryError::Configuration("b".into()),
            StoryError::Generation("c".into()),
            StoryError::ImageGeneration("d".into()),
            StoryError::Assembly("e".into()),
            StoryError::Publish("f".into()),
        ];
        for err in all {
            assert_eq!(StoryError::from_kind(err.kind(), err.message()), Some(err.clone()));
        }
        assert_eq!(StoryError::from_kind("teapot", "x"), None);
    }
}
