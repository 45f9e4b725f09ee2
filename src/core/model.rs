use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::{StoryError, StoryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IllustrationStyle {
    Watercolor,
    Cartoon,
    Anime,
    #[serde(rename = "Pixel Art")]
    PixelArt,
    #[serde(rename = "Fantasy Art")]
    FantasyArt,
    #[serde(rename = "Children's Book Illustration")]
    ChildrensBook,
}

impl IllustrationStyle {
    pub const ALL: [IllustrationStyle; 6] = [
        IllustrationStyle::Watercolor,
        IllustrationStyle::Cartoon,
        IllustrationStyle::Anime,
        IllustrationStyle::PixelArt,
        IllustrationStyle::FantasyArt,
        IllustrationStyle::ChildrensBook,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IllustrationStyle::Watercolor => "Watercolor",
            IllustrationStyle::Cartoon => "Cartoon",
            IllustrationStyle::Anime => "Anime",
            IllustrationStyle::PixelArt => "Pixel Art",
            IllustrationStyle::FantasyArt => "Fantasy Art",
            IllustrationStyle::ChildrensBook => "Children's Book Illustration",
        }
    }
}

impl fmt::Display for IllustrationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IllustrationStyle {
    type Err = StoryError;

    fn from_str(s: &str) -> StoryResult<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|style| style.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| StoryError::Validation(format!("Unknown illustration style: {}", s)))
    }
}

/// Length presets offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoryLength {
    Short,
    Medium,
    Long,
}

impl StoryLength {
    pub const ALL: [StoryLength; 3] = [StoryLength::Short, StoryLength::Medium, StoryLength::Long];
    pub const DEFAULT_PAGE_COUNT: usize = 4;

    pub fn page_count(&self) -> usize {
        match self {
            StoryLength::Short => 4,
            StoryLength::Medium => 6,
            StoryLength::Long => 8,
        }
    }

    /// Unknown names fall back to the short preset.
    pub fn page_count_for(name: &str) -> usize {
        Self::ALL
            .into_iter()
            .find(|l| l.to_string().eq_ignore_ascii_case(name.trim()))
            .map(|l| l.page_count())
            .unwrap_or(Self::DEFAULT_PAGE_COUNT)
    }

    pub fn is_preset(page_count: usize) -> bool {
        Self::ALL.iter().any(|l| l.page_count() == page_count)
    }
}

impl fmt::Display for StoryLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoryLength::Short => "Short",
            StoryLength::Medium => "Medium",
            StoryLength::Long => "Long",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[serde(rename = "prompt")]
    pub subject: String,
    pub style: IllustrationStyle,
    pub personalization: String,
    pub page_count: usize,
}

impl GenerationRequest {
    pub fn new(
        subject: impl Into<String>,
        style: IllustrationStyle,
        personalization: impl Into<String>,
        page_count: usize,
    ) -> StoryResult<Self> {
        let request = Self {
            subject: subject.into(),
            style,
            personalization: personalization.into(),
            page_count,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> StoryResult<()> {
        if self.subject.trim().is_empty() {
            return Err(StoryError::Validation("subject must not be empty".into()));
        }
        if self.personalization.trim().is_empty() {
            return Err(StoryError::Validation("personalization must not be empty".into()));
        }
        if !StoryLength::is_preset(self.page_count) {
            return Err(StoryError::Validation(format!(
                "page count {} is not one of the offered lengths",
                self.page_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSpec {
    pub page_text: String,
    pub image_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryStructure {
    pub title: String,
    #[serde(rename = "characterDescriptions", alias = "characterDescription")]
    pub character_description: String,
    #[serde(default)]
    pub scenes: Vec<SceneSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPage {
    pub text: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryData {
    pub title: String,
    pub cover_image_url: String,
    pub pages: Vec<GeneratedPage>,
}

impl StoryData {
    /// Pairs each scene with its illustration. `images` is cover first, then
    /// one per scene.
    pub fn assemble(structure: StoryStructure, images: Vec<String>) -> StoryResult<Self> {
        if images.len() != structure.scenes.len() + 1 {
            return Err(StoryError::ImageGeneration(format!(
                "expected {} illustrations, got {}",
                structure.scenes.len() + 1,
                images.len()
            )));
        }
        let mut images = images.into_iter();
        let cover_image_url = images.next().unwrap_or_default();
        let pages = structure
            .scenes
            .into_iter()
            .zip(images)
            .map(|(scene, image_url)| GeneratedPage {
                text: scene.page_text,
                image_url,
            })
            .collect();

        Ok(Self {
            title: structure.title,
            cover_image_url,
            pages,
        })
    }

    /// Cover plus a text page and an illustration page per scene.
    pub fn document_page_count(&self) -> usize {
        2 * self.pages.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlipbookResult {
    pub url: String,
}
