use std::sync::Arc;

use crate::core::model::{FlipbookResult, StoryData};

/// Single source of truth for a pipeline run. Every transition replaces the
/// whole value, so there is no combination of flags to get out of sync.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    GeneratingStory,
    /// The story and all illustrations are in hand; pages are being laid out
    /// and rasterized.
    Rendering { story: Arc<StoryData> },
    Publishing { title: String },
    Done(FlipbookResult),
    Failed { message: String },
}

impl PipelineState {
    /// Text for the progress display.
    pub fn progress_message(&self) -> String {
        match self {
            PipelineState::Idle => String::new(),
            PipelineState::GeneratingStory => {
                "Asking the storyteller for a new idea and painting the pictures...".to_string()
            }
            PipelineState::Rendering { .. } => "Assembling the storybook pages...".to_string(),
            PipelineState::Publishing { .. } => "Sending your book to the magical press...".to_string(),
            PipelineState::Done(result) => format!("Your storybook is ready: {}", result.url),
            PipelineState::Failed { message } => message.clone(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::GeneratingStory | PipelineState::Rendering { .. } | PipelineState::Publishing { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done(_) | PipelineState::Failed { .. })
    }

    /// Position along the linear pipeline, used to check that transitions
    /// only move forward.
    pub fn step(&self) -> usize {
        match self {
            PipelineState::Idle => 0,
            PipelineState::GeneratingStory => 1,
            PipelineState::Rendering { .. } => 2,
            PipelineState::Publishing { .. } => 3,
            PipelineState::Done(_) | PipelineState::Failed { .. } => 4,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            PipelineState::Done(result) => Some(&result.url),
            _ => None,
        }
    }
}
