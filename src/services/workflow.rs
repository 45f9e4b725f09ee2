use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::error::StoryResult;
use crate::core::model::{FlipbookResult, GenerationRequest};
use crate::core::state::PipelineState;
use crate::services::assembler::{DocumentAssembler, PdfConfig};
use crate::services::backend::StoryBackend;
use crate::services::render::PageRenderer;

/// Drives one storybook from request to flipbook URL and owns the only
/// copy of the run's state.
pub struct WorkflowManager {
    backend: Box<dyn StoryBackend>,
    renderer: PageRenderer,
    assembler: DocumentAssembler,
    state: watch::Sender<PipelineState>,
}

impl WorkflowManager {
    pub fn new(backend: Box<dyn StoryBackend>, pdf: PdfConfig) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            backend,
            renderer: PageRenderer::new(pdf.clone()),
            assembler: DocumentAssembler::new(pdf),
            state,
        }
    }

    /// Progress feed for a display surface.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Drops whatever the last run left behind.
    pub fn reset(&mut self) {
        self.state.send_replace(PipelineState::Idle);
    }

    fn transition(&self, next: PipelineState) {
        let current = self.state.borrow().step();
        debug_assert!(
            matches!(next, PipelineState::Failed { .. }) || next.step() == current + 1,
            "pipeline may only move one step forward"
        );
        let message = next.progress_message();
        if !message.is_empty() {
            info!("{}", message);
        }
        self.state.send_replace(next);
    }

    /// Runs the whole pipeline. Taking `&mut self` keeps a second run from
    /// starting while one is in flight; a new run discards the previous one.
    pub async fn run(&mut self, request: GenerationRequest) -> StoryResult<FlipbookResult> {
        self.reset();
        match self.execute(request).await {
            Ok(result) => {
                self.transition(PipelineState::Done(result.clone()));
                Ok(result)
            }
            Err(e) => {
                error!("Pipeline failed during {}: {}", e.stage(), e);
                self.transition(PipelineState::Failed {
                    message: format!("Something went wrong during {}. {}", e.stage(), e),
                });
                Err(e)
            }
        }
    }

    async fn execute(&self, request: GenerationRequest) -> StoryResult<FlipbookResult> {
        request.validate()?;
        self.transition(PipelineState::GeneratingStory);
        let story = Arc::new(self.backend.generate_story(&request).await?);

        // The story is published before layout starts; rendering waits on the
        // pictures themselves, not on a timer.
        self.transition(PipelineState::Rendering { story: story.clone() });
        let pages = self.renderer.render(&story).await?;
        let document = self.assembler.assemble(pages).await?;
        info!("Assembled {} pages ({} bytes)", document.page_count, document.bytes.len());

        let title = story.title.clone();
        self.transition(PipelineState::Publishing { title: title.clone() });
        self.backend.create_flipbook(&document, &title).await
    }
}
