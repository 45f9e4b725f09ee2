use anyhow::{Context, Result};
use image::DynamicImage;
use log::{debug, error, warn};
use std::collections::BTreeSet;

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::StoryData;
use crate::services::assembler::PdfConfig;
use crate::services::typeface::{Glyphs, Typeface};
use crate::utils::data_uri;

/// Typeset text ready to be drawn, in page units with the origin at the
/// bottom-left corner (PDF convention).
#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub lines: Vec<String>,
    pub font_size: f32,
    pub line_height: f32,
    pub x: f32,
    /// Baseline of the first line.
    pub y: f32,
}

#[derive(Debug, Clone)]
pub enum PageSurface {
    /// Full-bleed cover picture.
    Cover(DynamicImage),
    Text(TextLayout),
    /// Illustration contained within the page margins.
    Illustration(DynamicImage),
}

/// Every page of one storybook, fully realized: all pictures are decoded
/// before a set is handed out.
#[derive(Debug, Clone)]
pub struct RenderedPageSet {
    pub title: String,
    pub page_width: f32,
    pub page_height: f32,
    /// Face the text pages were measured with; the assembler embeds it.
    pub typeface: Typeface,
    pub surfaces: Vec<PageSurface>,
}

impl RenderedPageSet {
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

const LINE_SPACING: f32 = 1.625;
const MIN_FONT_SIZE: f32 = 10.0;

/// Greedy word wrap. Explicit line breaks in the text are kept.
pub fn wrap_text(glyphs: &Glyphs, text: &str, font_size: f32, max_width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let candidate = if current.is_empty() {
                word.to_string()
            } else {
                format!("{} {}", current, word)
            };
            if glyphs.text_width(&candidate, font_size) <= max_width || current.is_empty() {
                current = candidate;
            } else {
                lines.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        lines.push(current);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Flows `text` inside the margins and centres the block on the page,
/// shrinking the type until it fits.
pub fn layout_text(glyphs: &Glyphs, text: &str, config: &PdfConfig) -> TextLayout {
    let max_width = config.page_width - 2.0 * config.margin;
    let max_height = config.page_height - 2.0 * config.margin;

    let mut font_size = config.font_size;
    let mut lines = wrap_text(glyphs, text, font_size, max_width);
    while font_size > MIN_FONT_SIZE && lines.len() as f32 * font_size * LINE_SPACING > max_height {
        font_size -= 1.0;
        lines = wrap_text(glyphs, text, font_size, max_width);
    }

    let line_height = font_size * LINE_SPACING;
    let block_width = lines
        .iter()
        .map(|l| glyphs.text_width(l, font_size))
        .fold(0.0_f32, f32::max)
        .min(max_width);
    let block_height = lines.len() as f32 * line_height;

    TextLayout {
        x: (config.page_width - block_width) / 2.0,
        y: (config.page_height + block_height) / 2.0 - font_size,
        lines,
        font_size,
        line_height,
    }
}

fn warn_missing_glyphs(glyphs: &Glyphs, typeface: &Typeface, story: &StoryData) {
    let missing: BTreeSet<char> = story
        .pages
        .iter()
        .flat_map(|p| p.text.chars())
        .filter(|c| !c.is_whitespace() && !glyphs.has_glyph(*c))
        .collect();
    if !missing.is_empty() {
        let chars: String = missing.into_iter().collect();
        warn!(
            "Font {} has no glyphs for \"{}\"; set pdf.font_path to a font that covers them",
            typeface.name(),
            chars
        );
    }
}

fn load_image(uri: &str) -> Result<DynamicImage> {
    let (_, bytes) = data_uri::decode(uri)?;
    image::load_from_memory(&bytes).context("illustration could not be decoded")
}

/// Lays the story out as cover, then text and illustration per scene.
pub struct PageRenderer {
    config: PdfConfig,
}

impl PageRenderer {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }

    /// Resolves only once every picture referenced by the story is decoded,
    /// so nothing downstream can rasterize a half-loaded page.
    pub async fn render(&self, story: &StoryData) -> StoryResult<RenderedPageSet> {
        let uris: Vec<String> = std::iter::once(story.cover_image_url.clone())
            .chain(story.pages.iter().map(|p| p.image_url.clone()))
            .collect();

        let loads = uris.into_iter().enumerate().map(|(i, uri)| {
            tokio::task::spawn_blocking(move || load_image(&uri).with_context(|| format!("image {}", i)))
        });
        let mut images = Vec::with_capacity(story.pages.len() + 1);
        for joined in futures_util::future::join_all(loads).await {
            let image = joined
                .map_err(|e| StoryError::Assembly(format!("image loader crashed: {}", e)))?
                .map_err(|e| {
                    error!("Failed to load illustration: {:#}", e);
                    StoryError::Assembly(format!("{:#}", e))
                })?;
            images.push(image);
        }
        debug!("All {} pictures loaded", images.len());

        let mut images = images.into_iter();
        let cover = images
            .next()
            .ok_or_else(|| StoryError::Assembly("cover image missing".into()))?;

        let typeface = Typeface::load(self.config.font_path.as_deref()).map_err(|e| {
            error!("Failed to load font: {:#}", e);
            StoryError::Assembly(format!("{:#}", e))
        })?;
        let surfaces = {
            let glyphs = typeface.glyphs().map_err(|e| StoryError::Assembly(format!("{:#}", e)))?;
            warn_missing_glyphs(&glyphs, &typeface, story);

            let mut surfaces = Vec::with_capacity(story.document_page_count());
            surfaces.push(PageSurface::Cover(cover));
            for (page, image) in story.pages.iter().zip(images) {
                surfaces.push(PageSurface::Text(layout_text(&glyphs, &page.text, &self.config)));
                surfaces.push(PageSurface::Illustration(image));
            }
            surfaces
        };

        Ok(RenderedPageSet {
            title: story.title.clone(),
            page_width: self.config.page_width,
            page_height: self.config.page_height,
            typeface,
            surfaces,
        })
    }
}
