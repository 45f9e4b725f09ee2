use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use log::{debug, error, info};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, ObjectId, Stream, StringFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::core::error::{StoryError, StoryResult};
use crate::services::render::{PageSurface, RenderedPageSet, TextLayout};
use crate::services::typeface::{Glyphs, Typeface};

/// Physical page format and raster settings shared by the renderer and the
/// assembler. Units are PDF points at 96 DPI-equivalent CSS pixels.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PdfConfig {
    #[serde(default = "default_page_width")]
    pub page_width: f32,
    #[serde(default = "default_page_height")]
    pub page_height: f32,
    /// Raster resolution multiplier, a quality/size trade-off.
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_margin")]
    pub margin: f32,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    /// TrueType font for the story text. The bundled DejaVu Serif has no
    /// CJK glyphs, so stories in those scripts need one that does.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            page_width: default_page_width(),
            page_height: default_page_height(),
            scale: default_scale(),
            jpeg_quality: default_jpeg_quality(),
            margin: default_margin(),
            font_size: default_font_size(),
            font_path: None,
        }
    }
}

// A5 landscape.
fn default_page_width() -> f32 {
    842.0
}
fn default_page_height() -> f32 {
    595.0
}
fn default_scale() -> f32 {
    1.5
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_margin() -> f32 {
    48.0
}
fn default_font_size() -> f32 {
    22.0
}

/// The finished storybook PDF.
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub page_count: usize,
}

/// A page after rasterization, ready to be placed in the PDF.
enum PageContent {
    Raster { jpeg: Vec<u8>, width: u32, height: u32 },
    Text(TextLayout),
}

const TEXT_COLOR: [f32; 3] = [0.118, 0.161, 0.231];
const COVER_BACKDROP: Rgb<u8> = Rgb([241, 245, 249]);
const PAGE_BACKDROP: Rgb<u8> = Rgb([255, 255, 255]);

pub struct DocumentAssembler {
    config: PdfConfig,
}

impl DocumentAssembler {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }

    /// Builds one PDF page per surface, in order. Rasterization runs off the
    /// async executor.
    pub async fn assemble(&self, pages: RenderedPageSet) -> StoryResult<Document> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || assemble_blocking(&config, &pages))
            .await
            .map_err(|e| StoryError::Assembly(format!("assembler crashed: {}", e)))?
            .map_err(|e| {
                error!("Failed to assemble storybook: {:#}", e);
                StoryError::Assembly(format!("{:#}", e))
            })
    }
}

fn raster_size(config: &PdfConfig, pages: &RenderedPageSet) -> (u32, u32) {
    let scale = config.scale.max(0.1);
    (
        (pages.page_width * scale).round().max(1.0) as u32,
        (pages.page_height * scale).round().max(1.0) as u32,
    )
}

fn encode_jpeg(canvas: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(canvas)
        .context("JPEG encoding failed")?;
    Ok(out)
}

/// Crops to cover the whole page, like `object-fit: cover`.
fn rasterize_cover(image: &DynamicImage, width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, COVER_BACKDROP);
    let filled = image.resize_to_fill(width, height, FilterType::Lanczos3).to_rgb8();
    image::imageops::overlay(&mut canvas, &filled, 0, 0);
    canvas
}

/// Fits inside the margins keeping the aspect ratio, centred on a white page.
fn rasterize_illustration(image: &DynamicImage, width: u32, height: u32, margin: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, PAGE_BACKDROP);
    let inner_w = width.saturating_sub(2 * margin).max(1);
    let inner_h = height.saturating_sub(2 * margin).max(1);
    let fitted = image.resize(inner_w, inner_h, FilterType::Lanczos3).to_rgb8();
    let x = (width - fitted.width()) / 2;
    let y = (height - fitted.height()) / 2;
    image::imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    canvas
}

fn rasterize(config: &PdfConfig, pages: &RenderedPageSet, surface: &PageSurface) -> Result<PageContent> {
    let (width, height) = raster_size(config, pages);
    let canvas = match surface {
        PageSurface::Cover(image) => rasterize_cover(image, width, height),
        PageSurface::Illustration(image) => {
            let margin = (config.margin * config.scale.max(0.1)).round() as u32;
            rasterize_illustration(image, width, height, margin)
        }
        PageSurface::Text(layout) => return Ok(PageContent::Text(layout.clone())),
    };
    Ok(PageContent::Raster {
        jpeg: encode_jpeg(&canvas, config.jpeg_quality)?,
        width,
        height,
    })
}

/// Story characters numbered from CID 1. Text is written as two-byte CIDs
/// through an Identity-H Type0 font, so any script the font file covers
/// can be drawn, and extracted again through the ToUnicode map.
struct CharCodes {
    chars: Vec<char>,
    codes: HashMap<char, u16>,
}

impl CharCodes {
    fn collect<'a>(layouts: impl Iterator<Item = &'a TextLayout>) -> Result<Self> {
        let chars: Vec<char> = layouts
            .flat_map(|l| l.lines.iter().flat_map(|line| line.chars()))
            .collect::<BTreeSet<char>>()
            .into_iter()
            .collect();
        if chars.len() >= usize::from(u16::MAX) {
            bail!("story uses {} distinct characters", chars.len());
        }
        let codes = chars.iter().enumerate().map(|(i, &c)| (c, i as u16 + 1)).collect();
        Ok(Self { chars, codes })
    }

    fn encode(&self, text: &str) -> Vec<u8> {
        text.chars()
            .flat_map(|c| self.codes.get(&c).copied().unwrap_or(0).to_be_bytes())
            .collect()
    }

    fn cid_to_gid_map(&self, glyphs: &Glyphs) -> Vec<u8> {
        std::iter::once(0)
            .chain(self.chars.iter().map(|&c| glyphs.glyph_id(c)))
            .flat_map(u16::to_be_bytes)
            .collect()
    }

    fn widths(&self, glyphs: &Glyphs) -> Vec<Object> {
        let widths: Vec<Object> = self
            .chars
            .iter()
            .map(|&c| Object::Integer(glyphs.advance(c).round() as i64))
            .collect();
        vec![1.into(), Object::Array(widths)]
    }

    fn to_unicode_cmap(&self) -> Vec<u8> {
        let mut cmap = String::from(
            "/CIDInit /ProcSet findresource begin\n\
             12 dict begin\n\
             begincmap\n\
             /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
             /CMapName /Adobe-Identity-UCS def\n\
             /CMapType 2 def\n\
             1 begincodespacerange\n\
             <0000> <FFFF>\n\
             endcodespacerange\n",
        );
        // bfchar sections hold at most 100 entries.
        for (n, chunk) in self.chars.chunks(100).enumerate() {
            cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
            for (i, c) in chunk.iter().enumerate() {
                let mut units = [0u16; 2];
                let target: String = c.encode_utf16(&mut units).iter().map(|u| format!("{:04X}", u)).collect();
                cmap.push_str(&format!("<{:04X}> <{}>\n", n * 100 + i + 1, target));
            }
            cmap.push_str("endbfchar\n");
        }
        cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
        cmap.into_bytes()
    }
}

/// Embeds the face as a Type0/CIDFontType2 font and returns its id.
fn embed_font(doc: &mut lopdf::Document, typeface: &Typeface, codes: &CharCodes) -> Result<ObjectId> {
    let glyphs = typeface.glyphs()?;
    let metrics = glyphs.metrics();
    let name = typeface.name();

    let font_file_id = doc.add_object(Stream::new(
        dictionary! { "Length1" => typeface.data().len() as i64 },
        typeface.data().to_vec(),
    ));
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => name,
        // Serif, nonsymbolic.
        "Flags" => 34,
        "FontBBox" => metrics.bbox.iter().map(|&v| Object::Integer(v)).collect::<Vec<_>>(),
        "ItalicAngle" => metrics.italic_angle,
        "Ascent" => metrics.ascent,
        "Descent" => metrics.descent,
        "CapHeight" => metrics.cap_height,
        "StemV" => 80,
        "FontFile2" => font_file_id,
    });
    let cid_to_gid_id = doc.add_object(Stream::new(dictionary! {}, codes.cid_to_gid_map(&glyphs)));
    let descendant_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => name,
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
        "W" => codes.widths(&glyphs),
        "CIDToGIDMap" => cid_to_gid_id,
    });
    let to_unicode_id = doc.add_object(Stream::new(dictionary! {}, codes.to_unicode_cmap()));
    Ok(doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => name,
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::Reference(descendant_id)],
        "ToUnicode" => to_unicode_id,
    }))
}

fn text_operations(layout: &TextLayout, codes: &CharCodes) -> Vec<Operation> {
    let mut ops = vec![
        Operation::new("BT", vec![]),
        Operation::new("rg", TEXT_COLOR.iter().map(|&c| c.into()).collect()),
        Operation::new("Tf", vec!["F1".into(), layout.font_size.into()]),
        Operation::new("TL", vec![layout.line_height.into()]),
        Operation::new("Td", vec![layout.x.into(), layout.y.into()]),
    ];
    for (i, line) in layout.lines.iter().enumerate() {
        if i > 0 {
            ops.push(Operation::new("T*", vec![]));
        }
        ops.push(Operation::new(
            "Tj",
            vec![Object::String(codes.encode(line), StringFormat::Hexadecimal)],
        ));
    }
    ops.push(Operation::new("ET", vec![]));
    ops
}

/// PDF text string: UTF-16BE behind a byte order mark.
fn text_string(text: &str) -> Object {
    let bytes: Vec<u8> = [0xFE, 0xFF]
        .into_iter()
        .chain(text.encode_utf16().flat_map(u16::to_be_bytes))
        .collect();
    Object::String(bytes, StringFormat::Hexadecimal)
}

fn image_operations(page_width: f32, page_height: f32) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![page_width.into(), 0.into(), 0.into(), page_height.into(), 0.into(), 0.into()],
        ),
        Operation::new("Do", vec!["Im0".into()]),
        Operation::new("Q", vec![]),
    ]
}

fn assemble_blocking(config: &PdfConfig, pages: &RenderedPageSet) -> Result<Document> {
    if pages.is_empty() {
        anyhow::bail!("nothing to assemble");
    }
    info!("Assembling {} pages at {}x scale", pages.len(), config.scale);

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let codes = CharCodes::collect(pages.surfaces.iter().filter_map(|s| match s {
        PageSurface::Text(layout) => Some(layout),
        _ => None,
    }))?;
    let font_id = embed_font(&mut doc, &pages.typeface, &codes).context("failed to embed font")?;
    let media_box: Vec<Object> = vec![0.into(), 0.into(), pages.page_width.into(), pages.page_height.into()];

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for (i, surface) in pages.surfaces.iter().enumerate() {
        let content = rasterize(config, pages, surface).with_context(|| format!("page {}", i + 1))?;

        let (operations, resources) = match content {
            PageContent::Raster { jpeg, width, height } => {
                debug!("Page {}: {}x{} raster, {} bytes", i + 1, width, height, jpeg.len());
                let image_id = doc.add_object(Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => width as i64,
                        "Height" => height as i64,
                        "ColorSpace" => "DeviceRGB",
                        "BitsPerComponent" => 8,
                        "Filter" => "DCTDecode",
                    },
                    jpeg,
                ));
                (
                    image_operations(pages.page_width, pages.page_height),
                    dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
                )
            }
            PageContent::Text(layout) => (
                text_operations(&layout, &codes),
                dictionary! { "Font" => dictionary! { "F1" => font_id } },
            ),
        };

        let encoded = Content { operations }.encode().context("failed to encode page content")?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => media_box.clone(),
            "Contents" => content_id,
            "Resources" => resources,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => text_string(&pages.title),
        "Producer" => Object::string_literal("storyflip"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    doc.compress();
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).context("failed to write PDF")?;
    Ok(Document { bytes, page_count })
}
