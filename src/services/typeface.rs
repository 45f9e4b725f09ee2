use anyhow::{bail, Context, Result};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use ttf_parser::{Face, GlyphId};

const BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSerif.ttf");
const BUNDLED_NAME: &str = "DejaVuSerif";

/// A TrueType face that text pages are measured with and embedded in.
#[derive(Clone)]
pub struct Typeface {
    name: String,
    data: Cow<'static, [u8]>,
}

impl fmt::Debug for Typeface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Typeface")
            .field("name", &self.name)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Default for Typeface {
    fn default() -> Self {
        Self::bundled()
    }
}

impl Typeface {
    pub fn bundled() -> Self {
        Self {
            name: BUNDLED_NAME.to_string(),
            data: Cow::Borrowed(BUNDLED_FONT),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
        if data.starts_with(b"ttcf") {
            bail!("{} is a font collection; use a single .ttf file", path.display());
        }
        let outlines = Face::parse(&data, 0)
            .with_context(|| format!("{} is not a TrueType font", path.display()))?
            .tables()
            .glyf
            .is_some();
        if !outlines {
            bail!("{} has no TrueType outlines", path.display());
        }
        // PDF names may not carry whitespace or delimiters.
        let name: String = path
            .file_stem()
            .map(|s| s.to_string_lossy().chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect())
            .unwrap_or_default();
        Ok(Self {
            name: if name.is_empty() { "Custom".to_string() } else { name },
            data: Cow::Owned(data),
        })
    }

    /// The configured font file, or the bundled serif.
    pub fn load(font_path: Option<&Path>) -> Result<Self> {
        match font_path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::bundled()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn glyphs(&self) -> Result<Glyphs<'_>> {
        let face = Face::parse(&self.data, 0).context("font could not be parsed")?;
        let units_per_em = f32::from(face.units_per_em().max(1));
        Ok(Glyphs { face, units_per_em })
    }
}

/// Font-wide numbers for the PDF font descriptor, in 1/1000 em.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub ascent: i64,
    pub descent: i64,
    pub cap_height: i64,
    pub bbox: [i64; 4],
    pub italic_angle: f32,
}

/// Glyph lookup and measurement over a parsed face.
pub struct Glyphs<'a> {
    face: Face<'a>,
    units_per_em: f32,
}

impl Glyphs<'_> {
    fn scaled(&self, units: i16) -> i64 {
        (f32::from(units) * 1000.0 / self.units_per_em).round() as i64
    }

    /// Glyph index for `c`; 0 is `.notdef`.
    pub fn glyph_id(&self, c: char) -> u16 {
        self.face.glyph_index(c).map(|g| g.0).unwrap_or(0)
    }

    pub fn has_glyph(&self, c: char) -> bool {
        self.face.glyph_index(c).is_some()
    }

    /// Advance width in 1/1000 em, the PDF glyph space unit.
    pub fn advance(&self, c: char) -> f32 {
        let advance = self.face.glyph_hor_advance(GlyphId(self.glyph_id(c))).unwrap_or(0);
        f32::from(advance) * 1000.0 / self.units_per_em
    }

    pub fn text_width(&self, text: &str, font_size: f32) -> f32 {
        text.chars().map(|c| self.advance(c)).sum::<f32>() * font_size / 1000.0
    }

    pub fn metrics(&self) -> FontMetrics {
        let bbox = self.face.global_bounding_box();
        let ascent = self.scaled(self.face.ascender());
        FontMetrics {
            ascent,
            descent: self.scaled(self.face.descender()),
            cap_height: self.face.capital_height().map(|h| self.scaled(h)).unwrap_or(ascent),
            bbox: [
                self.scaled(bbox.x_min),
                self.scaled(bbox.y_min),
                self.scaled(bbox.x_max),
                self.scaled(bbox.y_max),
            ],
            italic_angle: self.face.italic_angle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_font_measures_real_advances() {
        let typeface = Typeface::bundled();
        let glyphs = typeface.glyphs().unwrap();

        assert!(glyphs.advance('W') > glyphs.advance('i'));
        assert!(glyphs.advance('m') > glyphs.advance('n'));
        let width = glyphs.text_width("Hello", 20.0);
        assert!(width > 40.0 && width < 80.0, "width {}", width);
        let joined = glyphs.text_width("ab", 10.0);
        assert!((joined - glyphs.text_width("a", 10.0) - glyphs.text_width("b", 10.0)).abs() < 1e-3);
    }

    #[test]
    fn test_latin_extended_is_covered_but_cjk_is_not() {
        let typeface = Typeface::bundled();
        let glyphs = typeface.glyphs().unwrap();

        assert!(glyphs.has_glyph('Ł'));
        assert!(glyphs.has_glyph('é'));
        assert!(!glyphs.has_glyph('松'));
        assert_eq!(glyphs.glyph_id('松'), 0);
    }

    #[test]
    fn test_metrics_are_in_thousandths_of_an_em() {
        let metrics = Typeface::bundled().glyphs().unwrap().metrics();
        assert!(metrics.ascent > 500 && metrics.ascent < 1200);
        assert!(metrics.descent < 0);
        assert!(metrics.bbox[2] > metrics.bbox[0]);
    }

    #[test]
    fn test_font_file_is_loaded_and_named() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("My Font.ttf");
        std::fs::write(&path, Typeface::bundled().data()).unwrap();

        let typeface = Typeface::load(Some(&path)).unwrap();
        assert_eq!(typeface.name(), "MyFont");
        assert!(typeface.glyphs().unwrap().has_glyph('A'));
    }

    #[test]
    fn test_non_font_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.ttf");
        std::fs::write(&path, b"not a font").unwrap();

        assert!(Typeface::from_file(&path).is_err());

        let collection = dir.path().join("family.ttc");
        std::fs::write(&collection, b"ttcf\0\x01\0\0").unwrap();
        let err = Typeface::from_file(&collection).unwrap_err();
        assert!(err.to_string().contains("font collection"));

        assert!(Typeface::load(Some(&dir.path().join("missing.ttf"))).is_err());
    }
}
