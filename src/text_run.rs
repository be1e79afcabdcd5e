use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NormalizerConfig;
use crate::error::ChonkerResult;
use crate::geometry::BoundingBox;

/// Font descriptor as reported by the extraction library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FontDescriptor {
    #[serde(default)]
    pub size: Option<f32>,
    #[serde(default)]
    pub family: Option<String>,
    /// CSS-style weight, 400 regular, 700 bold
    #[serde(default)]
    pub weight: Option<u16>,
    #[serde(default)]
    pub italic: Option<bool>,
}

/// One positioned text fragment straight out of the extraction source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTextRecord {
    pub text: String,
    /// Four corners in page units, any winding order
    #[serde(default)]
    pub quad: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    pub font: FontDescriptor,
}

impl RawTextRecord {
    pub fn new(text: impl Into<String>, bbox: BoundingBox, font_size: Option<f32>) -> Self {
        Self {
            text: text.into(),
            quad: Some(vec![
                [bbox.x0, bbox.y0],
                [bbox.x1, bbox.y0],
                [bbox.x1, bbox.y1],
                [bbox.x0, bbox.y1],
            ]),
            font: FontDescriptor {
                size: font_size,
                ..FontDescriptor::default()
            },
        }
    }
}

/// Normalized, immutable text run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub bbox: BoundingBox,
    pub font_size: f32,
    pub font_family: String,
    pub bold: bool,
    pub italic: bool,
    /// Extraction sequence, strictly increasing within a page
    pub reading_order: usize,
}

impl TextRun {
    pub fn glyph_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Result of normalizing one page worth of records
#[derive(Debug, Clone, Default)]
pub struct NormalizedPage {
    pub runs: Vec<TextRun>,
    /// Records with missing or unusable coordinates
    pub dropped: usize,
    /// Records whose trimmed text was empty
    pub blank: usize,
}

/// Turns raw extraction records into ordered `TextRun`s.
pub struct TextRunNormalizer {
    config: NormalizerConfig,
}

impl TextRunNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, records: &[RawTextRecord]) -> NormalizedPage {
        let mut page = NormalizedPage::default();

        for record in records {
            if record.text.trim().is_empty() {
                page.blank += 1;
                continue;
            }

            let bbox = match record.quad.as_deref().and_then(quad_bounds) {
                Some(bbox) => bbox,
                None => {
                    debug!("Dropping record without usable coordinates: {:?}", record.text);
                    page.dropped += 1;
                    continue;
                }
            };

            let font_size = match record.font.size {
                Some(size) if size.is_finite() && size > 0.0 => size,
                _ => self.config.fallback_font_size,
            };

            let family = record.font.family.clone().unwrap_or_default();
            let lowered = family.to_lowercase();
            let bold = record.font.weight.map(|w| w >= 600).unwrap_or(false) || lowered.contains("bold");
            let italic = record.font.italic.unwrap_or(false)
                || lowered.contains("italic")
                || lowered.contains("oblique");

            page.runs.push(TextRun {
                text: record.text.clone(),
                bbox,
                font_size,
                font_family: family,
                bold,
                italic,
                reading_order: page.runs.len(),
            });
        }

        if page.dropped > 0 {
            warn!(
                "Dropped {} malformed text records out of {}",
                page.dropped,
                records.len()
            );
        }

        page
    }

    /// Parses a JSON array of records and normalizes it.
    pub fn normalize_json(&self, json: &str) -> ChonkerResult<NormalizedPage> {
        let records: Vec<RawTextRecord> = serde_json::from_str(json)?;
        Ok(self.normalize(&records))
    }
}

impl Default for TextRunNormalizer {
    fn default() -> Self {
        Self::new(NormalizerConfig::default())
    }
}

fn quad_bounds(quad: &[[f32; 2]]) -> Option<BoundingBox> {
    if quad.len() != 4 {
        return None;
    }
    BoundingBox::from_points(quad)
}
