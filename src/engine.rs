use tracing::{debug, info};

use crate::config::ChonkerConfig;
use crate::detector::RegionDetector;
use crate::error::ChonkerResult;
use crate::fusion::{FusionReport, PageImage, RegionFusionEngine};
use crate::grid::AdaptiveGridSizer;
use crate::logging::PerformanceTimer;
use crate::matrix::CharacterMatrix;
use crate::text_run::{RawTextRecord, TextRunNormalizer};

/// A populated matrix plus what was lost on the way in
#[derive(Debug, Clone)]
pub struct MatrixBuild {
    pub matrix: CharacterMatrix,
    /// Records rejected for missing or malformed coordinates
    pub dropped_records: usize,
    /// Glyphs that fell past the right edge
    pub truncated_glyphs: usize,
}

/// End-to-end page pipeline: normalize, size, populate, fuse.
pub struct CharacterMatrixEngine {
    normalizer: TextRunNormalizer,
    sizer: AdaptiveGridSizer,
    fusion: RegionFusionEngine,
}

impl CharacterMatrixEngine {
    pub fn new(config: &ChonkerConfig) -> Self {
        Self {
            normalizer: TextRunNormalizer::new(config.normalizer.clone()),
            sizer: AdaptiveGridSizer::new(config.grid.clone(), config.normalizer.fallback_font_size),
            fusion: RegionFusionEngine::new(config.fusion.clone()),
        }
    }

    pub fn fusion(&self) -> &RegionFusionEngine {
        &self.fusion
    }

    pub fn build_page(&self, records: &[RawTextRecord]) -> MatrixBuild {
        let timer = PerformanceTimer::start("matrix build");

        // Step 1: Normalize raw extraction records into ordered runs
        let page = self.normalizer.normalize(records);
        timer.checkpoint("normalized");

        // Step 2: Size the grid from the modal font size and content bounds
        let spec = self.sizer.size(&page.runs);
        debug!(
            "Grid {}x{} cells of {:.1}x{:.1}pt (modal font {})",
            spec.width, spec.height, spec.cell_width, spec.cell_height, spec.modal_font_size
        );

        // Step 3: Place every run's glyphs
        let mut matrix = CharacterMatrix::new(&spec);
        let report = matrix.populate(page.runs);

        info!(
            "Built {}x{} matrix: {} runs, {} glyphs placed, {} truncated, {} records dropped",
            matrix.width,
            matrix.height,
            matrix.runs.len(),
            report.placed,
            report.truncated,
            page.dropped
        );

        MatrixBuild {
            matrix,
            dropped_records: page.dropped,
            truncated_glyphs: report.truncated,
        }
    }

    /// Builds a page from a JSON array of raw records.
    pub fn build_page_json(&self, json: &str) -> ChonkerResult<MatrixBuild> {
        let records: Vec<RawTextRecord> = serde_json::from_str(json)?;
        Ok(self.build_page(&records))
    }

    /// Fuses with `detector` held to `fusion.detector_timeout_ms`. Pass an
    /// `Arc` to keep using the same detector afterwards.
    pub fn fuse<D: RegionDetector + 'static>(
        &self,
        matrix: &mut CharacterMatrix,
        detector: D,
        page_image: Option<PageImage<'_>>,
    ) -> FusionReport {
        let detector = self.fusion.bounded(detector);
        self.fusion.fuse(matrix, &detector, page_image)
    }

    pub fn process_page<D: RegionDetector + 'static>(
        &self,
        records: &[RawTextRecord],
        detector: D,
        page_image: Option<PageImage<'_>>,
    ) -> (MatrixBuild, FusionReport) {
        let mut build = self.build_page(records);
        let report = self.fuse(&mut build.matrix, detector, page_image);
        (build, report)
    }
}

impl Default for CharacterMatrixEngine {
    fn default() -> Self {
        Self::new(&ChonkerConfig::default())
    }
}
