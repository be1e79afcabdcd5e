use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::detector::{BoundedDetector, DetectedRegion, RegionDetector};
use crate::geometry::{BoundingBox, RasterFrame, EPSILON};
use crate::logging::PerformanceTimer;
use crate::matrix::CharacterMatrix;
use crate::text_run::TextRun;

/// Structural region attached to a matrix after fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRegion {
    /// Fractional cell-index space
    pub cell_bbox: BoundingBox,
    /// Assigned runs in reading order
    pub member_runs: Vec<Arc<TextRun>>,
    pub confidence: f32,
    pub label: Option<String>,
}

/// A real page raster to hand the detector instead of the synthetic one
#[derive(Debug, Clone, Copy)]
pub struct PageImage<'a> {
    pub image: &'a RgbImage,
    pub dpi: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionReport {
    pub detected: usize,
    pub discarded_low_confidence: usize,
    pub discarded_invalid: usize,
    pub regions: usize,
    pub assigned_runs: usize,
    pub unassigned_runs: usize,
    /// Set when the detector failed and fusion fell back to no regions
    pub detector_error: Option<String>,
}

impl FusionReport {
    pub fn degraded(&self) -> bool {
        self.detector_error.is_some()
    }
}

struct Candidate {
    index: usize,
    coverage: f32,
    confidence: f32,
    area: f32,
}

impl Candidate {
    /// Larger overlap first, then higher confidence, then the larger region.
    fn beats(&self, other: &Candidate) -> bool {
        if (self.coverage - other.coverage).abs() > EPSILON {
            return self.coverage > other.coverage;
        }
        if (self.confidence - other.confidence).abs() > EPSILON {
            return self.confidence > other.confidence;
        }
        self.area > other.area + EPSILON
    }
}

/// Reconciles a populated matrix with regions from a visual layout detector.
pub struct RegionFusionEngine {
    config: FusionConfig,
}

impl RegionFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Wraps a detector with the configured wall-clock bound.
    pub fn bounded<D: RegionDetector + 'static>(&self, detector: D) -> BoundedDetector<D> {
        BoundedDetector::new(detector, self.config.detector_timeout())
    }

    /// Synthetic page image: occupied cells become black blocks on white.
    pub fn rasterize(&self, matrix: &CharacterMatrix) -> (RgbImage, RasterFrame) {
        let frame = RasterFrame::from_dpi(self.config.raster_dpi, matrix.origin());
        let cell_px_w = matrix.cell_width * frame.scale;
        let cell_px_h = matrix.cell_height * frame.scale;
        let img_w = ((matrix.width as f32 * cell_px_w).ceil() as u32).max(1);
        let img_h = ((matrix.height as f32 * cell_px_h).ceil() as u32).max(1);

        let mut img = RgbImage::from_pixel(img_w, img_h, Rgb([255, 255, 255]));
        for (row, cells) in matrix.cells.iter().enumerate() {
            let py0 = (row as f32 * cell_px_h).floor() as u32;
            let py1 = (((row + 1) as f32 * cell_px_h).ceil() as u32).min(img_h);
            for (col, cell) in cells.iter().enumerate() {
                if !cell.is_occupied {
                    continue;
                }
                let px0 = (col as f32 * cell_px_w).floor() as u32;
                let px1 = (((col + 1) as f32 * cell_px_w).ceil() as u32).min(img_w);
                for y in py0..py1 {
                    for x in px0..px1 {
                        img.put_pixel(x, y, Rgb([0, 0, 0]));
                    }
                }
            }
        }

        (img, frame)
    }

    /// Runs the detector and attaches matched regions to `matrix`,
    /// replacing any from an earlier pass. A failing detector leaves the
    /// matrix with no regions; it never fails the page.
    pub fn fuse(
        &self,
        matrix: &mut CharacterMatrix,
        detector: &dyn RegionDetector,
        page_image: Option<PageImage<'_>>,
    ) -> FusionReport {
        let _timer = PerformanceTimer::start("region fusion");

        let detection = match page_image {
            Some(page) => {
                let frame = RasterFrame::from_dpi(page.dpi, (0.0, 0.0));
                detector
                    .detect(page.image, self.config.confidence_threshold)
                    .map(|regions| (regions, frame))
            }
            None => {
                let (img, frame) = self.rasterize(matrix);
                detector
                    .detect(&img, self.config.confidence_threshold)
                    .map(|regions| (regions, frame))
            }
        };

        match detection {
            Ok((regions, frame)) => self.fuse_detections(matrix, regions, frame),
            Err(e) => {
                crate::log_error!(e, detector.name());
                warn!("Continuing page without layout regions");
                matrix.regions.clear();
                FusionReport {
                    unassigned_runs: matrix.runs.len(),
                    detector_error: Some(e.to_string()),
                    ..FusionReport::default()
                }
            }
        }
    }

    /// Fusion from an already obtained detection result.
    pub fn fuse_detections(
        &self,
        matrix: &mut CharacterMatrix,
        detections: Vec<DetectedRegion>,
        frame: RasterFrame,
    ) -> FusionReport {
        let mut report = FusionReport {
            detected: detections.len(),
            ..FusionReport::default()
        };

        let mut regions = Vec::new();
        for detection in detections {
            let Some(pixel_bbox) = detection.bbox() else {
                report.discarded_invalid += 1;
                continue;
            };
            if detection.confidence < self.config.confidence_threshold {
                report.discarded_low_confidence += 1;
                continue;
            }
            regions.push(MatchedRegion {
                cell_bbox: self.pixel_to_cells(matrix, &frame, &pixel_bbox),
                member_runs: Vec::new(),
                confidence: detection.confidence,
                label: detection.label,
            });
        }

        if report.discarded_low_confidence > 0 {
            debug!(
                "Discarded {} regions below confidence {}",
                report.discarded_low_confidence, self.config.confidence_threshold
            );
        }

        for run in &matrix.runs {
            match self.best_region(matrix, run, &regions) {
                Some(index) => {
                    regions[index].member_runs.push(Arc::clone(run));
                    report.assigned_runs += 1;
                }
                None => report.unassigned_runs += 1,
            }
        }

        report.regions = regions.len();
        matrix.regions = regions;

        info!(
            "Fused {} regions: {} runs assigned, {} unassigned",
            report.regions, report.assigned_runs, report.unassigned_runs
        );

        report
    }

    fn pixel_to_cells(
        &self,
        matrix: &CharacterMatrix,
        frame: &RasterFrame,
        pixel_bbox: &BoundingBox,
    ) -> BoundingBox {
        frame
            .pixel_to_page(pixel_bbox)
            .to_cell_space(matrix.origin(), matrix.cell_width, matrix.cell_height)
    }

    fn best_region(
        &self,
        matrix: &CharacterMatrix,
        run: &TextRun,
        regions: &[MatchedRegion],
    ) -> Option<usize> {
        let run_cells = matrix.run_cell_bounds(run);

        let mut best: Option<Candidate> = None;
        for (index, region) in regions.iter().enumerate() {
            let coverage = run_cells.coverage_by(&region.cell_bbox);
            if coverage + EPSILON < self.config.min_overlap || coverage <= 0.0 {
                continue;
            }
            let candidate = Candidate {
                index,
                coverage,
                confidence: region.confidence,
                area: region.cell_bbox.area(),
            };
            if best.as_ref().map_or(true, |current| candidate.beats(current)) {
                best = Some(candidate);
            }
        }

        best.map(|candidate| candidate.index)
    }
}

impl Default for RegionFusionEngine {
    fn default() -> Self {
        Self::new(FusionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::StaticDetector;
    use crate::error::{ChonkerError, ChonkerResult};
    use crate::grid::AdaptiveGridSizer;

    struct BrokenDetector;

    impl RegionDetector for BrokenDetector {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
            Err(ChonkerError::detector("model weights missing"))
        }
    }

    fn run(text: &str, x0: f32, y0: f32, x1: f32, y1: f32, order: usize) -> TextRun {
        TextRun {
            text: text.to_string(),
            bbox: BoundingBox::new(x0, y0, x1, y1),
            font_size: 10.0,
            font_family: String::new(),
            bold: false,
            italic: false,
            reading_order: order,
        }
    }

    /// Cell size 6x12 with origin (0,0), so a 72 DPI frame maps
    /// pixels 1:1 onto page units.
    fn matrix() -> CharacterMatrix {
        let runs = vec![
            run("Heading", 0.0, 0.0, 42.0, 12.0, 0),
            run("body one", 0.0, 24.0, 48.0, 36.0, 1),
            run("body two", 0.0, 36.0, 48.0, 48.0, 2),
            run("stray", 90.0, 100.0, 120.0, 112.0, 3),
        ];
        let spec = AdaptiveGridSizer::default().size(&runs);
        let mut matrix = CharacterMatrix::new(&spec);
        matrix.populate(runs);
        matrix
    }

    fn frame() -> RasterFrame {
        RasterFrame::from_dpi(72.0, (0.0, 0.0))
    }

    #[test]
    fn test_rasterize_marks_occupied_cells() {
        let engine = RegionFusionEngine::new(FusionConfig {
            raster_dpi: 72.0,
            ..FusionConfig::default()
        });
        let m = matrix();
        let (img, frame) = engine.rasterize(&m);

        assert_eq!(frame.scale, 1.0);
        assert_eq!(img.width(), (m.width as f32 * 6.0).ceil() as u32);
        assert_eq!(*img.get_pixel(2, 2), Rgb([0, 0, 0]));
        // Row 1 is blank between the heading and the body
        assert_eq!(*img.get_pixel(2, 14), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_default_raster_is_300_dpi() {
        let engine = RegionFusionEngine::default();
        let m = matrix();
        let (img, frame) = engine.rasterize(&m);
        assert!((frame.scale - 300.0 / 72.0).abs() < 1e-4);
        assert!(img.width() >= (m.width as f32 * 6.0 * 4.0) as u32);
    }

    #[test]
    fn test_runs_assigned_by_overlap() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        let report = engine.fuse_detections(
            &mut m,
            vec![
                DetectedRegion::new(BoundingBox::new(0.0, 0.0, 60.0, 14.0), 0.9, Some("Title")),
                DetectedRegion::new(BoundingBox::new(0.0, 22.0, 60.0, 50.0), 0.8, Some("Text")),
            ],
            frame(),
        );

        assert_eq!(report.regions, 2);
        assert_eq!(report.assigned_runs, 3);
        assert_eq!(report.unassigned_runs, 1);
        assert_eq!(m.regions[0].member_runs.len(), 1);
        assert_eq!(m.region_text(&m.regions[1]), "body one body two");
        assert_eq!(m.regions[1].cell_bbox, BoundingBox::new(0.0, 22.0 / 12.0, 10.0, 50.0 / 12.0));

        let unassigned = m.unassigned_runs();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].text, "stray");
    }

    #[test]
    fn test_low_confidence_regions_discarded() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        let detector = StaticDetector::new(vec![DetectedRegion::new(
            BoundingBox::new(0.0, 0.0, 10_000.0, 10_000.0),
            0.3,
            None,
        )]);
        let report = engine.fuse(&mut m, &detector, None);

        assert_eq!(report.discarded_low_confidence, 1);
        assert!(m.regions.is_empty());
        assert_eq!(m.unassigned_runs().len(), 4);
    }

    #[test]
    fn test_minimum_overlap_threshold() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        // Covers 3 of the heading's 42 units of width: about 7%
        engine.fuse_detections(
            &mut m,
            vec![DetectedRegion::new(BoundingBox::new(39.0, 0.0, 80.0, 12.0), 0.9, None)],
            frame(),
        );
        assert!(m.regions[0].member_runs.is_empty());

        // Covers 6 of 42 units: about 14%
        engine.fuse_detections(
            &mut m,
            vec![DetectedRegion::new(BoundingBox::new(36.0, 0.0, 80.0, 12.0), 0.9, None)],
            frame(),
        );
        assert_eq!(m.regions[0].member_runs.len(), 1);
    }

    #[test]
    fn test_overlap_ties_prefer_confidence_then_size() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        let heading = BoundingBox::new(0.0, 0.0, 42.0, 12.0);

        engine.fuse_detections(
            &mut m,
            vec![
                DetectedRegion::new(heading, 0.6, Some("low")),
                DetectedRegion::new(heading, 0.9, Some("high")),
            ],
            frame(),
        );
        assert_eq!(m.regions[1].member_runs.len(), 1);
        assert!(m.regions[0].member_runs.is_empty());

        engine.fuse_detections(
            &mut m,
            vec![
                DetectedRegion::new(heading, 0.9, Some("small")),
                DetectedRegion::new(BoundingBox::new(0.0, 0.0, 200.0, 13.0), 0.9, Some("large")),
            ],
            frame(),
        );
        assert!(m.regions[0].member_runs.is_empty());
        assert_eq!(m.regions[1].label.as_deref(), Some("large"));
        assert_eq!(m.regions[1].member_runs[0].text, "Heading");
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let engine = RegionFusionEngine::default();
        let detector = StaticDetector::new(vec![
            DetectedRegion::new(BoundingBox::new(0.0, 0.0, 250.0, 60.0), 0.9, Some("Text")),
            DetectedRegion::new(BoundingBox::new(0.0, 90.0, 600.0, 250.0), 0.7, Some("Text")),
        ]);
        let mut m = matrix();

        engine.fuse(&mut m, &detector, None);
        let first = m.regions.clone();
        engine.fuse(&mut m, &detector, None);
        assert_eq!(m.regions, first);
    }

    #[test]
    fn test_run_never_in_two_regions() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        engine.fuse_detections(
            &mut m,
            vec![
                DetectedRegion::new(BoundingBox::new(0.0, 0.0, 120.0, 120.0), 0.9, None),
                DetectedRegion::new(BoundingBox::new(0.0, 0.0, 60.0, 60.0), 0.8, None),
                DetectedRegion::new(BoundingBox::new(0.0, 20.0, 50.0, 40.0), 0.95, None),
            ],
            frame(),
        );

        let mut seen = std::collections::HashSet::new();
        for region in &m.regions {
            for member in &region.member_runs {
                assert!(seen.insert(member.reading_order), "run {} duplicated", member.reading_order);
            }
        }
        assert_eq!(seen.len() + m.unassigned_runs().len(), m.runs.len());
    }

    #[test]
    fn test_detector_failure_degrades_to_no_regions() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        engine.fuse_detections(
            &mut m,
            vec![DetectedRegion::new(BoundingBox::new(0.0, 0.0, 60.0, 14.0), 0.9, None)],
            frame(),
        );
        assert_eq!(m.regions.len(), 1);

        let report = engine.fuse(&mut m, &BrokenDetector, None);
        assert!(report.degraded());
        assert!(m.regions.is_empty());
        assert_eq!(report.unassigned_runs, 4);
        assert_eq!(m.unassigned_runs().len(), 4);
    }

    #[test]
    fn test_page_image_uses_its_own_dpi() {
        let engine = RegionFusionEngine::default();
        let mut m = matrix();
        let page = RgbImage::new(10, 10);
        // 144 DPI: pixel box (0,0)-(120,28) is page (0,0)-(60,14)
        let detector = StaticDetector::new(vec![DetectedRegion::new(
            BoundingBox::new(0.0, 0.0, 120.0, 28.0),
            0.9,
            None,
        )]);
        engine.fuse(&mut m, &detector, Some(PageImage { image: &page, dpi: 144.0 }));
        assert_eq!(m.regions[0].cell_bbox, BoundingBox::new(0.0, 0.0, 10.0, 14.0 / 12.0));
        assert_eq!(m.regions[0].member_runs[0].text, "Heading");
    }
}
