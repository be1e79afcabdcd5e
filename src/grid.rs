use std::collections::HashMap;

use crate::config::GridConfig;
use crate::geometry::BoundingBox;
use crate::text_run::TextRun;

/// Cell size and grid dimensions for one page
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub cell_width: f32,
    pub cell_height: f32,
    pub modal_font_size: f32,
    /// Union of all run boxes; its lower-left corner is the grid origin
    pub content: BoundingBox,
}

impl GridSpec {
    pub fn origin(&self) -> (f32, f32) {
        (self.content.x0, self.content.y0)
    }
}

/// Derives the smallest grid that holds a page's text without clipping.
pub struct AdaptiveGridSizer {
    config: GridConfig,
    fallback_font_size: f32,
}

impl AdaptiveGridSizer {
    pub fn new(config: GridConfig, fallback_font_size: f32) -> Self {
        Self {
            config,
            fallback_font_size,
        }
    }

    /// Most frequent rounded font size; ties go to the smaller size.
    pub fn modal_font_size(runs: &[TextRun]) -> Option<f32> {
        let mut font_size_counts: HashMap<i32, usize> = HashMap::new();
        for run in runs {
            let rounded_size = (run.font_size.round() as i32).max(1);
            *font_size_counts.entry(rounded_size).or_insert(0) += 1;
        }

        font_size_counts
            .into_iter()
            .max_by(|(size_a, count_a), (size_b, count_b)| {
                count_a.cmp(count_b).then_with(|| size_b.cmp(size_a))
            })
            .map(|(size, _)| size as f32)
    }

    pub fn content_bounds(runs: &[TextRun]) -> Option<BoundingBox> {
        runs.iter()
            .map(|run| run.bbox)
            .reduce(|acc, bbox| acc.union(&bbox))
    }

    pub fn size(&self, runs: &[TextRun]) -> GridSpec {
        let modal_font_size = Self::modal_font_size(runs).unwrap_or(self.fallback_font_size);
        let cell_width = modal_font_size * self.config.cell_width_ratio;
        let cell_height = modal_font_size * self.config.cell_height_ratio;
        assert!(
            cell_width > 0.0 && cell_height > 0.0,
            "cell size must be positive, got {}x{}",
            cell_width,
            cell_height
        );

        let content = Self::content_bounds(runs).unwrap_or_default();
        let width = self.cells_for(content.width(), cell_width);
        let height = self.cells_for(content.height(), cell_height);

        GridSpec {
            width,
            height,
            cell_width,
            cell_height,
            modal_font_size,
            content,
        }
    }

    fn cells_for(&self, extent: f32, cell: f32) -> usize {
        let mut cells = (extent / cell).ceil().max(0.0) as usize;
        // ceil() on a rounded quotient can land one short of the extent
        while (cells as f32) * cell < extent {
            cells += 1;
        }
        cells.max(self.config.min_cells.max(1))
    }
}

impl Default for AdaptiveGridSizer {
    fn default() -> Self {
        Self::new(GridConfig::default(), 12.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str, bbox: BoundingBox, font_size: f32, order: usize) -> TextRun {
        TextRun {
            text: text.to_string(),
            bbox,
            font_size,
            font_family: String::new(),
            bold: false,
            italic: false,
            reading_order: order,
        }
    }

    #[test]
    fn test_modal_size_prefers_smaller_on_tie() {
        let runs = vec![
            run("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 10.2, 0),
            run("b", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 14.0, 1),
            run("c", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 9.8, 2),
            run("d", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 13.6, 3),
        ];
        assert_eq!(AdaptiveGridSizer::modal_font_size(&runs), Some(10.0));
    }

    #[test]
    fn test_hello_world_grid() {
        let runs = vec![
            run("Hello", BoundingBox::new(0.0, 0.0, 30.0, 12.0), 12.0, 0),
            run("World", BoundingBox::new(40.0, 0.0, 70.0, 12.0), 12.0, 1),
        ];
        let sizer = AdaptiveGridSizer::new(
            GridConfig {
                min_cells: 1,
                ..GridConfig::default()
            },
            12.0,
        );
        let spec = sizer.size(&runs);

        assert!((spec.cell_width - 7.2).abs() < 1e-4);
        assert!((spec.cell_height - 14.4).abs() < 1e-4);
        assert_eq!(spec.width, 10);
        assert_eq!(spec.height, 1);
        assert_eq!(spec.origin(), (0.0, 0.0));
    }

    #[test]
    fn test_floor_applies_to_small_pages() {
        let runs = vec![run("x", BoundingBox::new(100.0, 100.0, 106.0, 112.0), 12.0, 0)];
        let spec = AdaptiveGridSizer::default().size(&runs);
        assert_eq!(spec.width, 10);
        assert_eq!(spec.height, 10);
        assert_eq!(spec.origin(), (100.0, 100.0));
    }

    #[test]
    fn test_empty_page_yields_floor_grid() {
        let spec = AdaptiveGridSizer::default().size(&[]);
        assert_eq!((spec.width, spec.height), (10, 10));
        assert_eq!(spec.modal_font_size, 12.0);
    }

    #[test]
    fn test_no_clip_guarantee() {
        let sizer = AdaptiveGridSizer::new(
            GridConfig {
                min_cells: 1,
                ..GridConfig::default()
            },
            12.0,
        );
        for (i, extent) in [72.0_f32, 7.2, 143.99, 612.0, 1000.3].iter().enumerate() {
            let runs = vec![
                run("a", BoundingBox::new(3.0, 5.0, 3.0 + extent, 5.0 + extent / 2.0), 12.0, 0),
                run("b", BoundingBox::new(3.0, 5.0, 9.0, 9.0), 11.0 + i as f32, 1),
            ];
            let spec = sizer.size(&runs);
            assert!(spec.width as f32 * spec.cell_width >= spec.content.width());
            assert!(spec.height as f32 * spec.cell_height >= spec.content.height());
        }
    }
}
