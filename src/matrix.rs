use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ChonkerError, ChonkerResult};
use crate::fusion::MatchedRegion;
use crate::geometry::{BoundingBox, CellCoord};
use crate::grid::GridSpec;
use crate::text_run::TextRun;

/// Non-owning handle to a run, keyed by its reading order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterCell {
    pub glyph: Option<char>,
    pub source_run: Option<RunId>,
    pub is_occupied: bool,
}

/// Spatial character grid for one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterMatrix {
    pub width: usize,
    pub height: usize,
    pub cell_width: f32,
    pub cell_height: f32,
    /// Content bounds; `(x0, y0)` is the grid origin
    pub content: BoundingBox,
    pub cells: Vec<Vec<CharacterCell>>,
    /// Runs in reading order, owned by the matrix
    pub runs: Vec<Arc<TextRun>>,
    /// Structural regions attached by the last fusion pass
    pub regions: Vec<MatchedRegion>,
}

/// Diagnostics from one population pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateReport {
    /// Glyphs that fell past the right edge of the grid
    pub truncated: usize,
    /// Glyphs overwritten by a later run
    pub occluded: usize,
    pub placed: usize,
}

/// A horizontal stretch of text on one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpan {
    pub row: usize,
    pub start_col: usize,
    /// Exclusive
    pub end_col: usize,
    pub text: String,
}

impl CharacterMatrix {
    pub fn new(spec: &GridSpec) -> Self {
        assert!(
            spec.width > 0 && spec.height > 0,
            "grid dimensions must be positive, got {}x{}",
            spec.width,
            spec.height
        );
        Self {
            width: spec.width,
            height: spec.height,
            cell_width: spec.cell_width,
            cell_height: spec.cell_height,
            content: spec.content,
            cells: vec![vec![CharacterCell::default(); spec.width]; spec.height],
            runs: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn origin(&self) -> (f32, f32) {
        (self.content.x0, self.content.y0)
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&CharacterCell> {
        self.cells.get(coord.row).and_then(|row| row.get(coord.col))
    }

    pub fn glyph_at(&self, col: usize, row: usize) -> Option<char> {
        self.cell(CellCoord::new(col, row)).and_then(|cell| cell.glyph)
    }

    pub fn run(&self, id: RunId) -> Option<&Arc<TextRun>> {
        self.runs
            .binary_search_by_key(&id.0, |run| run.reading_order)
            .ok()
            .map(|idx| &self.runs[idx])
    }

    pub fn occupied_count(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|cell| cell.is_occupied)
            .count()
    }

    /// Anchor cell of a page-unit point, clamped into the grid.
    pub fn anchor_cell(&self, x: f32, y: f32) -> CellCoord {
        let (ox, oy) = self.origin();
        let col = ((x - ox) / self.cell_width).floor().max(0.0) as usize;
        let row = ((y - oy) / self.cell_height).floor().max(0.0) as usize;
        CellCoord::new(col.min(self.width - 1), row.min(self.height - 1))
    }

    /// Run box projected into fractional cell-index space.
    pub fn run_cell_bounds(&self, run: &TextRun) -> BoundingBox {
        run.bbox
            .to_cell_space(self.origin(), self.cell_width, self.cell_height)
    }

    /// Places every run into the grid, replacing any previous content.
    ///
    /// Glyphs go left to right from the anchor cell, one per cell. Nothing
    /// wraps; glyphs past the right edge are counted as truncated. When two
    /// runs claim a cell the later reading order wins. Whitespace advances
    /// the cursor without painting.
    pub fn populate(&mut self, runs: Vec<TextRun>) -> PopulateReport {
        let mut runs: Vec<Arc<TextRun>> = runs.into_iter().map(Arc::new).collect();
        runs.sort_by_key(|run| run.reading_order);

        for row in &mut self.cells {
            row.fill(CharacterCell::default());
        }
        self.regions.clear();

        let mut report = PopulateReport::default();
        for run in &runs {
            let anchor = self.anchor_cell(run.bbox.x0, run.bbox.y0);
            for (offset, ch) in run.text.chars().enumerate() {
                let col = anchor.col + offset;
                if col >= self.width {
                    report.truncated += run.text.chars().skip(offset).filter(|c| !c.is_whitespace()).count();
                    break;
                }
                if ch.is_whitespace() {
                    continue;
                }

                let cell = &mut self.cells[anchor.row][col];
                if let Some(existing) = cell.source_run {
                    if existing.0 > run.reading_order {
                        report.occluded += 1;
                        continue;
                    }
                    report.occluded += 1;
                    report.placed -= 1;
                }
                *cell = CharacterCell {
                    glyph: Some(ch),
                    source_run: Some(RunId(run.reading_order)),
                    is_occupied: true,
                };
                report.placed += 1;
            }
        }

        if report.truncated > 0 {
            debug!("Truncated {} glyphs past the grid edge", report.truncated);
        }

        self.runs = runs;
        report
    }

    /// Member runs' text joined in reading order.
    pub fn region_text(&self, region: &MatchedRegion) -> String {
        region
            .member_runs
            .iter()
            .map(|run| run.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs not claimed by any matched region.
    pub fn unassigned_runs(&self) -> Vec<Arc<TextRun>> {
        self.runs
            .iter()
            .filter(|run| {
                !self.regions.iter().any(|region| {
                    region
                        .member_runs
                        .iter()
                        .any(|member| member.reading_order == run.reading_order)
                })
            })
            .cloned()
            .collect()
    }

    /// Plain text: one line per row, empty cells as spaces, trailing
    /// whitespace trimmed.
    pub fn to_text(&self) -> String {
        let mut content = String::new();
        for row in &self.cells {
            let line: String = row.iter().map(|cell| cell.glyph.unwrap_or(' ')).collect();
            content.push_str(line.trim_end());
            content.push('\n');
        }
        content
    }

    pub fn save_text(&self, path: &Path) -> ChonkerResult<()> {
        std::fs::write(path, self.to_text())
            .map_err(|e| ChonkerError::file_io(path.display().to_string(), e))
    }

    /// Occupied stretches per row. Fragments separated by at most `max_gap`
    /// empty cells are merged into one span, the gap kept as spaces.
    pub fn line_spans(&self, max_gap: usize) -> Vec<LineSpan> {
        let mut spans = Vec::new();

        for (row_idx, row) in self.cells.iter().enumerate() {
            let mut current: Option<LineSpan> = None;
            for (col, cell) in row.iter().enumerate() {
                let Some(ch) = cell.glyph else { continue };
                match current.as_mut() {
                    Some(span) if col - span.end_col <= max_gap => {
                        for _ in span.end_col..col {
                            span.text.push(' ');
                        }
                        span.text.push(ch);
                        span.end_col = col + 1;
                    }
                    _ => {
                        if let Some(done) = current.take() {
                            spans.push(done);
                        }
                        current = Some(LineSpan {
                            row: row_idx,
                            start_col: col,
                            end_col: col + 1,
                            text: ch.to_string(),
                        });
                    }
                }
            }
            if let Some(done) = current {
                spans.push(done);
            }
        }

        spans
    }

    pub fn render_debug(&self) -> String {
        let mut result = String::new();

        result.push_str(&format!(
            "Character Matrix ({}x{}) | Cell: {:.1}x{:.1}pt\n",
            self.width, self.height, self.cell_width, self.cell_height
        ));
        result.push_str(&format!(
            "Regions: {} | Text Runs: {} | Unassigned: {}\n",
            self.regions.len(),
            self.runs.len(),
            self.unassigned_runs().len()
        ));
        result.push_str(&"═".repeat(self.width.min(80)));
        result.push('\n');

        for (row_idx, row) in self.cells.iter().enumerate() {
            // Show line numbers for long pages
            if self.height > 20 {
                result.push_str(&format!("{:3} ", row_idx));
            }
            for cell in row {
                result.push(cell.glyph.unwrap_or(' '));
            }
            result.push('\n');
        }

        result.push_str(&"═".repeat(self.width.min(80)));
        result.push('\n');

        for (i, region) in self.regions.iter().enumerate() {
            result.push_str(&format!(
                "Region {}: ({:.0},{:.0})-({:.0},{:.0}) conf:{:.2} {} - \"{}\"\n",
                i + 1,
                region.cell_bbox.x0,
                region.cell_bbox.y0,
                region.cell_bbox.x1,
                region.cell_bbox.y1,
                region.confidence,
                region.label.as_deref().unwrap_or("region"),
                self.region_text(region).chars().take(50).collect::<String>()
            ));
        }

        result
    }
}
