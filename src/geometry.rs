//! Geometric primitives shared by the matrix builder, the fusion engine and
//! the detector bindings.
//!
//! The same [`BoundingBox`] type is used in three coordinate spaces: page
//! units (as delivered by the extraction source), raster pixels (detector
//! output) and cell indices (matched regions). Conversions between them are
//! explicit through [`RasterFrame`] and [`BoundingBox::to_cell_space`].

use serde::{Deserialize, Serialize};

/// Float tolerance for overlap comparisons
pub const EPSILON: f32 = 1e-6;

/// Axis-aligned box with `x1 >= x0` and `y1 >= y0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Builds a box from two corners given in any order.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// Smallest box enclosing every point. `None` for an empty slice or
    /// any non-finite coordinate.
    pub fn from_points(points: &[[f32; 2]]) -> Option<Self> {
        if points.is_empty() || points.iter().flatten().any(|v| !v.is_finite()) {
            return None;
        }
        let mut bbox = Self {
            x0: f32::INFINITY,
            y0: f32::INFINITY,
            x1: f32::NEG_INFINITY,
            y1: f32::NEG_INFINITY,
        };
        for [x, y] in points {
            bbox.x0 = bbox.x0.min(*x);
            bbox.y0 = bbox.y0.min(*y);
            bbox.x1 = bbox.x1.max(*x);
            bbox.y1 = bbox.y1.max(*y);
        }
        Some(bbox)
    }

    pub fn is_finite(&self) -> bool {
        self.x0.is_finite() && self.y0.is_finite() && self.x1.is_finite() && self.y1.is_finite()
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1.min(other.x1);
        let y1 = self.y1.min(other.y1);
        if x1 < x0 || y1 < y0 {
            return None;
        }
        Some(BoundingBox { x0, y0, x1, y1 })
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        self.intersection(other).map(|b| b.area()).unwrap_or(0.0)
    }

    /// Share of `self` covered by `other`, in [0, 1].
    ///
    /// Degenerate boxes (zero width or height) have no area to compare, so
    /// they count as fully covered when their center lies inside `other`.
    pub fn coverage_by(&self, other: &BoundingBox) -> f32 {
        let own = self.area();
        if own <= EPSILON {
            let (cx, cy) = self.center();
            return if other.contains_point(cx, cy) { 1.0 } else { 0.0 };
        }
        (self.intersection_area(other) / own).clamp(0.0, 1.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Maps a page-unit box into fractional cell-index space.
    pub fn to_cell_space(&self, origin: (f32, f32), cell_width: f32, cell_height: f32) -> BoundingBox {
        BoundingBox {
            x0: (self.x0 - origin.0) / cell_width,
            y0: (self.y0 - origin.1) / cell_height,
            x1: (self.x1 - origin.0) / cell_width,
            y1: (self.y1 - origin.1) / cell_height,
        }
    }
}

/// Integer cell address, column first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub col: usize,
    pub row: usize,
}

impl CellCoord {
    pub fn new(col: usize, row: usize) -> Self {
        Self { col, row }
    }
}

/// How raster pixels relate to page units: `pixel = (unit - offset) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterFrame {
    /// Pixels per page unit
    pub scale: f32,
    /// Page coordinate of pixel (0, 0)
    pub offset: (f32, f32),
}

impl RasterFrame {
    /// Page units are PDF points (1/72 inch).
    pub fn from_dpi(dpi: f32, offset: (f32, f32)) -> Self {
        Self {
            scale: dpi / 72.0,
            offset,
        }
    }

    pub fn pixel_to_page(&self, pixel: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: pixel.x0 / self.scale + self.offset.0,
            y0: pixel.y0 / self.scale + self.offset.1,
            x1: pixel.x1 / self.scale + self.offset.0,
            y1: pixel.y1 / self.scale + self.offset.1,
        }
    }

    pub fn page_to_pixel(&self, page: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: (page.x0 - self.offset.0) * self.scale,
            y0: (page.y0 - self.offset.1) * self.scale,
            x1: (page.x1 - self.offset.0) * self.scale,
            y1: (page.y1 - self.offset.1) * self.scale,
        }
    }
}
