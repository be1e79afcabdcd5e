// Public module exports
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod grid;
pub mod logging;
pub mod matrix;
pub mod pdf_cache;
pub mod renderer;
pub mod text_run;

pub use config::ChonkerConfig;
pub use detector::{
    BoundedDetector, CommandDetector, DetectedRegion, RegionDetector, StaticDetector,
};
pub use engine::{CharacterMatrixEngine, MatrixBuild};
pub use error::{ChonkerError, ChonkerResult};
pub use fusion::{FusionReport, MatchedRegion, PageImage, RegionFusionEngine};
pub use geometry::{BoundingBox, CellCoord};
pub use matrix::{CharacterCell, CharacterMatrix, RunId};
pub use pdf_cache::{CachedPage, QualityTier, RenderCache, RenderEvent, SlotState};
pub use renderer::{MutoolRenderer, PageRenderer};
pub use text_run::{RawTextRecord, TextRun};
