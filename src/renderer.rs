use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{ChonkerError, ChonkerResult};

/// Produces page rasters for the render cache.
pub trait PageRenderer: Send + Sync {
    fn render(&self, page_index: usize, dpi: f32) -> ChonkerResult<RgbImage>;

    /// `None` when the document length is unknown
    fn page_count(&self) -> Option<usize> {
        None
    }
}

/// Renders PDF pages by shelling out to `mutool draw`.
pub struct MutoolRenderer {
    pdf_path: PathBuf,
    program: PathBuf,
}

impl MutoolRenderer {
    pub fn new(pdf_path: impl Into<PathBuf>) -> Self {
        Self {
            pdf_path: pdf_path.into(),
            program: PathBuf::from("mutool"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.program).arg("-v").output().is_ok()
    }
}

impl PageRenderer for MutoolRenderer {
    fn render(&self, page_index: usize, dpi: f32) -> ChonkerResult<RgbImage> {
        let temp_path =
            std::env::temp_dir().join(format!("chonker_page_{}.png", uuid::Uuid::new_v4()));

        let output = Command::new(&self.program)
            .arg("draw")
            .args(["-F", "png", "-r"])
            .arg(format!("{}", dpi.round() as u32))
            .arg("-o")
            .arg(&temp_path)
            .arg(&self.pdf_path)
            .arg(format!("{}", page_index + 1)) // mutool uses 1-based pages
            .output()
            .map_err(|e| {
                ChonkerError::render(page_index, format!("{} not available: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(ChonkerError::render(
                page_index,
                format!(
                    "mutool draw failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let image = image::open(&temp_path)
            .map_err(|e| ChonkerError::render(page_index, format!("unreadable raster: {}", e)));
        let _ = std::fs::remove_file(&temp_path); // Clean up

        let image = image?.to_rgb8();
        debug!(
            "Rendered page {} at {} DPI: {}x{}",
            page_index + 1,
            dpi,
            image.width(),
            image.height()
        );
        Ok(image)
    }

    fn page_count(&self) -> Option<usize> {
        let output = Command::new(&self.program)
            .arg("show")
            .arg(&self.pdf_path)
            .arg("trailer/Root/Pages/Count")
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}
