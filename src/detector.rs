//! Layout detector capability and its bindings.
//!
//! The fusion engine only sees [`RegionDetector`]. Concrete bindings here:
//! a replay detector for precomputed output, a subprocess binding that talks
//! JSON over stdout, and a wrapper that bounds any detector's wall-clock time.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ChonkerError, ChonkerResult};
use crate::geometry::BoundingBox;

/// Region reported by the detector, in raster-pixel space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegionRecord", into = "RegionRecord")]
pub struct DetectedRegion {
    pub pixel_bbox: BoundingBox,
    pub confidence: f32,
    pub label: Option<String>,
}

/// Wire form of one region; accepts corner names or Docling-style l/t/r/b
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegionRecord {
    #[serde(alias = "l")]
    x0: f32,
    #[serde(alias = "t")]
    y0: f32,
    #[serde(alias = "r")]
    x1: f32,
    #[serde(alias = "b")]
    y1: f32,
    #[serde(alias = "proba", alias = "score")]
    confidence: f32,
    #[serde(default, alias = "block_type", alias = "kind")]
    label: Option<String>,
}

impl From<RegionRecord> for DetectedRegion {
    fn from(record: RegionRecord) -> Self {
        Self {
            pixel_bbox: BoundingBox::new(record.x0, record.y0, record.x1, record.y1),
            confidence: record.confidence,
            label: record.label,
        }
    }
}

impl From<DetectedRegion> for RegionRecord {
    fn from(region: DetectedRegion) -> Self {
        Self {
            x0: region.pixel_bbox.x0,
            y0: region.pixel_bbox.y0,
            x1: region.pixel_bbox.x1,
            y1: region.pixel_bbox.y1,
            confidence: region.confidence,
            label: region.label,
        }
    }
}

impl DetectedRegion {
    pub fn new(pixel_bbox: BoundingBox, confidence: f32, label: Option<&str>) -> Self {
        Self {
            pixel_bbox: BoundingBox::new(pixel_bbox.x0, pixel_bbox.y0, pixel_bbox.x1, pixel_bbox.y1),
            confidence,
            label: label.map(str::to_string),
        }
    }

    /// `None` when any coordinate or the confidence is not finite.
    pub fn bbox(&self) -> Option<BoundingBox> {
        (self.pixel_bbox.is_finite() && self.confidence.is_finite()).then_some(self.pixel_bbox)
    }
}

/// Detector output as serialized by external tools
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DetectionPayload {
    Bare(Vec<DetectedRegion>),
    Wrapped { regions: Vec<DetectedRegion> },
}

impl DetectionPayload {
    pub fn into_regions(self) -> Vec<DetectedRegion> {
        match self {
            DetectionPayload::Bare(regions) => regions,
            DetectionPayload::Wrapped { regions } => regions,
        }
    }
}

pub fn parse_detections(json: &str) -> ChonkerResult<Vec<DetectedRegion>> {
    let payload: DetectionPayload = serde_json::from_str(json.trim())?;
    Ok(payload.into_regions())
}

/// Visual layout detector capability
pub trait RegionDetector: Send + Sync {
    fn detect(&self, image: &RgbImage, threshold: f32) -> ChonkerResult<Vec<DetectedRegion>>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: RegionDetector + ?Sized> RegionDetector for Arc<D> {
    fn detect(&self, image: &RgbImage, threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
        (**self).detect(image, threshold)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Replays a fixed detection result
#[derive(Debug, Clone, Default)]
pub struct StaticDetector {
    regions: Vec<DetectedRegion>,
}

impl StaticDetector {
    pub fn new(regions: Vec<DetectedRegion>) -> Self {
        Self { regions }
    }

    pub fn from_json(json: &str) -> ChonkerResult<Self> {
        Ok(Self::new(parse_detections(json)?))
    }
}

impl RegionDetector for StaticDetector {
    fn detect(&self, _image: &RgbImage, _threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
        Ok(self.regions.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Runs an external layout model as a subprocess.
///
/// Invocation: `<program> <args..> <image.png> --threshold <t>`; the process
/// must print a detection payload as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn write_temp_image(&self, image: &RgbImage) -> ChonkerResult<PathBuf> {
        let temp_path =
            std::env::temp_dir().join(format!("chonker_layout_{}.png", uuid::Uuid::new_v4()));
        image
            .save(&temp_path)
            .map_err(|e| ChonkerError::detector_with_source("Failed to write detector input", e))?;
        Ok(temp_path)
    }

    fn run(&self, image_path: &PathBuf, threshold: f32) -> ChonkerResult<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .arg("--threshold")
            .arg(threshold.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ChonkerError::detector_with_source(
                    format!("Failed to start {}", self.program.display()),
                    e,
                )
            })?;

        // Drain both pipes on helper threads so a chatty child can't block on a full pipe
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChonkerError::detector("detector stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChonkerError::detector("detector stderr unavailable"))?;
        let reader = spawn_pipe_reader(stdout);
        let err_reader = spawn_pipe_reader(stderr);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ChonkerError::DetectorTimeout {
                        millis: self.timeout.as_millis() as u64,
                    });
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    return Err(ChonkerError::detector_with_source("Failed waiting for detector", e))
                }
            }
        };

        let stdout = reader
            .join()
            .map_err(|_| ChonkerError::detector("detector output reader panicked"))?
            .map_err(|e| ChonkerError::detector_with_source("Failed to read detector output", e))?;

        if !status.success() {
            let stderr = err_reader
                .join()
                .ok()
                .and_then(|read| read.ok())
                .unwrap_or_default();
            return Err(ChonkerError::detector(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    mut pipe: R,
) -> thread::JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut buf = String::new();
        pipe.read_to_string(&mut buf).map(|_| buf)
    })
}

impl RegionDetector for CommandDetector {
    fn detect(&self, image: &RgbImage, threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
        let image_path = self.write_temp_image(image)?;
        let output = self.run(&image_path, threshold);
        let _ = std::fs::remove_file(&image_path); // Clean up

        let output = output?;
        debug!("Detector produced {} bytes of output", output.len());
        parse_detections(&output)
            .map_err(|e| ChonkerError::detector_with_source("Failed to parse detector output", e))
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Bounds the wall-clock time of any detector. The wrapped call keeps
/// running on its helper thread after a timeout; its result is discarded.
pub struct BoundedDetector<D> {
    inner: Arc<D>,
    timeout: Duration,
}

impl<D: RegionDetector + 'static> BoundedDetector<D> {
    pub fn new(inner: D, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }
}

impl<D: RegionDetector + 'static> RegionDetector for BoundedDetector<D> {
    fn detect(&self, image: &RgbImage, threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let image = image.clone();
        thread::spawn(move || {
            let _ = tx.send(inner.detect(&image, threshold));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "{} detector exceeded {}ms",
                    self.inner.name(),
                    self.timeout.as_millis()
                );
                Err(ChonkerError::DetectorTimeout {
                    millis: self.timeout.as_millis() as u64,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ChonkerError::detector("detector thread exited without a result"))
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowDetector(Duration);

    impl RegionDetector for SlowDetector {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> ChonkerResult<Vec<DetectedRegion>> {
            thread::sleep(self.0);
            Ok(vec![])
        }
    }

    #[test]
    fn test_parse_bare_and_wrapped_payloads() {
        let bare = r#"[{"x0": 1, "y0": 2, "x1": 30, "y1": 40, "confidence": 0.9, "label": "Text"}]"#;
        let regions = parse_detections(bare).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label.as_deref(), Some("Text"));
        assert_eq!(regions[0].bbox(), Some(BoundingBox::new(1.0, 2.0, 30.0, 40.0)));

        let wrapped = r#"{"regions": [{"l": 5, "t": 6, "r": 7, "b": 8, "proba": 0.4}]}"#;
        let regions = parse_detections(wrapped).unwrap();
        assert_eq!(regions[0].confidence, 0.4);
        assert!(regions[0].label.is_none());
    }

    #[test]
    fn test_swapped_corners_are_ordered() {
        let region = DetectedRegion::new(BoundingBox { x0: 10.0, y0: 10.0, x1: 0.0, y1: 0.0 }, 0.9, None);
        assert_eq!(region.bbox(), Some(BoundingBox::new(0.0, 0.0, 10.0, 10.0)));
    }

    #[test]
    fn test_garbage_payload_is_error() {
        assert!(parse_detections("label,confidence\nText,0.9").is_err());
    }

    #[test]
    fn test_static_detector_replays() {
        let detector = StaticDetector::from_json(r#"[{"x0":0,"y0":0,"x1":1,"y1":1,"confidence":0.7}]"#).unwrap();
        let image = RgbImage::new(2, 2);
        assert_eq!(detector.detect(&image, 0.5).unwrap().len(), 1);
    }

    #[test]
    fn test_bounded_detector_times_out() {
        let detector = BoundedDetector::new(SlowDetector(Duration::from_millis(500)), Duration::from_millis(20));
        let err = detector.detect(&RgbImage::new(1, 1), 0.5).unwrap_err();
        assert!(matches!(err, ChonkerError::DetectorTimeout { millis: 20 }));
    }

    #[test]
    fn test_bounded_detector_passes_results_through() {
        let detector = BoundedDetector::new(SlowDetector(Duration::ZERO), Duration::from_secs(5));
        assert!(detector.detect(&RgbImage::new(1, 1), 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_missing_program_is_detector_error() {
        let detector = CommandDetector::new("/nonexistent/chonker-layout-model")
            .with_timeout(Duration::from_secs(1));
        let err = detector.detect(&RgbImage::new(4, 4), 0.5).unwrap_err();
        assert!(matches!(err, ChonkerError::Detector { .. }));
    }
}
