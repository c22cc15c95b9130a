use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use super::backend::{DetectorFactory, ObjectDetector, SvmClassifier, HUMAN_LABEL};
use crate::frame::{Frame, MotionRegion, FRAME_CHANNELS};
use crate::registry::{Camera, DetectorMode};
use crate::Prediction;

/// JPEG quality used when handing frames to the TF detector.
pub const TF_JPEG_QUALITY: u8 = 50;

enum Engine {
    Svm(Box<dyn SvmClassifier>),
    Tf(Box<dyn ObjectDetector>),
    Unsupported(String),
}

/// Normalizes the configured detector family's output into predictions.
///
/// Only invoked once the motion gate has reported a region.
pub struct DetectionDispatcher {
    camera_id: String,
    engine: Engine,
}

impl DetectionDispatcher {
    /// Builds and warms up the detector selected by the camera's mode.
    pub fn for_camera(camera: &Camera, factory: &dyn DetectorFactory) -> Result<Self> {
        let engine = match &camera.detector {
            DetectorMode::Svm => {
                let mut classifier = factory.svm(camera)?;
                classifier
                    .warm_up()
                    .with_context(|| format!("[{}] warm up {}", camera.id, classifier.name()))?;
                Engine::Svm(classifier)
            }
            DetectorMode::Tf => {
                let mut detector = factory.tf(camera)?;
                detector
                    .warm_up()
                    .with_context(|| format!("[{}] warm up {}", camera.id, detector.name()))?;
                Engine::Tf(detector)
            }
            DetectorMode::Unsupported(raw) => {
                log::warn!(
                    "[{}] detector mode '{}' is not supported; motion will produce no predictions",
                    camera.id,
                    raw
                );
                Engine::Unsupported(raw.clone())
            }
        };
        Ok(Self {
            camera_id: camera.id.clone(),
            engine,
        })
    }

    pub fn svm(camera_id: impl Into<String>, classifier: Box<dyn SvmClassifier>) -> Self {
        Self {
            camera_id: camera_id.into(),
            engine: Engine::Svm(classifier),
        }
    }

    pub fn tf(camera_id: impl Into<String>, detector: Box<dyn ObjectDetector>) -> Self {
        Self {
            camera_id: camera_id.into(),
            engine: Engine::Tf(detector),
        }
    }

    pub fn mode(&self) -> DetectorMode {
        match &self.engine {
            Engine::Svm(_) => DetectorMode::Svm,
            Engine::Tf(_) => DetectorMode::Tf,
            Engine::Unsupported(raw) => DetectorMode::Unsupported(raw.clone()),
        }
    }

    /// Zero or more predictions for `frame`, given the gate's `region`.
    pub fn dispatch(&mut self, frame: &Frame, region: &MotionRegion) -> Result<Vec<Prediction>> {
        match &mut self.engine {
            Engine::Svm(classifier) => {
                let verdict = classifier
                    .classify(frame.pixels(), frame.width, frame.height)
                    .with_context(|| format!("{} classify", classifier.name()))?;
                match verdict {
                    // The classifier does not localize; the motion region stands in for the box.
                    Some(hit) if hit.label == HUMAN_LABEL => Ok(vec![Prediction {
                        label: hit.label,
                        bbox: *region,
                        detected_on_ms: crate::now_ms()?,
                        image_width: frame.width,
                        image_height: frame.height,
                    }]),
                    Some(other) => {
                        log::debug!("[{}] svm ignored label '{}'", self.camera_id, other.label);
                        Ok(Vec::new())
                    }
                    None => Ok(Vec::new()),
                }
            }
            Engine::Tf(detector) => {
                let jpeg = encode_jpeg(frame, TF_JPEG_QUALITY)?;
                detector
                    .detect(&jpeg, frame.width, frame.height)
                    .with_context(|| format!("{} detect", detector.name()))
            }
            Engine::Unsupported(_) => Ok(Vec::new()),
        }
    }
}

/// Drops the alpha channel and JPEG-encodes the frame.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb: Vec<u8> = frame
        .pixels()
        .chunks_exact(FRAME_CHANNELS)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("encode jpeg")?;
    Ok(out)
}
