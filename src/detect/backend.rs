use anyhow::Result;

use super::gate::{MotionGate, PixelDiffGate};
use crate::registry::Camera;
use crate::Prediction;

/// Label the SVM classifier uses for people.
pub const HUMAN_LABEL: &str = "human";

/// Unlocalized classifier verdict.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// SVM-family classifier.
///
/// Receives raw RGBA pixels and returns at most one detection. It labels the
/// frame but does not localize, so callers supply the box.
pub trait SvmClassifier: Send {
    fn name(&self) -> &'static str;

    /// Implementations must treat the pixel slice as read-only and ephemeral.
    fn classify(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Option<Classification>>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// TF-family object detector working on a compressed (JPEG) image.
///
/// Returns self-localized predictions in the coordinates of the encoded image.
pub trait ObjectDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, jpeg: &[u8], width: u32, height: u32) -> Result<Vec<Prediction>>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Classifier that never detects anything.
#[derive(Default)]
pub struct NullClassifier;

impl SvmClassifier for NullClassifier {
    fn name(&self) -> &'static str {
        "null-svm"
    }

    fn classify(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Option<Classification>> {
        Ok(None)
    }
}

/// Detector that never detects anything.
#[derive(Default)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn name(&self) -> &'static str {
        "null-tf"
    }

    fn detect(&mut self, _jpeg: &[u8], _width: u32, _height: u32) -> Result<Vec<Prediction>> {
        Ok(Vec::new())
    }
}

/// Builds per-pipeline detector instances.
///
/// Each pipeline owns its gate and detectors, so instances never cross cameras.
pub trait DetectorFactory: Send + Sync {
    fn motion_gate(&self, _camera: &Camera) -> Result<Box<dyn MotionGate>> {
        Ok(Box::new(PixelDiffGate::default()))
    }

    fn svm(&self, camera: &Camera) -> Result<Box<dyn SvmClassifier>>;

    fn tf(&self, camera: &Camera) -> Result<Box<dyn ObjectDetector>>;
}

/// Factory handing out the null stand-ins.
#[derive(Default)]
pub struct NullDetectorFactory;

impl DetectorFactory for NullDetectorFactory {
    fn svm(&self, _camera: &Camera) -> Result<Box<dyn SvmClassifier>> {
        Ok(Box::new(NullClassifier))
    }

    fn tf(&self, _camera: &Camera) -> Result<Box<dyn ObjectDetector>> {
        Ok(Box::new(NullDetector))
    }
}
