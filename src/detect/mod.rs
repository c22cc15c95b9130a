mod backend;
mod dispatch;
mod gate;

pub use backend::{
    Classification, DetectorFactory, NullClassifier, NullDetector, NullDetectorFactory,
    ObjectDetector, SvmClassifier, HUMAN_LABEL,
};
pub use dispatch::{encode_jpeg, DetectionDispatcher, TF_JPEG_QUALITY};
pub use gate::{MotionGate, PixelDiffGate};
