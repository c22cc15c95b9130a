//! Motion Watch
//!
//! Real-time per-camera analysis pipeline: live camera video is reduced to a
//! low-rate sequence of decoded RGBA frames, a short temporal window of those
//! frames gates object detection, and detections trigger live broadcast,
//! recording, and event persistence.
//!
//! # Data Flow
//!
//! ```text
//! camera source -> StreamHub -> StreamRelay -> transcoder process -> PamDecoder
//!     -> FrameWindow -> MotionGate -> DetectionDispatcher -> EventTrigger
//! ```
//!
//! # Module Structure
//!
//! - `registry`: Read-only camera snapshot (detector mode, event configuration)
//! - `frame`: Decoded frames and the 3-frame temporal window
//! - `ingest`: Stream hub, loopback relay, PAM decoder, supervised processes
//! - `detect`: Motion gate, detector traits, SVM/TF dispatch
//! - `event`: Live broadcast sinks, recording, persistence, the trigger
//! - `pipeline`: Per-camera pipeline instances and the top-level supervisor
//! - `render`: Offline annotated GIF renderer for finished events

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod render;

pub use detect::{
    Classification, DetectionDispatcher, DetectorFactory, MotionGate, NullDetectorFactory,
    ObjectDetector, PixelDiffGate, SvmClassifier,
};
pub use event::{
    ClipRecorder, DetectionBus, DetectionEvent, DetectionSink, EventRecord, EventStore,
    EventTrigger, InMemoryEventStore, MqttDetectionSink, NewEvent, Recorder, SqliteEventStore,
};
pub use frame::{Frame, FrameWindow, MotionRegion, FRAME_CHANNELS, WINDOW_FRAMES};
pub use ingest::{
    LifecycleEvent, PamDecoder, ProcessSupervisor, RelayHandle, RestartPolicy, StreamHub,
    StreamRelay, Subscription, SupervisorHandle, TranscoderSettings,
};
pub use pipeline::{
    FrameOutcome, FrameProcessor, PipelineContext, PipelineSupervisor, StartReport, StatsSnapshot,
};
pub use registry::{Camera, CameraRegistry, DetectorMode, EventConfig};
pub use render::{plan_segments, render, render_to_file, RenderBox, Segment};

/// Axis-aligned box in frame-pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A single detection, immutable once created.
///
/// `image_width`/`image_height` are the dimensions of the frame the box was
/// measured against, so consumers can rescale onto other canvases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub detected_on_ms: u64,
    pub image_width: u32,
    pub image_height: u32,
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}
