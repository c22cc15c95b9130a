//! Detection side effects.
//!
//! - `broadcast`: live detection fan-out (in-process bus, MQTT)
//! - `recorder`: bounded-duration clip recording from the stream hub
//! - `store`: event persistence
//! - `trigger`: ties the three together for a non-empty prediction list

use serde::{Deserialize, Serialize};

use crate::Prediction;

pub mod broadcast;
pub mod recorder;
pub mod store;
pub mod trigger;

pub use broadcast::{DetectionBus, DetectionSink, MqttDetectionSink, MqttEndpoint};
pub use recorder::{ClipRecorder, Recorder, RecordingCallback};
pub use store::{EventRecord, EventStore, InMemoryEventStore, NewEvent, SqliteEventStore};
pub use trigger::EventTrigger;

/// Suffix of the live detection topic for a camera.
pub const DETECT_TOPIC_SUFFIX: &str = "-detect";

/// Live topic carrying a camera's detections: `<camera-id>-detect`.
pub fn detect_topic(camera_id: &str) -> String {
    format!("{}{}", camera_id, DETECT_TOPIC_SUFFIX)
}

/// Predictions broadcast for one processed frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub camera_id: String,
    pub predictions: Vec<Prediction>,
}

impl DetectionEvent {
    pub fn topic(&self) -> String {
        detect_topic(&self.camera_id)
    }
}
