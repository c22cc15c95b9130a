use anyhow::Result;
use std::sync::Arc;

use super::broadcast::DetectionSink;
use super::recorder::Recorder;
use super::store::{EventStore, NewEvent};
use super::DetectionEvent;
use crate::registry::Camera;
use crate::Prediction;

/// Side effects for a camera's non-empty prediction list.
///
/// Broadcast is fire-and-forget: a failing sink is logged and does not stop
/// the recording request. The event record is persisted from the recording
/// completion callback.
pub struct EventTrigger {
    sink: Arc<dyn DetectionSink>,
    recorder: Arc<dyn Recorder>,
    store: Arc<dyn EventStore>,
}

impl EventTrigger {
    pub fn new(
        sink: Arc<dyn DetectionSink>,
        recorder: Arc<dyn Recorder>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            sink,
            recorder,
            store,
        }
    }

    /// Returns whether anything was triggered (false for an empty list).
    pub fn on_predictions(&self, camera: &Camera, predictions: Vec<Prediction>) -> Result<bool> {
        if predictions.is_empty() {
            return Ok(false);
        }

        let event = DetectionEvent {
            camera_id: camera.id.clone(),
            predictions,
        };
        if let Err(err) = self.sink.publish(&event) {
            log::warn!("[{}] detection broadcast failed: {:#}", camera.id, err);
        }

        if camera.events.record_events {
            let store = self.store.clone();
            let camera_id = camera.id.clone();
            self.recorder.request_recording(
                &camera.id,
                camera.events.record_seconds,
                Box::new(move || persist_event(store.as_ref(), camera_id)),
            )?;
        }
        Ok(true)
    }

    /// Stop the camera's in-progress recording. Used when its pipeline stops.
    pub fn cancel_recording(&self, camera_id: &str) {
        self.recorder.cancel(camera_id);
    }
}

fn persist_event(store: &dyn EventStore, camera_id: String) {
    let occurred_on_ms = match crate::now_ms() {
        Ok(ms) => ms,
        Err(err) => {
            log::error!("[{}] event timestamp unavailable: {:#}", camera_id, err);
            return;
        }
    };
    let event = NewEvent {
        camera_id,
        occurred_on_ms,
    };
    match store.create(&event) {
        Ok(id) => log::info!("[{}] event {} recorded", event.camera_id, id),
        Err(err) => log::error!("[{}] event persistence failed: {:#}", event.camera_id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DetectionBus, InMemoryEventStore, RecordingCallback};
    use crate::registry::{DetectorMode, EventConfig};
    use crate::BoundingBox;
    use anyhow::anyhow;
    use std::sync::Mutex;

    /// Completes every recording immediately.
    #[derive(Default)]
    struct InstantRecorder {
        requests: Mutex<Vec<(String, u32)>>,
    }

    impl Recorder for InstantRecorder {
        fn request_recording(
            &self,
            camera_id: &str,
            seconds: u32,
            on_complete: RecordingCallback,
        ) -> Result<()> {
            self.requests
                .lock()
                .unwrap()
                .push((camera_id.to_string(), seconds));
            on_complete();
            Ok(())
        }
    }

    struct BrokenSink;

    impl DetectionSink for BrokenSink {
        fn publish(&self, _event: &DetectionEvent) -> Result<()> {
            Err(anyhow!("broker offline"))
        }
    }

    fn prediction() -> Prediction {
        Prediction {
            label: "human".to_string(),
            bbox: BoundingBox::new(0, 0, 4, 4),
            detected_on_ms: 1,
            image_width: 640,
            image_height: 360,
        }
    }

    fn recording_camera(seconds: u32) -> Camera {
        Camera::new("front", DetectorMode::Svm).with_events(EventConfig {
            record_events: true,
            record_seconds: seconds,
        })
    }

    #[test]
    fn empty_predictions_do_nothing() {
        let bus = Arc::new(DetectionBus::new());
        let rx = bus.subscribe("front").unwrap();
        let recorder = Arc::new(InstantRecorder::default());
        let trigger = EventTrigger::new(bus, recorder.clone(), Arc::new(InMemoryEventStore::new()));

        assert!(!trigger.on_predictions(&recording_camera(10), Vec::new()).unwrap());
        assert!(rx.try_recv().is_err());
        assert!(recorder.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn predictions_broadcast_record_and_persist() {
        let bus = Arc::new(DetectionBus::new());
        let rx = bus.subscribe("front").unwrap();
        let recorder = Arc::new(InstantRecorder::default());
        let store = Arc::new(InMemoryEventStore::new());
        let trigger = EventTrigger::new(bus, recorder.clone(), store.clone());

        assert!(trigger
            .on_predictions(&recording_camera(7), vec![prediction()])
            .unwrap());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.predictions.len(), 1);
        assert!(rx.try_recv().is_err(), "broadcast more than once");
        assert_eq!(
            recorder.requests.lock().unwrap().as_slice(),
            &[("front".to_string(), 7)]
        );
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].camera_id, "front");
    }

    #[test]
    fn recording_disabled_only_broadcasts() {
        let bus = Arc::new(DetectionBus::new());
        let rx = bus.subscribe("front").unwrap();
        let recorder = Arc::new(InstantRecorder::default());
        let store = Arc::new(InMemoryEventStore::new());
        let trigger = EventTrigger::new(bus, recorder.clone(), store.clone());

        let camera = Camera::new("front", DetectorMode::Tf);
        trigger.on_predictions(&camera, vec![prediction()]).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(recorder.requests.lock().unwrap().is_empty());
        assert!(store.records().is_empty());
    }

    #[test]
    fn broadcast_failure_still_records() {
        let recorder = Arc::new(InstantRecorder::default());
        let store = Arc::new(InMemoryEventStore::new());
        let trigger = EventTrigger::new(Arc::new(BrokenSink), recorder.clone(), store.clone());

        trigger
            .on_predictions(&recording_camera(10), vec![prediction()])
            .unwrap();
        assert_eq!(recorder.requests.lock().unwrap().len(), 1);
        assert_eq!(store.records().len(), 1);
    }
}
