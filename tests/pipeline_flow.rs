//! End-to-end pipeline runs with a stand-in transcoder script that replays
//! prepared PAM frames on stdout.

use anyhow::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use motion_watch::detect::{NullClassifier, NullDetector};
use motion_watch::event::RecordingCallback;
use motion_watch::ingest::{encode_pam, RestartPolicy};
use motion_watch::{
    BoundingBox, Camera, CameraRegistry, Classification, ClipRecorder, DetectionBus,
    DetectorFactory, DetectorMode, EventConfig, EventTrigger, InMemoryEventStore, ObjectDetector,
    PipelineContext, PipelineSupervisor, Prediction, Recorder, StreamHub, SvmClassifier,
    TranscoderSettings,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 6;

struct HumanEverywhere;

impl SvmClassifier for HumanEverywhere {
    fn name(&self) -> &'static str {
        "human-everywhere"
    }

    fn classify(&mut self, _: &[u8], _: u32, _: u32) -> Result<Option<Classification>> {
        Ok(Some(Classification::new("human", 0.99)))
    }
}

struct SvmFactory;

impl DetectorFactory for SvmFactory {
    fn svm(&self, _camera: &Camera) -> Result<Box<dyn SvmClassifier>> {
        Ok(Box::new(HumanEverywhere))
    }

    fn tf(&self, _camera: &Camera) -> Result<Box<dyn ObjectDetector>> {
        Ok(Box::new(NullDetector))
    }
}

struct EmptyFactory;

impl DetectorFactory for EmptyFactory {
    fn svm(&self, _camera: &Camera) -> Result<Box<dyn SvmClassifier>> {
        Ok(Box::new(NullClassifier))
    }

    fn tf(&self, _camera: &Camera) -> Result<Box<dyn ObjectDetector>> {
        Ok(Box::new(NullDetector))
    }
}

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

fn solid(value: u8) -> Vec<u8> {
    vec![value; (WIDTH * HEIGHT * 4) as usize]
}

/// Writes `frames.pam` (dark, bright, bright) and a transcoder script replaying it.
fn replay_transcoder(dir: &Path, with_garbage: bool) -> PathBuf {
    let mut stream = Vec::new();
    stream.extend(encode_pam(WIDTH, HEIGHT, &solid(0)));
    if with_garbage {
        stream.extend_from_slice(b"P7\nWIDTH 8\nHEIGHT oops\nENDHDR\n");
    }
    stream.extend(encode_pam(WIDTH, HEIGHT, &solid(220)));
    stream.extend(encode_pam(WIDTH, HEIGHT, &solid(220)));
    let frames = dir.join("frames.pam");
    std::fs::write(&frames, stream).unwrap();

    let script = dir.join("transcoder.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\nexec cat '{}'\n", frames.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn context(
    program: &Path,
    detectors: Arc<dyn DetectorFactory>,
    bus: Arc<DetectionBus>,
    recorder: Arc<InstantRecorder>,
    store: Arc<InMemoryEventStore>,
) -> PipelineContext {
    PipelineContext {
        hub: StreamHub::new(),
        transcoder: TranscoderSettings {
            program: program.to_string_lossy().into_owned(),
            restart: RestartPolicy::fixed(Duration::from_secs(60)),
        },
        detectors,
        trigger: Arc::new(EventTrigger::new(bus, recorder, store)),
        observer: None,
    }
}

#[test]
fn motion_with_human_broadcasts_records_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let script = replay_transcoder(dir.path(), true);
    let bus = Arc::new(DetectionBus::new());
    let detections = bus.subscribe("front").unwrap();
    let recorder = Arc::new(InstantRecorder::default());
    let store = Arc::new(InMemoryEventStore::new());

    let camera = Camera::new("front", DetectorMode::Svm).with_events(EventConfig {
        record_events: true,
        record_seconds: 12,
    });
    let registry = CameraRegistry::new(vec![camera]).unwrap();
    let supervisor = PipelineSupervisor::new(
        registry,
        context(&script, Arc::new(SvmFactory), bus.clone(), recorder.clone(), store.clone()),
    );

    let report = supervisor.start_all();
    assert_eq!(report.started, vec!["front".to_string()]);
    assert!(report.failed.is_empty());

    // Dark -> bright is the only change; bright -> bright is still.
    let event = detections.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(event.camera_id, "front");
    let expected = Prediction {
        label: "human".to_string(),
        bbox: BoundingBox::new(0, 0, WIDTH, HEIGHT),
        detected_on_ms: event.predictions[0].detected_on_ms,
        image_width: WIDTH,
        image_height: HEIGHT,
    };
    assert_eq!(event.predictions, vec![expected]);

    // Wait for the decoder to drain the stream.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = supervisor.stats()["front"];
        if stats.frames_decoded == 3 {
            assert_eq!(stats.decode_failures, 1);
            assert_eq!(stats.motion_frames, 1);
            assert_eq!(stats.detections, 1);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "stats never settled: {stats:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(detections.try_recv().is_err());

    assert_eq!(
        recorder.requests.lock().unwrap().as_slice(),
        &[("front".to_string(), 12)]
    );
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].camera_id, "front");

    supervisor.stop_all().unwrap();
    assert!(!supervisor.is_running("front"));
}

#[test]
fn stopping_camera_cancels_its_recording() {
    let dir = tempfile::tempdir().unwrap();
    let script = replay_transcoder(dir.path(), false);
    let remuxer = dir.path().join("remux.sh");
    std::fs::write(&remuxer, "#!/bin/sh\nexec cat > /dev/null\n").unwrap();
    std::fs::set_permissions(&remuxer, std::fs::Permissions::from_mode(0o755)).unwrap();

    let hub = StreamHub::new();
    let recorder = Arc::new(ClipRecorder::new(
        hub.clone(),
        remuxer.to_string_lossy(),
        dir.path().join("clips"),
    ));
    let store = Arc::new(InMemoryEventStore::new());
    let camera = Camera::new("front", DetectorMode::Svm).with_events(EventConfig {
        record_events: true,
        record_seconds: 60,
    });
    let supervisor = PipelineSupervisor::new(
        CameraRegistry::new(vec![camera]).unwrap(),
        PipelineContext {
            hub: hub.clone(),
            transcoder: TranscoderSettings {
                program: script.to_string_lossy().into_owned(),
                restart: RestartPolicy::fixed(Duration::from_secs(60)),
            },
            detectors: Arc::new(SvmFactory),
            trigger: Arc::new(EventTrigger::new(
                Arc::new(DetectionBus::new()),
                recorder.clone(),
                store.clone(),
            )),
            observer: None,
        },
    );
    supervisor.start_camera("front").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !recorder.is_recording("front") {
        assert!(std::time::Instant::now() < deadline, "recording never started");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(supervisor.stop_camera("front").unwrap());
    assert!(!recorder.is_recording("front"));
    assert_eq!(hub.subscriber_count("front"), 0);
    // The cut-short clip is still finalized, so the event is kept.
    assert_eq!(store.records().len(), 1);
}

#[test]
fn empty_detections_never_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let script = replay_transcoder(dir.path(), false);
    let bus = Arc::new(DetectionBus::new());
    let detections = bus.subscribe("yard").unwrap();
    let recorder = Arc::new(InstantRecorder::default());

    let camera = Camera::new("yard", DetectorMode::Tf).with_events(EventConfig {
        record_events: true,
        record_seconds: 10,
    });
    let supervisor = PipelineSupervisor::new(
        CameraRegistry::new(vec![camera]).unwrap(),
        context(
            &script,
            Arc::new(EmptyFactory),
            bus.clone(),
            recorder.clone(),
            Arc::new(InMemoryEventStore::new()),
        ),
    );
    supervisor.start_camera("yard").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while supervisor.stats()["yard"].frames_decoded < 3 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(supervisor.stats()["yard"].motion_frames, 1);
    assert!(detections.try_recv().is_err());
    assert!(recorder.requests.lock().unwrap().is_empty());
}

#[test]
fn inactive_and_unknown_cameras_do_not_start() {
    let mut disabled = Camera::new("garage", DetectorMode::Svm);
    disabled.enabled = false;
    let supervisor = PipelineSupervisor::new(
        CameraRegistry::new(vec![disabled]).unwrap(),
        context(
            Path::new("true"),
            Arc::new(EmptyFactory),
            Arc::new(DetectionBus::new()),
            Arc::new(InstantRecorder::default()),
            Arc::new(InMemoryEventStore::new()),
        ),
    );

    assert!(supervisor.start_all().started.is_empty());
    assert!(supervisor.start_camera("garage").is_err());
    assert!(supervisor.start_camera("attic").is_err());
    assert!(supervisor.running().is_empty());
}
