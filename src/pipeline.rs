//! Per-camera analysis pipelines.
//!
//! A `PipelineInstance` owns everything one camera needs: the transcoder
//! supervisor (and through it the relay), an optional upstream feed, and the
//! worker thread running the `FrameProcessor`. Frames for a camera are handled
//! one at a time on that worker, so the frame window never leaves it.
//!
//! `PipelineSupervisor` keeps at most one instance per camera. Starting a
//! camera that is already running stops the old instance first.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::detect::{DetectionDispatcher, DetectorFactory, MotionGate};
use crate::event::EventTrigger;
use crate::frame::{Frame, FrameWindow, WINDOW_FRAMES};
use crate::ingest::feed::FeedTask;
use crate::ingest::transcoder::TranscoderTask;
use crate::ingest::{
    FrameEvent, LifecycleEvent, ProcessSupervisor, StreamHub, SupervisorHandle, TranscoderSettings,
};
use crate::registry::{Camera, CameraRegistry};

/// Shared collaborators handed to every pipeline.
pub struct PipelineContext {
    pub hub: StreamHub,
    pub transcoder: TranscoderSettings,
    pub detectors: Arc<dyn DetectorFactory>,
    pub trigger: Arc<EventTrigger>,
    /// Receives transcoder lifecycle events for every camera.
    pub observer: Option<Sender<LifecycleEvent>>,
}

#[derive(Default)]
struct PipelineStats {
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
    motion_frames: AtomicU64,
    detections: AtomicU64,
    processing_failures: AtomicU64,
    restarts: AtomicU64,
}

impl PipelineStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            motion_frames: self.motion_frames.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub motion_frames: u64,
    pub detections: u64,
    pub processing_failures: u64,
    pub restarts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    NoMotion,
    /// Motion was seen but the detector found nothing.
    NoPredictions,
    /// Number of predictions handed to the trigger.
    Triggered(usize),
}

/// Window, gate, dispatcher and trigger for one camera.
pub struct FrameProcessor {
    camera: Camera,
    window: FrameWindow,
    gate: Box<dyn MotionGate>,
    dispatcher: DetectionDispatcher,
    trigger: Arc<EventTrigger>,
    stats: Arc<PipelineStats>,
}

impl FrameProcessor {
    pub fn new(
        camera: Camera,
        gate: Box<dyn MotionGate>,
        dispatcher: DetectionDispatcher,
        trigger: Arc<EventTrigger>,
    ) -> Self {
        Self {
            camera,
            window: FrameWindow::new(),
            gate,
            dispatcher,
            trigger,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    /// Push, gate, dispatch, trigger. Errors are returned unlogged.
    pub fn process_frame(&mut self, frame: Frame) -> Result<FrameOutcome> {
        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.window.push(frame);

        let region = self
            .gate
            .motion_region(&self.window)
            .with_context(|| format!("motion gate {}", self.gate.name()))?;
        let Some(region) = region else {
            return Ok(FrameOutcome::NoMotion);
        };
        self.stats.motion_frames.fetch_add(1, Ordering::Relaxed);

        let latest = self
            .window
            .latest()
            .ok_or_else(|| anyhow!("frame window empty after push"))?;
        let predictions = self.dispatcher.dispatch(latest, &region)?;
        if predictions.is_empty() {
            return Ok(FrameOutcome::NoPredictions);
        }

        let count = predictions.len();
        self.stats
            .detections
            .fetch_add(count as u64, Ordering::Relaxed);
        self.trigger.on_predictions(&self.camera, predictions)?;
        Ok(FrameOutcome::Triggered(count))
    }

    /// Error boundary: nothing a single frame does can stop the pipeline.
    pub fn handle(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Frame(frame) => {
                if let Err(err) = self.process_frame(frame) {
                    self.stats
                        .processing_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::error!("[{}] video processing error: {:#}", self.camera.id, err);
                }
            }
            FrameEvent::DecodeError(err) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("[{}] video processing error: {:#}", self.camera.id, err);
            }
            FrameEvent::Restarted => {
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                self.window.clear();
                log::debug!("[{}] transcoder restarted; frame window reset", self.camera.id);
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn run(mut self, frames: Receiver<FrameEvent>) {
        for event in frames {
            self.handle(event);
        }
        log::debug!("[{}] frame worker finished", self.camera.id);
    }
}

/// Runtime state for one camera. Dropping it releases everything it owns.
struct PipelineInstance {
    camera_id: String,
    transcoder: Option<SupervisorHandle>,
    feed: Option<SupervisorHandle>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl PipelineInstance {
    fn start(ctx: &PipelineContext, camera: &Camera) -> Result<Self> {
        let gate = ctx.detectors.motion_gate(camera)?;
        let dispatcher = DetectionDispatcher::for_camera(camera, ctx.detectors.as_ref())?;
        let processor = FrameProcessor::new(camera.clone(), gate, dispatcher, ctx.trigger.clone());
        let stats = processor.stats.clone();

        let (tx, rx) = mpsc::sync_channel(WINDOW_FRAMES);
        let worker = std::thread::Builder::new()
            .name(format!("frames-{}", camera.id))
            .spawn(move || processor.run(rx))
            .context("spawn frame worker")?;

        let mut supervisor =
            ProcessSupervisor::new(ctx.transcoder.program.clone(), ctx.transcoder.restart);
        if let Some(observer) = &ctx.observer {
            supervisor = supervisor.with_observer(observer.clone());
        }
        let mut instance = Self {
            camera_id: camera.id.clone(),
            transcoder: None,
            feed: None,
            worker: Some(worker),
            stats,
        };
        // On failure the task (and with it the frame sender) is dropped, so the
        // worker ends and `instance` drops cleanly.
        instance.transcoder =
            Some(supervisor.start(TranscoderTask::new(ctx.hub.clone(), camera.id.clone(), tx))?);

        if let Some(url) = &camera.stream_url {
            let feed = ProcessSupervisor::new(ctx.transcoder.program.clone(), ctx.transcoder.restart)
                .start(FeedTask::new(ctx.hub.clone(), camera.id.clone(), url.clone()))?;
            instance.feed = Some(feed);
        }
        log::info!("[{}] pipeline started ({} detector)", camera.id, camera.detector);
        Ok(instance)
    }

    fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(feed) = self.feed.take() {
            if let Err(err) = feed.stop() {
                first_err.get_or_insert(err);
            }
        }
        if let Some(transcoder) = self.transcoder.take() {
            if let Err(err) = transcoder.stop() {
                first_err.get_or_insert(err);
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                first_err.get_or_insert(anyhow!("[{}] frame worker panicked", self.camera_id));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for PipelineInstance {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("{:#}", err);
        }
    }
}

#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

/// One independent pipeline per active camera.
pub struct PipelineSupervisor {
    registry: CameraRegistry,
    ctx: PipelineContext,
    instances: Mutex<HashMap<String, PipelineInstance>>,
}

impl PipelineSupervisor {
    pub fn new(registry: CameraRegistry, ctx: PipelineContext) -> Self {
        Self {
            registry,
            ctx,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    /// Start every active camera. A camera that fails to start is reported
    /// and does not affect the others.
    pub fn start_all(&self) -> StartReport {
        let mut report = StartReport::default();
        let ids: Vec<String> = self.registry.active().map(|c| c.id.clone()).collect();
        for id in ids {
            match self.start_camera(&id) {
                Ok(()) => report.started.push(id),
                Err(err) => {
                    log::error!("[{}] failed to start pipeline: {:#}", id, err);
                    report.failed.push((id, err));
                }
            }
        }
        report
    }

    /// Start (or restart) processing for `camera_id`. Any running instance is
    /// fully stopped before the new one is created.
    pub fn start_camera(&self, camera_id: &str) -> Result<()> {
        let camera = self
            .registry
            .get(camera_id)
            .ok_or_else(|| anyhow!("unknown camera '{}'", camera_id))?;
        if !camera.is_active() {
            return Err(anyhow!("camera '{}' is disabled or deleted", camera_id));
        }

        let mut instances = self.lock()?;
        if let Some(existing) = instances.remove(camera_id) {
            self.stop_instance(existing)?;
        }
        let instance = PipelineInstance::start(&self.ctx, camera)?;
        instances.insert(camera_id.to_string(), instance);
        Ok(())
    }

    /// Returns whether a pipeline was running.
    pub fn stop_camera(&self, camera_id: &str) -> Result<bool> {
        let existing = self.lock()?.remove(camera_id);
        match existing {
            Some(instance) => {
                self.stop_instance(instance)?;
                log::info!("[{}] pipeline stopped", camera_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn restart_camera(&self, camera_id: &str) -> Result<()> {
        self.start_camera(camera_id)
    }

    pub fn stop_all(&self) -> Result<()> {
        let drained: Vec<PipelineInstance> = match self.instances.lock() {
            Ok(mut instances) => instances.drain().map(|(_, instance)| instance).collect(),
            Err(_) => return Err(anyhow!("pipeline table lock poisoned")),
        };
        let mut first_err = None;
        for instance in drained {
            let id = instance.camera_id.clone();
            if let Err(err) = self.stop_instance(instance) {
                log::warn!("[{}] stop failed: {:#}", id, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.instances
            .lock()
            .map(|instances| instances.contains_key(camera_id))
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .lock()
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> BTreeMap<String, StatsSnapshot> {
        self.instances
            .lock()
            .map(|instances| {
                instances
                    .iter()
                    .map(|(id, instance)| (id.clone(), instance.stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stops the instance, then any recording it started. The worker is gone
    /// by then, so no new recording can begin for the camera.
    fn stop_instance(&self, instance: PipelineInstance) -> Result<()> {
        let camera_id = instance.camera_id.clone();
        let stopped = instance.stop();
        self.ctx.trigger.cancel_recording(&camera_id);
        stopped
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PipelineInstance>>> {
        self.instances
            .lock()
            .map_err(|_| anyhow!("pipeline table lock poisoned"))
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::warn!("pipeline shutdown: {:#}", err);
        }
    }
}
