//! watchd - per-camera motion watch daemon
//!
//! This daemon:
//! 1. Loads the camera snapshot and daemon settings
//! 2. Starts one analysis pipeline per active camera
//! 3. Broadcasts detections (MQTT when configured, in-process otherwise)
//! 4. Records clips and persists events for cameras that ask for it
//! 5. Logs per-camera statistics until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motion_watch::config::WatchdConfig;
use motion_watch::event::{DetectionSink, MqttEndpoint};
use motion_watch::{
    ClipRecorder, DetectionBus, EventTrigger, MqttDetectionSink, NullDetectorFactory,
    PipelineContext, PipelineSupervisor, SqliteEventStore, StreamHub,
};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run motion-gated detection pipelines for configured cameras")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Print the resolved configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = WatchdConfig::load_from(args.config.as_deref())?;
    if args.print_config {
        println!("{:#?}", cfg);
        return Ok(());
    }
    let registry = cfg.registry()?;
    if registry.active().next().is_none() {
        log::warn!("no active cameras configured");
    }

    let hub = StreamHub::new();
    let store = Arc::new(SqliteEventStore::open(&cfg.db_path)?);
    let recorder = Arc::new(ClipRecorder::new(
        hub.clone(),
        cfg.transcoder.program.clone(),
        cfg.recordings_dir.clone(),
    ));
    let mqtt = match &cfg.broadcast.mqtt_broker_addr {
        Some(addr) => {
            let endpoint = MqttEndpoint::parse(addr)?;
            let client_id = format!("watchd-{}", std::process::id());
            Some(Arc::new(MqttDetectionSink::connect(
                &endpoint,
                &client_id,
                &cfg.broadcast.topic_prefix,
            )?))
        }
        None => {
            log::info!("no MQTT broker configured; detections stay in-process");
            None
        }
    };
    let sink: Arc<dyn DetectionSink> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => Arc::new(DetectionBus::new()),
    };
    log::warn!("no detection models linked; svm/tf cameras will report no predictions");

    let ctx = PipelineContext {
        hub,
        transcoder: cfg.transcoder.clone(),
        detectors: Arc::new(NullDetectorFactory),
        trigger: Arc::new(EventTrigger::new(sink, recorder, store)),
        observer: None,
    };
    let supervisor = PipelineSupervisor::new(registry, ctx);
    let report = supervisor.start_all();
    log::info!(
        "watchd running: {} pipelines started, {} failed. writing events to {}",
        report.started.len(),
        report.failed.len(),
        cfg.db_path
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    loop {
        match rx.recv_timeout(STATS_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for (camera_id, stats) in supervisor.stats() {
                    log::info!(
                        "[{}] frames={} decode_failures={} motion={} detections={} failures={} restarts={}",
                        camera_id,
                        stats.frames_decoded,
                        stats.decode_failures,
                        stats.motion_frames,
                        stats.detections,
                        stats.processing_failures,
                        stats.restarts
                    );
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping pipelines...");
    supervisor.stop_all()?;
    if let Some(mqtt) = mqtt {
        if let Err(err) = mqtt.disconnect() {
            log::warn!("MQTT disconnect failed: {:#}", err);
        }
    }
    Ok(())
}
