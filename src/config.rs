use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{RestartPolicy, TranscoderSettings};
use crate::registry::{Camera, CameraRegistry, DetectorMode, EventConfig, DEFAULT_RECORD_SECONDS};

const DEFAULT_DB_PATH: &str = "events.db";
const DEFAULT_TRANSCODER: &str = "ffmpeg";
const DEFAULT_RESTART_DELAY_MS: u64 = 14_000;
const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_TOPIC_PREFIX: &str = "motion-watch";

#[derive(Debug, Deserialize, Default)]
struct WatchdConfigFile {
    db_path: Option<String>,
    transcoder: Option<TranscoderConfigFile>,
    recordings: Option<RecordingsConfigFile>,
    broadcast: Option<BroadcastConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct TranscoderConfigFile {
    program: Option<String>,
    restart_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingsConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct BroadcastConfigFile {
    mqtt_broker_addr: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    enabled: Option<bool>,
    deleted_on: Option<u64>,
    detector: String,
    stream_url: Option<String>,
    event: Option<EventConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct EventConfigFile {
    record_events: Option<bool>,
    record_seconds: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WatchdConfig {
    pub db_path: String,
    pub transcoder: TranscoderSettings,
    pub recordings_dir: PathBuf,
    pub broadcast: BroadcastSettings,
    pub cameras: Vec<Camera>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// MQTT broker; `None` keeps detections on the in-process bus.
    pub mqtt_broker_addr: Option<String>,
    pub topic_prefix: String,
}

impl WatchdConfig {
    /// File named by `WATCH_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchdConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let transcoder = TranscoderSettings {
            program: file
                .transcoder
                .as_ref()
                .and_then(|t| t.program.clone())
                .unwrap_or_else(|| DEFAULT_TRANSCODER.to_string()),
            restart: RestartPolicy::fixed(Duration::from_millis(
                file.transcoder
                    .as_ref()
                    .and_then(|t| t.restart_delay_ms)
                    .unwrap_or(DEFAULT_RESTART_DELAY_MS),
            )),
        };
        let recordings_dir = file
            .recordings
            .and_then(|r| r.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR));
        let broadcast = BroadcastSettings {
            mqtt_broker_addr: file
                .broadcast
                .as_ref()
                .and_then(|b| b.mqtt_broker_addr.clone()),
            topic_prefix: file
                .broadcast
                .and_then(|b| b.topic_prefix)
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
        };
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(camera_from_file)
            .collect();
        Ok(Self {
            db_path,
            transcoder,
            recordings_dir,
            broadcast,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("WATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(program) = std::env::var("WATCH_FFMPEG") {
            if !program.trim().is_empty() {
                self.transcoder.program = program;
            }
        }
        if let Ok(delay) = std::env::var("WATCH_RESTART_DELAY_MS") {
            let ms: u64 = delay.parse().map_err(|_| {
                anyhow!("WATCH_RESTART_DELAY_MS must be an integer number of milliseconds")
            })?;
            self.transcoder.restart = RestartPolicy::fixed(Duration::from_millis(ms));
        }
        if let Ok(dir) = std::env::var("WATCH_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.recordings_dir = PathBuf::from(dir);
            }
        }
        if let Ok(addr) = std::env::var("WATCH_MQTT_BROKER_ADDR") {
            let addr = addr.trim();
            self.broadcast.mqtt_broker_addr = if addr.is_empty() {
                None
            } else {
                Some(addr.to_string())
            };
        }
        if let Ok(prefix) = std::env::var("WATCH_MQTT_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.broadcast.topic_prefix = prefix;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.transcoder.restart.delay.is_zero() {
            return Err(anyhow!("transcoder restart delay must be greater than zero"));
        }
        if self.transcoder.program.trim().is_empty() {
            return Err(anyhow!("transcoder program must not be empty"));
        }
        if let Some(addr) = &self.broadcast.mqtt_broker_addr {
            crate::event::MqttEndpoint::parse(addr)?;
        }
        // Registry construction checks ids, duplicates and record durations.
        self.registry()?;
        Ok(())
    }

    /// Read-only camera snapshot for the pipelines.
    pub fn registry(&self) -> Result<CameraRegistry> {
        CameraRegistry::new(self.cameras.clone())
    }
}

fn camera_from_file(file: CameraConfigFile) -> Camera {
    let event = file.event.unwrap_or_default();
    Camera {
        id: file.id,
        enabled: file.enabled.unwrap_or(true),
        deleted_on_ms: file.deleted_on,
        detector: DetectorMode::parse(&file.detector),
        stream_url: file.stream_url.filter(|url| !url.trim().is_empty()),
        events: EventConfig {
            record_events: event.record_events.unwrap_or(false),
            record_seconds: event.record_seconds.unwrap_or(DEFAULT_RECORD_SECONDS),
        },
    }
}

fn read_config_file(path: &Path) -> Result<WatchdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
