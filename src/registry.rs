//! Camera registry snapshot.
//!
//! Pipelines receive cameras from a validated, read-only snapshot taken at
//! startup. Changing a camera means building a new registry and restarting
//! that camera's pipeline; nothing mutates a running pipeline's view.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

pub const DEFAULT_RECORD_SECONDS: u32 = 10;

/// Which object-detection family handles motion events for a camera.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DetectorMode {
    Svm,
    Tf,
    /// Anything else found in configuration. Dispatches to no predictions.
    Unsupported(String),
}

impl DetectorMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "svm" => DetectorMode::Svm,
            "tf" => DetectorMode::Tf,
            _ => DetectorMode::Unsupported(value.to_string()),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, DetectorMode::Unsupported(_))
    }
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorMode::Svm => f.write_str("svm"),
            DetectorMode::Tf => f.write_str("tf"),
            DetectorMode::Unsupported(raw) => write!(f, "unsupported({raw})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventConfig {
    /// Request a recording (and persist an event) when something is detected.
    pub record_events: bool,
    pub record_seconds: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            record_events: false,
            record_seconds: DEFAULT_RECORD_SECONDS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Camera {
    pub id: String,
    pub enabled: bool,
    /// Deletion marker (epoch ms). Deleted cameras never start.
    pub deleted_on_ms: Option<u64>,
    pub detector: DetectorMode,
    /// Upstream stream URL pulled into the stream hub, if this process owns the feed.
    pub stream_url: Option<String>,
    pub events: EventConfig,
}

impl Camera {
    pub fn new(id: impl Into<String>, detector: DetectorMode) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            deleted_on_ms: None,
            detector,
            stream_url: None,
            events: EventConfig::default(),
        }
    }

    pub fn with_events(mut self, events: EventConfig) -> Self {
        self.events = events;
        self
    }

    /// Enabled and not deleted.
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_on_ms.is_none()
    }
}

pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<Result<regex::Regex, regex::Error>> = OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$"))
        .as_ref()
        .map_err(|e| anyhow!("camera id pattern: {}", e))?;
    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id '{}' must match ^[A-Za-z0-9_-]{{1,64}}$",
            camera_id
        ));
    }
    Ok(())
}

/// Immutable camera snapshot shared by all pipelines.
#[derive(Clone, Debug, Default)]
pub struct CameraRegistry {
    cameras: Arc<BTreeMap<String, Camera>>,
}

impl CameraRegistry {
    pub fn new(cameras: Vec<Camera>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for camera in cameras {
            validate_camera_id(&camera.id)?;
            if camera.events.record_seconds == 0 {
                return Err(anyhow!(
                    "camera '{}': record_seconds must be greater than zero",
                    camera.id
                ));
            }
            let id = camera.id.clone();
            if map.insert(id.clone(), camera).is_some() {
                return Err(anyhow!("duplicate camera id '{}'", id));
            }
        }
        Ok(Self {
            cameras: Arc::new(map),
        })
    }

    pub fn get(&self, camera_id: &str) -> Option<&Camera> {
        self.cameras.get(camera_id)
    }

    /// Cameras that should be processing video.
    pub fn active(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values().filter(|camera| camera.is_active())
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_mode_parses_known_and_unknown_values() {
        assert_eq!(DetectorMode::parse("svm"), DetectorMode::Svm);
        assert_eq!(DetectorMode::parse(" TF "), DetectorMode::Tf);
        let other = DetectorMode::parse("yolo");
        assert_eq!(other, DetectorMode::Unsupported("yolo".to_string()));
        assert!(!other.is_supported());
    }

    #[test]
    fn registry_filters_inactive_cameras() {
        let mut disabled = Camera::new("garage", DetectorMode::Svm);
        disabled.enabled = false;
        let mut deleted = Camera::new("porch", DetectorMode::Tf);
        deleted.deleted_on_ms = Some(1_700_000_000_000);
        let live = Camera::new("front_door", DetectorMode::Tf);

        let registry = CameraRegistry::new(vec![disabled, deleted, live]).unwrap();
        let active: Vec<_> = registry.active().map(|c| c.id.as_str()).collect();
        assert_eq!(active, vec!["front_door"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_ids() {
        let dup = CameraRegistry::new(vec![
            Camera::new("cam1", DetectorMode::Svm),
            Camera::new("cam1", DetectorMode::Tf),
        ]);
        assert!(dup.is_err());

        let bad = CameraRegistry::new(vec![Camera::new("cam/1", DetectorMode::Svm)]);
        assert!(bad.is_err());
    }
}
