use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::ingest::StreamHub;

/// Invoked once a requested recording has finished successfully.
pub type RecordingCallback = Box<dyn FnOnce() + Send + 'static>;

/// Recording subsystem: request-with-callback.
pub trait Recorder: Send + Sync {
    fn request_recording(
        &self,
        camera_id: &str,
        seconds: u32,
        on_complete: RecordingCallback,
    ) -> Result<()>;

    /// Stop the camera's in-progress recording, if any, and wait for it to
    /// let go of the stream.
    fn cancel(&self, _camera_id: &str) {}
}

/// Extra time the stream is fed past the clip length before input is closed.
const RECORDING_GRACE: Duration = Duration::from_secs(5);
const CHUNK_POLL: Duration = Duration::from_millis(100);

/// Records clips by piping the camera's hub stream through a remuxer.
///
/// At most one recording runs per camera; requests arriving while one is in
/// progress are ignored. A cancelled recording closes the remuxer's input
/// early, so the clip is cut short but still finalized.
pub struct ClipRecorder {
    hub: StreamHub,
    program: String,
    dir: PathBuf,
    next_id: AtomicU64,
    active: Arc<Mutex<HashMap<String, ActiveRecording>>>,
}

struct ActiveRecording {
    id: u64,
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ClipRecorder {
    pub fn new(hub: StreamHub, program: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            hub,
            program: program.into(),
            dir: dir.into(),
            next_id: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_recording(&self, camera_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(camera_id))
            .unwrap_or(false)
    }

    pub fn clip_path(&self, camera_id: &str, started_ms: u64) -> PathBuf {
        self.dir.join(format!("{}-{}.mp4", camera_id, started_ms))
    }
}

/// Arguments remuxing MPEG-TS on stdin into `output` for `seconds`.
pub fn recording_args(seconds: u32, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "mpegts".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-t".to_string(),
        seconds.to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-y".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

impl Recorder for ClipRecorder {
    fn request_recording(
        &self,
        camera_id: &str,
        seconds: u32,
        on_complete: RecordingCallback,
    ) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| anyhow!("recorder lock poisoned"))?;
            if active.contains_key(camera_id) {
                log::debug!("[{}] recording already in progress", camera_id);
                return Ok(());
            }
            active.insert(
                camera_id.to_string(),
                ActiveRecording {
                    id,
                    cancel: cancel.clone(),
                    join: None,
                },
            );
        }
        let guard = ActiveGuard {
            active: self.active.clone(),
            camera_id: camera_id.to_string(),
            id,
        };

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create recordings dir {}", self.dir.display()))?;
        let output = self.clip_path(camera_id, crate::now_ms()?);
        let subscription = self.hub.subscribe(camera_id)?;
        let mut child = Command::new(&self.program)
            .args(recording_args(seconds, &output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("[{}] spawn recorder '{}'", camera_id, self.program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("recorder stdin unavailable"))?;

        log::info!("[{}] recording {}s to {}", camera_id, seconds, output.display());
        let thread_camera_id = camera_id.to_string();
        let deadline = Instant::now() + Duration::from_secs(seconds as u64) + RECORDING_GRACE;
        let handle = std::thread::Builder::new()
            .name(format!("record-{}", camera_id))
            .spawn(move || {
                let _guard = guard;
                let camera_id = thread_camera_id;
                while Instant::now() < deadline {
                    if cancel.load(Ordering::SeqCst) {
                        log::info!("[{}] recording cancelled; finalizing clip", camera_id);
                        break;
                    }
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        break;
                    }
                    match subscription.recv_timeout(CHUNK_POLL) {
                        Ok(Some(chunk)) => {
                            // The remuxer closes its input once the clip is long enough.
                            if stdin.write_all(&chunk).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(_) => break,
                    }
                }
                drop(stdin);
                drop(subscription);
                match child.wait() {
                    Ok(status) if status.success() => {
                        log::info!("[{}] recording saved to {}", camera_id, output.display());
                        on_complete();
                    }
                    Ok(status) => {
                        log::warn!("[{}] recording failed with {}", camera_id, status)
                    }
                    Err(err) => log::warn!("[{}] recording wait failed: {}", camera_id, err),
                }
            })
            .context("spawn recording thread")?;

        // The entry may already be gone if the recording finished or was cancelled.
        if let Ok(mut active) = self.active.lock() {
            if let Some(entry) = active.get_mut(camera_id).filter(|entry| entry.id == id) {
                entry.join = Some(handle);
            }
        }
        Ok(())
    }

    fn cancel(&self, camera_id: &str) {
        let entry = match self.active.lock() {
            Ok(mut active) => active.remove(camera_id),
            Err(_) => return,
        };
        let Some(entry) = entry else {
            return;
        };
        entry.cancel.store(true, Ordering::SeqCst);
        if let Some(join) = entry.join {
            if join.join().is_err() {
                log::warn!("[{}] recording thread panicked", camera_id);
            }
        }
    }
}

/// Clears the camera's busy entry, unless a newer recording has replaced it.
struct ActiveGuard {
    active: Arc<Mutex<HashMap<String, ActiveRecording>>>,
    camera_id: String,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if active.get(&self.camera_id).is_some_and(|entry| entry.id == self.id) {
                active.remove(&self.camera_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::mpsc;

    #[test]
    fn args_remux_stdin_for_requested_duration() {
        let args = recording_args(10, Path::new("/tmp/rec/cam1-1.mp4"));
        assert_eq!(
            args.join(" "),
            "-hide_banner -loglevel error -f mpegts -i pipe:0 -t 10 -c copy -y /tmp/rec/cam1-1.mp4"
        );
    }

    #[test]
    fn completion_callback_runs_after_successful_exit() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ClipRecorder::new(StreamHub::new(), "true", dir.path());
        let (tx, rx) = mpsc::channel();
        recorder
            .request_recording("cam1", 1, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn concurrent_request_for_same_camera_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ClipRecorder::new(StreamHub::new(), "true", dir.path());
        recorder.active.lock().unwrap().insert(
            "cam1".to_string(),
            ActiveRecording {
                id: u64::MAX,
                cancel: Arc::new(AtomicBool::new(false)),
                join: None,
            },
        );
        let (tx, rx) = mpsc::channel::<()>();
        recorder
            .request_recording("cam1", 1, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(recorder.is_recording("cam1"));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn failed_recording_skips_callback_and_clears_busy_flag() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ClipRecorder::new(StreamHub::new(), "false", dir.path());
        let (tx, rx) = mpsc::channel::<()>();
        recorder
            .request_recording("cam1", 1, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        // The callback is dropped unrun, so the channel disconnects.
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(10)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.is_recording("cam1") {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn cancel_releases_stream_and_finalizes_clip() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("remux.sh");
        std::fs::write(&script, "#!/bin/sh\nexec cat > /dev/null\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hub = StreamHub::new();
        let recorder = ClipRecorder::new(hub.clone(), script.to_str().unwrap(), dir.path());
        let (tx, rx) = mpsc::channel();
        recorder
            .request_recording("cam1", 60, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(recorder.is_recording("cam1"));
        assert_eq!(hub.subscriber_count("cam1"), 1);
        hub.publish("cam1", b"ts bytes").unwrap();

        let started = Instant::now();
        recorder.cancel("cam1");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(hub.subscriber_count("cam1"), 0);
        assert!(!recorder.is_recording("cam1"));
        // The remuxer exits cleanly on end of input, so the clip counts.
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // Cancelling with nothing in progress is a no-op.
        recorder.cancel("cam1");
    }
}
