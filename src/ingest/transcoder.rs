//! Transcoder process for the analysis pipeline.
//!
//! Each run opens a fresh loopback relay, points the transcoder at it, and
//! decodes the transcoder's stdout into frames for the pipeline worker. The
//! transcoder reduces camera video to 2 frames per second at 640x360 RGBA,
//! emitted as concatenated PAM images with audio dropped.

use anyhow::{Context, Result};
use std::process::ChildStdout;
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;

use super::hub::StreamHub;
use super::pam::PamDecoder;
use super::process::{ProcessTask, RestartPolicy};
use super::relay::{RelayHandle, StreamRelay};
use crate::frame::Frame;

pub const ANALYSIS_FPS: u32 = 2;
pub const ANALYSIS_WIDTH: u32 = 640;
pub const ANALYSIS_HEIGHT: u32 = 360;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscoderSettings {
    /// Transcoder executable (ffmpeg compatible).
    pub program: String,
    pub restart: RestartPolicy,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Argument list for one transcoder run reading from `input_url`.
pub fn transcoder_args(input_url: &str) -> Vec<String> {
    let filter = format!(
        "fps={},scale={}:{}",
        ANALYSIS_FPS, ANALYSIS_WIDTH, ANALYSIS_HEIGHT
    );
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-analyzeduration",
        "0",
        "-f",
        "mpegts",
        "-i",
        input_url,
        "-an",
        "-vcodec",
        "pam",
        "-pix_fmt",
        "rgba",
        "-f",
        "image2pipe",
        "-vf",
        &filter,
        "-",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Output of the transcoder's decode thread, consumed by the pipeline worker.
#[derive(Debug)]
pub enum FrameEvent {
    Frame(Frame),
    DecodeError(anyhow::Error),
    /// A new transcoder run began; earlier frames belong to a different stream.
    Restarted,
}

pub(crate) struct TranscoderTask {
    hub: StreamHub,
    camera_id: String,
    relay: Option<RelayHandle>,
    frames: SyncSender<FrameEvent>,
    runs: u64,
}

impl TranscoderTask {
    pub(crate) fn new(hub: StreamHub, camera_id: impl Into<String>, frames: SyncSender<FrameEvent>) -> Self {
        Self {
            hub,
            camera_id: camera_id.into(),
            relay: None,
            frames,
            runs: 0,
        }
    }
}

impl ProcessTask for TranscoderTask {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn label(&self) -> &'static str {
        "video analysis"
    }

    fn prepare(&mut self) -> Result<Vec<String>> {
        let relay = StreamRelay::new(self.hub.clone(), self.camera_id.clone()).open()?;
        let args = transcoder_args(&relay.input_url());
        self.relay = Some(relay);
        if self.runs > 0 {
            // Receiver gone means the pipeline is shutting down; the supervisor will follow.
            let _ = self.frames.send(FrameEvent::Restarted);
        }
        self.runs += 1;
        Ok(args)
    }

    fn attach(&mut self, stdout: ChildStdout) -> Result<JoinHandle<()>> {
        let frames = self.frames.clone();
        let camera_id = self.camera_id.clone();
        std::thread::Builder::new()
            .name(format!("decode-{}", camera_id))
            .spawn(move || {
                let mut decoder = PamDecoder::new(stdout);
                for item in decoder.by_ref() {
                    let event = match item {
                        Ok(frame) => FrameEvent::Frame(frame),
                        Err(err) => FrameEvent::DecodeError(err),
                    };
                    if frames.send(event).is_err() {
                        break;
                    }
                }
                log::debug!(
                    "[{}] decoder finished: {} frames, {} failures",
                    camera_id,
                    decoder.frames_decoded(),
                    decoder.failures()
                );
            })
            .context("spawn decode thread")
    }

    fn release(&mut self) {
        if let Some(relay) = self.relay.take() {
            if let Err(err) = relay.close() {
                log::warn!("[{}] relay close failed: {:#}", self.camera_id, err);
            }
        }
    }
}
