//! Upstream camera feed.
//!
//! For cameras configured with a `stream_url`, a supervised process pulls the
//! camera stream and remuxes it to MPEG-TS on stdout without re-encoding. The
//! bytes are published to the camera's hub topic as they arrive.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::ChildStdout;
use std::thread::JoinHandle;

use super::hub::StreamHub;
use super::process::ProcessTask;

const READ_CHUNK: usize = 64 * 1024;

/// Arguments for pulling `url` into MPEG-TS on stdout.
pub fn feed_args(url: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|a| a.to_string())
        .collect();
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.push("-rtsp_transport".to_string());
        args.push("tcp".to_string());
    }
    for arg in ["-i", url, "-an", "-c:v", "copy", "-f", "mpegts", "-"] {
        args.push(arg.to_string());
    }
    args
}

pub(crate) struct FeedTask {
    hub: StreamHub,
    camera_id: String,
    url: String,
}

impl FeedTask {
    pub(crate) fn new(hub: StreamHub, camera_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            hub,
            camera_id: camera_id.into(),
            url: url.into(),
        }
    }
}

impl ProcessTask for FeedTask {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn label(&self) -> &'static str {
        "camera feed"
    }

    fn prepare(&mut self) -> Result<Vec<String>> {
        Ok(feed_args(&self.url))
    }

    fn attach(&mut self, stdout: ChildStdout) -> Result<JoinHandle<()>> {
        let hub = self.hub.clone();
        let camera_id = self.camera_id.clone();
        std::thread::Builder::new()
            .name(format!("feed-{}", camera_id))
            .spawn(move || pump(stdout, &hub, &camera_id))
            .context("spawn feed reader thread")
    }

    fn release(&mut self) {}
}

fn pump(mut source: impl Read, hub: &StreamHub, camera_id: &str) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if let Err(err) = hub.publish(camera_id, &buf[..n]) {
                    log::error!("[{}] feed publish failed: {:#}", camera_id, err);
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("[{}] feed read failed: {}", camera_id, err);
                break;
            }
        }
    }
    log::debug!("[{}] feed ended after {} bytes", camera_id, total);
}
