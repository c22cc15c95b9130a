//! Stream ingestion.
//!
//! This module moves camera video from its source to decoded frames:
//! - `hub`: per-camera publish/subscribe channel for raw transport-stream bytes
//! - `feed`: optional supervised process pulling a camera URL into the hub
//! - `relay`: loopback TCP listener exposing a hub topic to the transcoder
//! - `transcoder`: the supervised transcoder run and its frame output
//! - `pam`: streaming decoder for the transcoder's concatenated PAM images
//! - `process`: restart supervision shared by the feed and the transcoder
//!
//! The ingestion layer MUST NOT:
//! - Store raw frames to disk
//! - Log raw frame content

pub mod feed;
pub mod hub;
pub mod pam;
pub mod process;
pub mod relay;
pub mod transcoder;

pub use feed::feed_args;
pub use hub::{Chunk, StreamHub, Subscription, SUBSCRIBER_BACKLOG_WARN_CHUNKS};
pub use pam::{encode_pam, PamDecoder};
pub use process::{
    LifecycleEvent, ProcessState, ProcessSupervisor, ProcessTask, RestartPolicy, SupervisorHandle,
    DEFAULT_RESTART_DELAY,
};
pub use relay::{RelayHandle, StreamRelay};
pub use transcoder::{transcoder_args, FrameEvent, TranscoderSettings};
