//! In-process stream-data channel.
//!
//! Raw transport-stream bytes for a camera are published here (by the camera
//! feed or any other upstream source) and fanned out to every subscriber of
//! that camera: the relay connection feeding the transcoder, and any running
//! recording.
//!
//! Subscriptions are explicit. A `Subscription` unregisters itself when
//! dropped, so restarting a pipeline cannot accumulate stale listeners.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, immutable chunk of stream bytes.
pub type Chunk = Arc<[u8]>;

/// Backlog at which a subscriber is reported as lagging. Delivery continues.
pub const SUBSCRIBER_BACKLOG_WARN_CHUNKS: usize = 256;

/// Chunks published to a subscriber but not yet received by it.
#[derive(Default)]
struct Backlog {
    queued: AtomicUsize,
    warned: AtomicBool,
}

struct Subscriber {
    id: u64,
    tx: Sender<Chunk>,
    backlog: Arc<Backlog>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber>>,
}

/// Per-camera publish/subscribe hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct StreamHub {
    inner: Arc<Mutex<HubInner>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a chunk to every current subscriber of `camera_id`.
    ///
    /// Every subscriber receives every chunk, in publish order. Queues are
    /// unbounded so the publisher never blocks; a subscriber whose backlog
    /// reaches `SUBSCRIBER_BACKLOG_WARN_CHUNKS` is logged once per episode.
    /// Returns the number of subscribers the chunk was queued for.
    pub fn publish(&self, camera_id: &str, data: &[u8]) -> Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("stream hub lock poisoned"))?;
        let Some(subscribers) = inner.topics.get_mut(camera_id) else {
            return Ok(0);
        };
        let chunk: Chunk = Arc::from(data);
        let mut delivered = 0;
        subscribers.retain(|sub| {
            let queued = sub.backlog.queued.fetch_add(1, Ordering::SeqCst) + 1;
            if sub.tx.send(chunk.clone()).is_err() {
                return false;
            }
            delivered += 1;
            if queued >= SUBSCRIBER_BACKLOG_WARN_CHUNKS
                && !sub.backlog.warned.swap(true, Ordering::SeqCst)
            {
                log::warn!(
                    "[{}] subscriber {} lagging: {} chunks queued",
                    camera_id,
                    sub.id,
                    queued
                );
            }
            true
        });
        if subscribers.is_empty() {
            inner.topics.remove(camera_id);
        }
        Ok(delivered)
    }

    pub fn subscribe(&self, camera_id: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel();
        let backlog = Arc::new(Backlog::default());
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("stream hub lock poisoned"))?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .topics
            .entry(camera_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                backlog: backlog.clone(),
            });
        Ok(Subscription {
            hub: self.clone(),
            camera_id: camera_id.to_string(),
            id,
            rx,
            backlog,
        })
    }

    pub fn subscriber_count(&self, camera_id: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.topics.get(camera_id).map_or(0, |subs| subs.len()))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, camera_id: &str, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(subscribers) = inner.topics.get_mut(camera_id) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                inner.topics.remove(camera_id);
            }
        }
    }
}

/// One registered listener on a camera's stream.
pub struct Subscription {
    hub: StreamHub,
    camera_id: String,
    id: u64,
    rx: Receiver<Chunk>,
    backlog: Arc<Backlog>,
}

impl Subscription {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Chunks published to this subscription and not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.queued.load(Ordering::SeqCst)
    }

    /// Next chunk in publish order. `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Chunk>> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                let left = self.backlog.queued.fetch_sub(1, Ordering::SeqCst) - 1;
                if left < SUBSCRIBER_BACKLOG_WARN_CHUNKS / 2 {
                    self.backlog.warned.store(false, Ordering::SeqCst);
                }
                Ok(Some(chunk))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("stream hub dropped subscription"))
            }
        }
    }

    /// Explicitly unregister. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.camera_id, self.id);
    }
}
