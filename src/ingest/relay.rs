//! Loopback TCP relay from the stream hub to the transcoder.
//!
//! The transcoder only accepts network input, so each pipeline run opens a
//! listener on `127.0.0.1:0` and hands the OS-assigned port to the transcoder
//! as `tcp://127.0.0.1:<port>`. Every accepted connection subscribes to the
//! camera's hub topic and receives each published chunk in order until the
//! peer disconnects or the relay is closed.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::hub::StreamHub;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CHUNK_POLL: Duration = Duration::from_millis(100);

pub struct StreamRelay {
    hub: StreamHub,
    camera_id: String,
}

impl StreamRelay {
    pub fn new(hub: StreamHub, camera_id: impl Into<String>) -> Self {
        Self {
            hub,
            camera_id: camera_id.into(),
        }
    }

    /// Bind the listener and start accepting. The port is known before any
    /// connection exists. A bind failure is returned to the caller.
    pub fn open(self) -> Result<RelayHandle> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .with_context(|| format!("[{}] bind loopback relay listener", self.camera_id))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let camera_id = self.camera_id.clone();
        let hub = self.hub;
        let join = std::thread::Builder::new()
            .name(format!("relay-{}", camera_id))
            .spawn(move || {
                if let Err(err) = run_relay(listener, &hub, &camera_id, &shutdown_thread) {
                    log::error!("[{}] stream relay stopped: {:#}", camera_id, err);
                }
            })
            .context("spawn relay thread")?;

        log::debug!("[{}] stream relay listening on {}", self.camera_id, addr);
        Ok(RelayHandle {
            addr,
            camera_id: self.camera_id,
            shutdown,
            join: Some(join),
        })
    }
}

/// Running relay. Closing (or dropping) releases the listener and every
/// connection's hub subscription.
#[derive(Debug)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    camera_id: String,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Input URL for the transcoder.
    pub fn input_url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.addr.port())
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("[{}] relay thread panicked", self.camera_id))?;
        }
        Ok(())
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_and_join() {
            log::warn!("{:#}", err);
        }
    }
}

fn run_relay(
    listener: TcpListener,
    hub: &StreamHub,
    camera_id: &str,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    // Each connection keeps a socket handle so close can interrupt a blocked write.
    let mut connections: Vec<(TcpStream, JoinHandle<()>)> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        connections.retain(|(_, handle)| !handle.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("[{}] relay connection from {}", camera_id, peer);
                match spawn_connection(stream, hub, camera_id, shutdown.clone()) {
                    Ok(connection) => connections.push(connection),
                    Err(err) => log::warn!("[{}] relay connection rejected: {:#}", camera_id, err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => break Err(err.into()),
        }
    };
    // Listener drops here; connections see the shared shutdown flag.
    drop(listener);
    shutdown.store(true, Ordering::SeqCst);
    for (stream, handle) in connections {
        let _ = stream.shutdown(std::net::Shutdown::Both);
        let _ = handle.join();
    }
    result
}

fn spawn_connection(
    stream: TcpStream,
    hub: &StreamHub,
    camera_id: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(TcpStream, JoinHandle<()>)> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    // Writes block until the peer reads; a slow transcoder slows the relay
    // instead of losing stream bytes.
    let control = stream.try_clone().context("clone relay connection")?;
    // Subscribe before the thread starts so no chunk published after accept is missed.
    let subscription = hub.subscribe(camera_id)?;
    let camera_id = camera_id.to_string();
    let handle = std::thread::Builder::new()
        .name(format!("relay-conn-{}", camera_id))
        .spawn(move || {
            let mut stream = stream;
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let chunk = match subscription.recv_timeout(CHUNK_POLL) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(err) => {
                        log::debug!("[{}] relay subscription ended: {:#}", camera_id, err);
                        break;
                    }
                };
                if let Err(err) = stream.write_all(&chunk) {
                    log::debug!("[{}] relay peer went away: {}", camera_id, err);
                    break;
                }
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
            subscription.unsubscribe();
        })
        .context("spawn relay connection thread")?;
    Ok((control, handle))
}
