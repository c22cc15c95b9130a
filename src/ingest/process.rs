//! Supervised external processes.
//!
//! A `ProcessSupervisor` runs one external program per camera and restarts it
//! after every exit, clean or not, following a fixed-delay `RestartPolicy`.
//! Each run walks `Starting -> Running -> Exited`; the pending restart wait is
//! cancelled by `SupervisorHandle::stop`, which also kills a running child.
//!
//! The supervised `ProcessTask` keeps the camera it was started for, so every
//! restart runs for the same camera.

use anyhow::{anyhow, Context, Result};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Delay between a process exit and the next start attempt.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(14);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Fixed-delay restart policy: no backoff, no jitter, no retry cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Earliest instant the next start may happen after an exit at `exited_at`.
    pub fn next_attempt(&self, exited_at: Instant) -> Instant {
        exited_at + self.delay
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RESTART_DELAY)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
}

/// Observable lifecycle of a supervised process.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    Started {
        camera_id: String,
        pid: u32,
        at: Instant,
    },
    Exited {
        camera_id: String,
        code: Option<i32>,
        at: Instant,
    },
    Restarting {
        camera_id: String,
        attempt_at: Instant,
    },
    Stopped {
        camera_id: String,
        at: Instant,
    },
}

impl LifecycleEvent {
    pub fn camera_id(&self) -> &str {
        match self {
            LifecycleEvent::Started { camera_id, .. }
            | LifecycleEvent::Exited { camera_id, .. }
            | LifecycleEvent::Restarting { camera_id, .. }
            | LifecycleEvent::Stopped { camera_id, .. } => camera_id,
        }
    }
}

/// Per-camera work around one supervised program.
pub trait ProcessTask: Send + 'static {
    /// Camera this task serves. Constant for the life of the task.
    fn camera_id(&self) -> &str;

    /// Short human label for logs ("video analysis", "camera feed").
    fn label(&self) -> &'static str;

    /// Acquire per-run resources and return the program arguments.
    fn prepare(&mut self) -> Result<Vec<String>>;

    /// Start consuming the child's stdout. The returned thread must end at EOF.
    fn attach(&mut self, stdout: ChildStdout) -> Result<JoinHandle<()>>;

    /// Release per-run resources once the process has exited.
    fn release(&mut self);
}

pub struct ProcessSupervisor {
    program: String,
    policy: RestartPolicy,
    observer: Option<Sender<LifecycleEvent>>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            program: program.into(),
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Sender<LifecycleEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Prepare the first run synchronously, then supervise on a background
    /// thread. Failing to prepare the first run is returned to the caller.
    pub fn start<T: ProcessTask>(self, mut task: T) -> Result<SupervisorHandle> {
        let camera_id = task.camera_id().to_string();
        let first_args = task
            .prepare()
            .with_context(|| format!("[{}] start {}", camera_id, task.label()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(ProcessState::Starting));
        let runner = Runner {
            program: self.program,
            policy: self.policy,
            observer: self.observer,
            stop: stop.clone(),
            state: state.clone(),
            camera_id: camera_id.clone(),
        };
        let join = std::thread::Builder::new()
            .name(format!("supervise-{}", camera_id))
            .spawn(move || runner.run(task, first_args))
            .context("spawn supervisor thread")?;

        Ok(SupervisorHandle {
            camera_id,
            stop,
            state,
            join: Some(join),
        })
    }
}

pub struct SupervisorHandle {
    camera_id: String,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<ProcessState>>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn state(&self) -> ProcessState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ProcessState::Exited)
    }

    /// Kill the running process, cancel any pending restart, and wait for
    /// per-run resources to be released.
    pub fn stop(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("[{}] supervisor thread panicked", self.camera_id))?;
        }
        Ok(())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_join() {
            log::warn!("{:#}", err);
        }
    }
}

struct Runner {
    program: String,
    policy: RestartPolicy,
    observer: Option<Sender<LifecycleEvent>>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<ProcessState>>,
    camera_id: String,
}

impl Runner {
    fn run<T: ProcessTask>(self, mut task: T, first_args: Vec<String>) {
        let mut pending_args = Some(first_args);
        loop {
            self.set_state(ProcessState::Starting);
            let args = match pending_args.take() {
                Some(args) => Some(args),
                None => match task.prepare() {
                    Ok(args) => Some(args),
                    Err(err) => {
                        log::error!("[{}] {} restart failed: {:#}", self.camera_id, task.label(), err);
                        None
                    }
                },
            };

            let mut code = None;
            if let Some(args) = args {
                match self.run_once(&mut task, args) {
                    Ok(exit_code) => {
                        code = exit_code;
                        if !self.stopped() {
                            log::warn!(
                                "[{}] {} process closed (code {:?})",
                                self.camera_id,
                                task.label(),
                                exit_code
                            );
                        }
                    }
                    Err(err) => {
                        log::error!("[{}] {} process failed: {:#}", self.camera_id, task.label(), err)
                    }
                }
            }
            task.release();

            let exited_at = Instant::now();
            self.set_state(ProcessState::Exited);
            self.notify(LifecycleEvent::Exited {
                camera_id: self.camera_id.clone(),
                code,
                at: exited_at,
            });
            if self.stopped() {
                break;
            }

            let attempt_at = self.policy.next_attempt(exited_at);
            log::info!(
                "[{}] restarting {} in {:?}",
                self.camera_id,
                task.label(),
                self.policy.delay
            );
            self.notify(LifecycleEvent::Restarting {
                camera_id: self.camera_id.clone(),
                attempt_at,
            });
            if !self.sleep_until(attempt_at) {
                break;
            }
        }
        self.notify(LifecycleEvent::Stopped {
            camera_id: self.camera_id.clone(),
            at: Instant::now(),
        });
        log::info!("[{}] {} stopped", self.camera_id, task.label());
    }

    fn run_once<T: ProcessTask>(&self, task: &mut T, args: Vec<String>) -> Result<Option<i32>> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn '{}'", self.program))?;
        let pid = child.id();

        self.set_state(ProcessState::Running);
        self.notify(LifecycleEvent::Started {
            camera_id: self.camera_id.clone(),
            pid,
            at: Instant::now(),
        });
        log::info!("[{}] {} started (pid {})", self.camera_id, task.label(), pid);

        let reader = match child.stdout.take() {
            Some(stdout) => match task.attach(stdout) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    kill(&mut child);
                    return Err(err);
                }
            },
            None => None,
        };

        let status = loop {
            if self.stopped() {
                kill(&mut child);
                break child.wait().ok();
            }
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => std::thread::sleep(EXIT_POLL),
                Err(err) => {
                    kill(&mut child);
                    return Err(err).context("poll child status");
                }
            }
        };

        if let Some(reader) = reader {
            if reader.join().is_err() {
                log::error!("[{}] {} output reader panicked", self.camera_id, task.label());
            }
        }
        Ok(status.and_then(|s| s.code()))
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps until `deadline`. Returns false if stopped first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    fn set_state(&self, next: ProcessState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

fn kill(child: &mut Child) {
    // Already-exited children report an error here; nothing to do about it.
    let _ = child.kill();
    let _ = child.wait();
}
