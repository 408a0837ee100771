//! Per-camera stream supervision.
//!
//! One supervisor owns one background worker driving the
//! connect/decode/reconnect state machine for a single camera. The worker is
//! the sole owner of the session handle and the sole writer of the shared
//! [`StreamState`]; HTTP readers observe state through a `watch` receiver,
//! so a published frame is always either the previous or the new one in
//! full, and a slow reader never stalls the decode loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::errors::SessionErrorKind;
use crate::registry::CameraConfig;
use crate::resolver;
use crate::session::{Connector, Frame, FrameSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Shared snapshot of one camera's stream. Written only by the supervisor
/// worker; cloned freely by readers (the frame itself is behind an `Arc`).
#[derive(Clone)]
pub struct StreamState {
    pub state: SupervisorState,
    pub frame: Option<Arc<Frame>>,
    /// Monotonic per-supervisor frame counter; lets readers tell "new frame"
    /// from "same frame again" without comparing pixels.
    pub frame_seq: u64,
    pub last_frame_time: Option<Instant>,
    pub connected: bool,
    pub fps: f32,
    pub reconnect_count: u64,
    pub last_error: Option<SessionErrorKind>,
    pub active_url: Option<String>,
}

impl StreamState {
    fn initial() -> Self {
        Self {
            state: SupervisorState::Disconnected,
            frame: None,
            frame_seq: 0,
            last_frame_time: None,
            connected: false,
            fps: 0.0,
            reconnect_count: 0,
            last_error: None,
            active_url: None,
        }
    }
}

/// Status payload for the HTTP boundary.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: SupervisorState,
    pub connected: bool,
    pub fps: f32,
    pub reconnect_count: u64,
    pub last_error: Option<SessionErrorKind>,
    pub last_frame_age_ms: Option<u64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

pub struct Supervisor {
    camera: CameraConfig,
    settings: StreamConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<watch::Sender<StreamState>>,
    state_rx: watch::Receiver<StreamState>,
    stopping: Arc<AtomicBool>,
    reconnect_requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(camera: CameraConfig, settings: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let (tx, rx) = watch::channel(StreamState::initial());
        Self {
            camera,
            settings,
            connector,
            shared: Arc::new(tx),
            state_rx: rx,
            stopping: Arc::new(AtomicBool::new(false)),
            reconnect_requested: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Subscribe to the single-slot stream state.
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// Spawn the worker. No-op if it is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                debug!(camera = %self.camera.name, "supervisor already running");
                return;
            }
        }

        self.stopping.store(false, Ordering::SeqCst);
        self.reconnect_requested.store(false, Ordering::SeqCst);

        let ctx = WorkerCtx {
            camera: self.camera.clone(),
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            shared: self.shared.clone(),
            stopping: self.stopping.clone(),
            reconnect_requested: self.reconnect_requested.clone(),
            wake: self.wake.clone(),
        };
        info!(camera = %self.camera.name, "starting stream supervisor");
        *worker = Some(tokio::spawn(ctx.run()));
    }

    /// Stop the worker, interrupting a blocked open/read. Returns once the
    /// worker has exited or the grace period elapsed (the task is aborted
    /// then). The last frame stays readable, frozen.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            let grace = self.settings.connect_timeout * 2;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(camera = %self.camera.name, "worker did not stop within grace, aborting");
                handle.abort();
            }
        }

        self.shared.send_modify(|s| {
            s.state = SupervisorState::Stopped;
            s.connected = false;
        });
        info!(camera = %self.camera.name, "supervisor stopped");
    }

    /// Close the current session and re-enter Connecting immediately,
    /// bypassing any remaining backoff wait.
    pub fn force_reconnect(&self) {
        self.reconnect_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.state_rx.borrow();
        StreamStatus {
            state: state.state,
            connected: state.connected,
            fps: state.fps,
            reconnect_count: state.reconnect_count,
            last_error: state.last_error,
            last_frame_age_ms: state
                .last_frame_time
                .map(|t| t.elapsed().as_millis() as u64),
            frame_width: state.frame.as_ref().map(|f| f.width),
            frame_height: state.frame.as_ref().map(|f| f.height),
        }
    }
}

enum SweepOutcome {
    Connected(Box<dyn FrameSource>, String),
    Failed(SessionErrorKind),
    Interrupted,
}

enum StreamExit {
    Stop,
    Kick,
    Failure,
}

struct WorkerCtx {
    camera: CameraConfig,
    settings: StreamConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<watch::Sender<StreamState>>,
    stopping: Arc<AtomicBool>,
    reconnect_requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkerCtx {
    async fn run(self) {
        let candidates = resolver::resolve_candidates(&self.camera);
        let mut sticky: Option<String> = None;
        let mut window: VecDeque<Instant> = VecDeque::new();
        let mut seq = self.shared.borrow().frame_seq;
        let mut reconnect_count = self.shared.borrow().reconnect_count;

        loop {
            if self.stopping() {
                break;
            }

            self.set_state(SupervisorState::Connecting);
            match self.connect_sweep(&candidates, sticky.as_deref()).await {
                SweepOutcome::Connected(session, url) => {
                    info!(camera = %self.camera.name,
                          url = %resolver::redact(&url, &self.camera.password),
                          "connected");
                    sticky = Some(url.clone());
                    self.shared.send_modify(|s| {
                        s.active_url = Some(url);
                        s.state = SupervisorState::Streaming;
                    });

                    window.clear();
                    let exit = self.stream(session, &mut window, &mut seq).await;
                    match exit {
                        StreamExit::Stop => break,
                        StreamExit::Kick => {
                            info!(camera = %self.camera.name, "forced reconnect");
                            continue;
                        }
                        StreamExit::Failure => {}
                    }
                }
                SweepOutcome::Interrupted => break,
                SweepOutcome::Failed(kind) => {
                    self.shared.send_modify(|s| s.last_error = Some(kind));
                }
            }

            if self.stopping() {
                break;
            }

            reconnect_count += 1;
            self.shared.send_modify(|s| {
                s.state = SupervisorState::Reconnecting;
                s.connected = false;
                s.fps = 0.0;
                s.reconnect_count = reconnect_count;
            });

            let max = self.settings.max_reconnect_attempts as u64;
            if max > 0 && reconnect_count >= max {
                warn!(camera = %self.camera.name, attempts = reconnect_count,
                      "reconnect attempts exhausted, stopping");
                break;
            }

            debug!(camera = %self.camera.name,
                   delay = ?self.settings.reconnect_delay,
                   attempt = reconnect_count,
                   "reconnecting after delay");
            if !self.take_reconnect_request() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                    _ = self.wake.notified() => {
                        // The kick already did its job by cutting the wait
                        // short; a stale flag would tear down the next session
                        self.take_reconnect_request();
                    }
                }
            }
        }

        self.shared.send_modify(|s| {
            s.state = SupervisorState::Stopped;
            s.connected = false;
            s.fps = 0.0;
        });
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::SeqCst)
    }

    fn set_state(&self, state: SupervisorState) {
        self.shared.send_modify(|s| {
            s.state = state;
            if state != SupervisorState::Streaming {
                s.connected = false;
            }
        });
    }

    /// Try the sticky URL first, then the remaining candidates in resolver
    /// order. Keeps the most specific failure kind seen across the sweep.
    async fn connect_sweep(&self, candidates: &[String], sticky: Option<&str>) -> SweepOutcome {
        let ordered: Vec<&str> = match sticky {
            Some(s) => std::iter::once(s)
                .chain(candidates.iter().map(String::as_str).filter(|c| *c != s))
                .collect(),
            None => candidates.iter().map(String::as_str).collect(),
        };

        let mut best: Option<SessionErrorKind> = None;
        for (i, url) in ordered.iter().enumerate() {
            if self.stopping() {
                return SweepOutcome::Interrupted;
            }
            debug!(camera = %self.camera.name,
                   attempt = i + 1, total = ordered.len(),
                   url = %resolver::redact(url, &self.camera.password),
                   "trying candidate");

            let open = self.connector.open(url, self.settings.connect_timeout);
            tokio::select! {
                result = open => match result {
                    Ok(session) => return SweepOutcome::Connected(session, url.to_string()),
                    Err(e) => {
                        debug!(camera = %self.camera.name, error = %e, "candidate failed");
                        let kind = e.kind();
                        if best.map_or(true, |b| kind.specificity() > b.specificity()) {
                            best = Some(kind);
                        }
                    }
                },
                _ = self.wake.notified() => {
                    if self.stopping() {
                        return SweepOutcome::Interrupted;
                    }
                    // A forced reconnect during connecting just restarts the sweep
                    self.take_reconnect_request();
                }
            }
        }

        SweepOutcome::Failed(best.unwrap_or(SessionErrorKind::Unreachable))
    }

    /// The Streaming state: pull frames and publish them until the
    /// consecutive-failure budget is exceeded or we are told to stop.
    async fn stream(
        &self,
        mut session: Box<dyn FrameSource>,
        window: &mut VecDeque<Instant>,
        seq: &mut u64,
    ) -> StreamExit {
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.stopping() {
                session.close().await;
                return StreamExit::Stop;
            }
            if self.take_reconnect_request() {
                session.close().await;
                return StreamExit::Kick;
            }

            tokio::select! {
                result = session.read_frame(self.settings.read_timeout) => match result {
                    Ok(frame) => {
                        consecutive_failures = 0;
                        self.publish(frame, window, seq);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(camera = %self.camera.name, error = %e,
                              failures = consecutive_failures,
                              "frame read failed");
                        let kind = e.kind();
                        self.shared.send_modify(|s| s.last_error = Some(kind));
                        if consecutive_failures >= self.settings.disconnect_threshold {
                            session.close().await;
                            return StreamExit::Failure;
                        }
                    }
                },
                _ = self.wake.notified() => {
                    if self.stopping() {
                        session.close().await;
                        return StreamExit::Stop;
                    }
                    if self.take_reconnect_request() {
                        session.close().await;
                        return StreamExit::Kick;
                    }
                }
            }
        }
    }

    fn publish(&self, frame: Frame, window: &mut VecDeque<Instant>, seq: &mut u64) {
        let now = Instant::now();
        window.push_back(now);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(1) {
                window.pop_front();
            } else {
                break;
            }
        }
        let fps = window.len() as f32;

        *seq += 1;
        let seq = *seq;
        self.shared.send_modify(|s| {
            s.frame = Some(Arc::new(frame));
            s.frame_seq = seq;
            s.last_frame_time = Some(now);
            s.connected = true;
            s.fps = fps;
            s.state = SupervisorState::Streaming;
            s.last_error = None;
        });
    }
}
