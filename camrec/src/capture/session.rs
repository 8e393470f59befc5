//! One capture session per camera.
//!
//! The session owns its capture process: it launches it, forwards closed
//! segments to the store, restarts it with backoff after crashes and reports
//! a persistent fault once restarts stop helping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::{CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, StopOutcome};
use super::restart::{RestartDecision, RestartSettings, RestartTracker};
use crate::domain::{Camera, NewSegment, Segment, SessionState, Volume};
use crate::storage::{OrphanPolicy, SegmentStore, quarantine_file};
use crate::utils::filename::parse_segment_start;
use crate::utils::fs;
use crate::{Error, Result};

/// Name of the per-camera capture log inside the camera directory.
pub const CAPTURE_LOG_FILE: &str = "ffmpeg.log";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Time allowed between launch and the first opened segment.
    pub ready_timeout: Duration,
    /// Time allowed for a graceful stop before the process is killed.
    pub stop_grace: Duration,
    /// A running process that opens no new segment within
    /// `heartbeat_factor × segment_duration` is considered hung.
    pub heartbeat_factor: u32,
    pub restart: RestartSettings,
    /// Segment file extension, without the dot.
    pub extension: String,
    /// `Delete` deletes crash partials; anything else quarantines them.
    pub partial_policy: OrphanPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            heartbeat_factor: 2,
            restart: RestartSettings::default(),
            extension: "mkv".to_string(),
            partial_policy: OrphanPolicy::Quarantine,
        }
    }
}

/// Notifications from a session to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        camera_id: String,
        volume_id: String,
        state: SessionState,
    },
    SegmentRegistered {
        camera_id: String,
        segment: Segment,
    },
    /// Restarts were exhausted. Sent at most once per session.
    Faulted {
        camera_id: String,
        volume_id: String,
        crashes: usize,
        reason: String,
    },
}

/// How a session task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Stopped,
    Faulted,
}

enum RunOutcome {
    Stopped,
    Crashed(String),
}

struct OpenSegment {
    path: PathBuf,
    opened_at: DateTime<Utc>,
}

pub struct CaptureSession {
    camera: Camera,
    volume: Volume,
    launcher: Arc<dyn CaptureLauncher>,
    store: SegmentStore,
    settings: SessionSettings,
    events: mpsc::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
    tracker: RestartTracker,
}

impl CaptureSession {
    pub fn new(
        camera: Camera,
        volume: Volume,
        launcher: Arc<dyn CaptureLauncher>,
        store: SegmentStore,
        settings: SessionSettings,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        let tracker = RestartTracker::new(settings.restart);
        Self {
            camera,
            volume,
            launcher,
            store,
            settings,
            events,
            state,
            tracker,
        }
    }

    /// Spawn the session task.
    pub fn start(self) -> SessionHandle {
        let stop = CancellationToken::new();
        let state = self.state.subscribe();
        let camera_id = self.camera.id.clone();
        let volume_id = self.volume.id.clone();
        let task = tokio::spawn(self.run(stop.clone()));
        SessionHandle {
            camera_id,
            volume_id,
            state,
            stop,
            task,
        }
    }

    async fn run(mut self, stop: CancellationToken) -> SessionExit {
        info!(
            camera_id = %self.camera.id,
            volume = %self.volume.id,
            source = %self.camera.display_source(),
            "Capture session starting"
        );

        loop {
            self.set_state(SessionState::Starting).await;
            if stop.is_cancelled() {
                self.set_state(SessionState::Stopping).await;
                self.set_state(SessionState::Stopped).await;
                return SessionExit::Stopped;
            }

            let outcome = match self.launch().await {
                Ok(process) => self.supervise(process, &stop).await,
                Err(e) => RunOutcome::Crashed(format!("launch failed: {e}")),
            };
            let reason = match outcome {
                RunOutcome::Stopped => {
                    self.set_state(SessionState::Stopped).await;
                    info!(camera_id = %self.camera.id, "Capture session stopped");
                    return SessionExit::Stopped;
                }
                RunOutcome::Crashed(reason) => reason,
            };

            self.set_state(SessionState::Crashed).await;
            let crash = Error::ProcessCrash {
                camera_id: self.camera.id.clone(),
                reason: reason.clone(),
            };

            match self.tracker.record_crash(std::time::Instant::now()) {
                RestartDecision::Restart(delay) => {
                    warn!(
                        camera_id = %self.camera.id,
                        error = %crash,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting capture after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => {
                            self.set_state(SessionState::Stopped).await;
                            return SessionExit::Stopped;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RestartDecision::Fault { crashes } => {
                    error!(
                        camera_id = %self.camera.id,
                        error = %crash,
                        crashes,
                        "Capture keeps crashing, giving up"
                    );
                    self.emit(SessionEvent::Faulted {
                        camera_id: self.camera.id.clone(),
                        volume_id: self.volume.id.clone(),
                        crashes,
                        reason,
                    })
                    .await;
                    self.set_state(SessionState::Stopped).await;
                    return SessionExit::Faulted;
                }
            }
        }
    }

    async fn launch(&self) -> Result<Box<dyn CaptureProcess>> {
        let output_dir = self.volume.camera_dir(&self.camera.id);
        fs::ensure_dir_all(&output_dir).await?;
        let spec = CaptureSpec {
            camera_id: self.camera.id.clone(),
            source: self.camera.source.clone(),
            log_path: output_dir.join(CAPTURE_LOG_FILE),
            output_dir,
            extension: self.settings.extension.clone(),
            segment_duration: self.camera.segment_duration,
            segment_size_bytes: self.camera.segment_size_bytes,
        };
        self.launcher.launch(&spec).await
    }

    async fn supervise(
        &mut self,
        mut process: Box<dyn CaptureProcess>,
        stop: &CancellationToken,
    ) -> RunOutcome {
        let heartbeat = self.camera.segment_duration * self.settings.heartbeat_factor.max(1);
        let mut deadline = Instant::now() + self.settings.ready_timeout;
        let mut stable_at: Option<Instant> = None;
        let mut open: Option<OpenSegment> = None;
        let mut running = false;

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    self.set_state(SessionState::Stopping).await;
                    let outcome = process.stop(self.settings.stop_grace).await;
                    match outcome {
                        Ok(StopOutcome::Graceful) => self.finalize(open.take()).await,
                        Ok(StopOutcome::Forced) => {
                            warn!(camera_id = %self.camera.id, "Capture process killed after grace period");
                            self.discard(open.take()).await;
                        }
                        Err(e) => {
                            error!(camera_id = %self.camera.id, error = %e, "Failed to stop capture process");
                            self.discard(open.take()).await;
                        }
                    }
                    return RunOutcome::Stopped;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    let reason = if running {
                        format!("no new segment within {}ms", heartbeat.as_millis())
                    } else {
                        format!(
                            "no segment opened within {}ms of launch",
                            self.settings.ready_timeout.as_millis()
                        )
                    };
                    if let Err(e) = process.kill().await {
                        warn!(camera_id = %self.camera.id, error = %e, "Failed to kill hung capture process");
                    }
                    self.discard(open.take()).await;
                    return RunOutcome::Crashed(reason);
                }

                _ = sleep_until_some(stable_at), if stable_at.is_some() => {
                    debug!(camera_id = %self.camera.id, "Capture stable, resetting backoff");
                    self.tracker.clear_failures();
                    stable_at = None;
                }

                event = process.next_event() => match event {
                    Some(CaptureEvent::SegmentOpened(path)) => {
                        let previous = open.replace(OpenSegment {
                            path,
                            opened_at: Utc::now(),
                        });
                        self.finalize(previous).await;
                        if !running {
                            running = true;
                            stable_at = Some(Instant::now() + self.tracker.settings().stable_after);
                            self.set_state(SessionState::Running).await;
                        }
                        deadline = Instant::now() + heartbeat;
                    }
                    Some(CaptureEvent::Exited { success, code }) => {
                        if success {
                            self.finalize(open.take()).await;
                        } else {
                            self.discard(open.take()).await;
                        }
                        return RunOutcome::Crashed(match code {
                            Some(code) => format!("exited with status {code}"),
                            None => "terminated by signal".to_string(),
                        });
                    }
                    None => {
                        self.discard(open.take()).await;
                        return RunOutcome::Crashed("event stream ended".to_string());
                    }
                },
            }
        }
    }

    /// Register a segment the capture process has closed.
    async fn finalize(&self, segment: Option<OpenSegment>) {
        let Some(segment) = segment else {
            return;
        };
        let closed_at = Utc::now();
        let start = parse_segment_start(&segment.path).unwrap_or(segment.opened_at);
        let duration = (closed_at - start).to_std().unwrap_or(Duration::ZERO);
        let new = NewSegment::new(
            &self.camera.id,
            &self.volume.id,
            start,
            duration,
            segment.path.clone(),
        );

        match self.store.register_or_replace(new).await {
            Ok(registered) => {
                self.emit(SessionEvent::SegmentRegistered {
                    camera_id: self.camera.id.clone(),
                    segment: registered,
                })
                .await;
            }
            Err(Error::Validation(reason)) => {
                debug!(camera_id = %self.camera.id, %reason, "Dropping unusable segment");
                if let Err(e) = fs::remove_file_if_exists(&segment.path).await {
                    warn!(camera_id = %self.camera.id, error = %e, "Failed to delete unusable segment");
                }
            }
            Err(e) => {
                // The file stays on disk; the next reconcile picks it up.
                error!(
                    camera_id = %self.camera.id,
                    path = %segment.path.display(),
                    error = %e,
                    "Failed to register segment"
                );
            }
        }
    }

    /// Keep a crash partial out of the index.
    async fn discard(&self, segment: Option<OpenSegment>) {
        let Some(segment) = segment else {
            return;
        };
        if let Err(e) = self.discard_file(&segment.path).await {
            warn!(
                camera_id = %self.camera.id,
                path = %segment.path.display(),
                error = %e,
                "Failed to discard partial segment"
            );
        }
    }

    async fn discard_file(&self, path: &Path) -> Result<()> {
        if !fs::exists(path).await? {
            return Ok(());
        }
        if self.settings.partial_policy == OrphanPolicy::Delete || fs::file_len(path).await? == 0 {
            fs::remove_file_if_exists(path).await?;
            info!(camera_id = %self.camera.id, path = %path.display(), "Deleted partial segment");
        } else {
            quarantine_file(&self.volume, &self.camera.id, path).await?;
        }
        Ok(())
    }

    async fn set_state(&self, next: SessionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        match current.transition_to(next) {
            Ok(state) => {
                self.state.send_replace(state);
                debug!(camera_id = %self.camera.id, from = %current, to = %state, "Session state changed");
                self.emit(SessionEvent::StateChanged {
                    camera_id: self.camera.id.clone(),
                    volume_id: self.volume.id.clone(),
                    state,
                })
                .await;
            }
            Err(e) => error!(camera_id = %self.camera.id, error = %e, "Rejected session state change"),
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(camera_id = %self.camera.id, "Session event receiver dropped");
        }
    }
}

async fn sleep_until_some(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

/// Owner's handle to a running session.
pub struct SessionHandle {
    camera_id: String,
    volume_id: String,
    state: watch::Receiver<SessionState>,
    stop: CancellationToken,
    task: JoinHandle<SessionExit>,
}

impl SessionHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop gracefully (escalating after the grace period) and wait.
    pub async fn stop(self) -> SessionExit {
        self.stop.cancel();
        self.join().await
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) -> SessionExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(camera_id = %self.camera_id, error = %e, "Capture session task failed");
                SessionExit::Stopped
            }
        }
    }
}
