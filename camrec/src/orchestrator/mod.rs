//! Recording orchestrator.
//!
//! The single writer of camera → session bindings. On every tick it reads
//! the monitor's snapshots, runs retention for each volume, and moves
//! cameras between their primary volume, its standby and "paused". It never
//! deletes segments or talks to capture processes itself; retention and the
//! sessions do that.
//!
//! Operator control files in each volume root:
//! - `stop.flag`: no recording on the volume while present.
//! - `restart.flag`: restart every session on the volume (clearing camera
//!   faults and any stop flag), then the flag is deleted.
//! - `mv.flag` / `rm.flag`: move or delete an old recording directory with
//!   the volume's sessions stopped. See [`relocate`].

pub mod alert;
pub mod placement;
pub mod relocate;
pub mod startup;

pub use alert::{Alert, AlertBroadcaster};
pub use placement::{VolumeState, capacity_deficit, choose_volume};
pub use startup::{PreparedVolumes, prepare_volumes};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::capture::{CaptureLauncher, CaptureSession, SessionEvent, SessionHandle, SessionSettings};
use crate::domain::{Camera, SessionState, Volume, VolumeHealth};
use crate::retention::{ReclaimStatus, RetentionManager};
use crate::storage::{OrphanPolicy, ReconcileOptions, ReconcileReport, SegmentStore};
use crate::utils::fs;
use crate::volume::{VolumeMonitor, VolumeSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tick_interval: Duration,
    /// Move cameras back to their primary volume once it recovers.
    pub failback: bool,
    pub session: SessionSettings,
    pub reconcile: ReconcileOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            failback: true,
            session: SessionSettings::default(),
            reconcile: ReconcileOptions::default(),
        }
    }
}

/// Where a camera is recording right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub primary_volume: String,
    /// Volume of the current session, `None` while paused or faulted.
    pub volume_id: Option<String>,
    pub state: Option<SessionState>,
    pub faulted: bool,
}

struct Binding {
    camera: Camera,
    /// Standby of the camera's primary volume.
    standby: Option<String>,
    volume_id: Option<String>,
    handle: Option<SessionHandle>,
    faulted: bool,
    paused: bool,
}

pub struct RecordingOrchestrator {
    volumes: Vec<Volume>,
    states: HashMap<String, VolumeState>,
    /// Bytes deleted per volume since the monitor's last measurement.
    freed_since_poll: HashMap<String, (Option<DateTime<Utc>>, u64)>,
    bindings: BTreeMap<String, Binding>,
    monitor: Arc<VolumeMonitor>,
    store: SegmentStore,
    retention: RetentionManager,
    launcher: Arc<dyn CaptureLauncher>,
    settings: OrchestratorSettings,
    alerts: AlertBroadcaster,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl RecordingOrchestrator {
    pub fn new(
        cameras: Vec<Camera>,
        prepared: PreparedVolumes,
        monitor: Arc<VolumeMonitor>,
        store: SegmentStore,
        launcher: Arc<dyn CaptureLauncher>,
        settings: OrchestratorSettings,
    ) -> Self {
        let PreparedVolumes {
            volumes,
            unwritable,
        } = prepared;

        let states = volumes
            .iter()
            .map(|v| {
                let state = VolumeState {
                    writable: !unwritable.contains(&v.id),
                    ..VolumeState::default()
                };
                (v.id.clone(), state)
            })
            .collect();

        let bindings = cameras
            .into_iter()
            .map(|camera| {
                let standby = volumes
                    .iter()
                    .find(|v| v.id == camera.volume)
                    .and_then(|v| v.standby.clone());
                let binding = Binding {
                    camera,
                    standby,
                    volume_id: None,
                    handle: None,
                    faulted: false,
                    paused: false,
                };
                (binding.camera.id.clone(), binding)
            })
            .collect();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            volumes,
            states,
            freed_since_poll: HashMap::new(),
            bindings,
            monitor,
            retention: RetentionManager::new(store.clone()),
            store,
            launcher,
            settings,
            alerts: AlertBroadcaster::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn alerts(&self) -> &AlertBroadcaster {
        &self.alerts
    }

    pub fn camera_status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.bindings.get(camera_id).map(status_of)
    }

    pub fn statuses(&self) -> Vec<CameraStatus> {
        self.bindings.values().map(status_of).collect()
    }

    pub fn volume_state(&self, volume_id: &str) -> Option<VolumeState> {
        self.states.get(volume_id).cloned()
    }

    /// Cold start: reconcile, take a first measurement, then bind cameras.
    pub async fn start(&mut self) -> Result<ReconcileReport> {
        let writable: Vec<Volume> = self
            .volumes
            .iter()
            .filter(|v| self.states.get(&v.id).is_some_and(|s| s.writable))
            .cloned()
            .collect();

        let report = self
            .store
            .reconcile(&writable, &self.settings.reconcile)
            .await?;

        self.monitor.poll_once().await;
        self.tick().await;
        info!(cameras = self.bindings.len(), "Orchestrator started");
        Ok(report)
    }

    pub async fn tick(&mut self) {
        self.tick_at(Utc::now()).await;
    }

    /// One control pass with `now` as the reference time.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) {
        self.process_pending_events();

        for volume in self.volumes.clone() {
            if self.states.get(&volume.id).is_some_and(|s| s.writable) {
                self.relocate(&volume).await;
            }
        }

        let mut restart_requested = Vec::new();
        for volume in self.volumes.clone() {
            if self.refresh_volume(&volume, now).await {
                restart_requested.push(volume.id);
            }
        }

        self.halt_exhausted_volumes().await;
        for volume_id in restart_requested {
            self.restart_volume(&volume_id).await;
        }
        self.place_cameras().await;
    }

    /// Update a volume's state. Returns whether `restart.flag` is present.
    async fn refresh_volume(&mut self, volume: &Volume, now: DateTime<Utc>) -> bool {
        let mut state = self.states.get(&volume.id).cloned().unwrap_or_default();

        if !state.writable {
            match startup::probe(&volume.root).await {
                Ok(()) => state.writable = self.reconcile_recovered(volume).await,
                Err(e) => debug!(volume = %volume.id, error = %e, "Volume still not writable"),
            }
        }

        let halted = fs::exists(&volume.stop_flag()).await.unwrap_or(false);
        if halted != state.halted {
            if halted {
                warn!(volume = %volume.id, "Stop flag present, recording halted");
            } else {
                info!(volume = %volume.id, "Stop flag removed");
            }
            state.halted = halted;
        }
        let restart = fs::exists(&volume.restart_flag()).await.unwrap_or(false);

        let snapshot = self.monitor.snapshot(&volume.id);
        let stale_after = self.monitor.settings().stale_after();
        let (health, detail) = match &snapshot {
            Some(s) => {
                let health = s.effective_health(now, stale_after);
                let detail = if health != s.health {
                    format!("no measurement within {}s", stale_after.as_secs())
                } else {
                    s.health_detail
                        .clone()
                        .or_else(|| s.last_error.clone())
                        .unwrap_or_default()
                };
                (health, detail)
            }
            None => (VolumeHealth::Unknown, "volume is not monitored".to_string()),
        };
        state.health = health;
        self.alert_health(volume, &mut state, detail, now);

        if state.writable
            && health != VolumeHealth::Failed
            && let Some(snapshot) = snapshot
        {
            self.enforce_retention(volume, &snapshot, &mut state, now)
                .await;
        }

        self.states.insert(volume.id.clone(), state);
        restart
    }

    /// Reconcile a volume that became writable after startup. Returns
    /// whether it may take recordings.
    async fn reconcile_recovered(&self, volume: &Volume) -> bool {
        let volumes = std::slice::from_ref(volume);
        match self.store.reconcile(volumes, &self.settings.reconcile).await {
            Ok(report) if report.failed_volumes.is_empty() => {
                info!(volume = %volume.id, "Volume is writable again");
                true
            }
            Ok(_) => {
                warn!(volume = %volume.id, "Volume is writable but could not be reconciled");
                false
            }
            Err(e) => {
                warn!(volume = %volume.id, error = %e, "Volume is writable but could not be reconciled");
                false
            }
        }
    }

    /// Handle `mv.flag` and `rm.flag` with the volume's sessions stopped,
    /// then bring the index in line with the new directory contents.
    async fn relocate(&mut self, volume: &Volume) {
        let relocations = relocate::pending(volume).await;
        if relocations.is_empty() {
            return;
        }

        let handles = self.take_sessions_on(&volume.id);
        info!(volume = %volume.id, sessions = handles.len(), "Stopping sessions for relocation");
        self.stop_sessions(handles).await;

        let mut options = self.settings.reconcile.clone();
        for relocation in &relocations {
            // Moved files are recordings, even when the move stopped part way.
            if matches!(relocation, relocate::Relocation::Move(_)) {
                options.orphan_policy = OrphanPolicy::Import;
            }
            let _ = relocate::execute(volume, relocation).await;
        }

        if let Err(e) = self
            .store
            .reconcile(std::slice::from_ref(volume), &options)
            .await
        {
            error!(volume = %volume.id, error = %e, "Cannot reconcile relocated volume");
        }
    }

    fn take_sessions_on(&mut self, volume_id: &str) -> Vec<SessionHandle> {
        self.bindings
            .values_mut()
            .filter(|b| b.volume_id.as_deref() == Some(volume_id))
            .filter_map(|b| b.handle.take())
            .collect()
    }

    /// Stop sessions while still draining their events, which they may
    /// block on while shutting down.
    async fn stop_sessions(&mut self, handles: Vec<SessionHandle>) {
        let stopping = join_all(handles.into_iter().map(SessionHandle::stop));
        tokio::pin!(stopping);
        loop {
            tokio::select! {
                _ = &mut stopping => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.process_pending_events();
    }

    fn alert_health(
        &self,
        volume: &Volume,
        state: &mut VolumeState,
        detail: String,
        now: DateTime<Utc>,
    ) {
        if state.health.allows_writes() {
            if state.alerted_health.take().is_some() {
                info!(volume = %volume.id, "Volume healthy again");
            }
            return;
        }
        if state.alerted_health == Some(state.health) {
            return;
        }
        state.alerted_health = Some(state.health);

        let alert = match state.health {
            VolumeHealth::Unknown => Alert::HealthUnknown {
                volume_id: volume.id.clone(),
                detail,
                timestamp: now,
            },
            health => Alert::HealthDegraded {
                volume_id: volume.id.clone(),
                health,
                detail,
                timestamp: now,
            },
        };
        self.alerts.publish(alert);
    }

    async fn enforce_retention(
        &mut self,
        volume: &Volume,
        snapshot: &VolumeSnapshot,
        state: &mut VolumeState,
        now: DateTime<Utc>,
    ) {
        let freed = self
            .freed_since_poll
            .entry(volume.id.clone())
            .or_insert((snapshot.measured_at, 0));
        if freed.0 != snapshot.measured_at {
            *freed = (snapshot.measured_at, 0);
        }

        match self.retention.sweep_expired_at(volume, now).await {
            Ok(report) => freed.1 += report.bytes_freed,
            Err(e) => warn!(volume = %volume.id, error = %e, "Expiry sweep failed"),
        }

        // The snapshot predates our own deletions.
        let mut adjusted = snapshot.clone();
        adjusted.free_bytes = adjusted.free_bytes.saturating_add(freed.1);

        let tracked = match self.store.tracked_bytes(&volume.id).await {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!(volume = %volume.id, error = %e, "Cannot read tracked bytes");
                return;
            }
        };

        let deficit = capacity_deficit(volume, &adjusted, tracked);
        state.under_pressure = deficit > 0;
        if deficit == 0 {
            if state.exhausted {
                info!(volume = %volume.id, "Volume has room again");
            }
            state.exhausted = false;
            return;
        }

        let report = match self.retention.reclaim_at(volume, deficit, now).await {
            Ok(report) => report,
            Err(e) => {
                warn!(volume = %volume.id, bytes = deficit, error = %e, "Reclaim failed");
                return;
            }
        };
        freed.1 += report.bytes_freed;

        match report.status {
            ReclaimStatus::Satisfied => {
                if state.exhausted {
                    info!(volume = %volume.id, "Volume has room again");
                }
                state.exhausted = false;
            }
            ReclaimStatus::RetentionExhausted { shortfall_bytes } => {
                if !state.exhausted {
                    self.alerts.publish(Alert::RetentionExhausted {
                        volume_id: volume.id.clone(),
                        shortfall_bytes,
                        timestamp: now,
                    });
                    self.alerts.publish(Alert::CapacityExhausted {
                        volume_id: volume.id.clone(),
                        free_bytes: adjusted.free_bytes.saturating_add(report.bytes_freed),
                        timestamp: now,
                    });
                }
                state.exhausted = true;
            }
        }
    }

    /// Persist a halt on exhausted volumes whose standby cannot take over.
    async fn halt_exhausted_volumes(&mut self) {
        let to_halt: Vec<Volume> = self
            .volumes
            .iter()
            .filter(|v| {
                let Some(state) = self.states.get(&v.id) else {
                    return false;
                };
                let standby_usable = v
                    .standby
                    .as_ref()
                    .and_then(|s| self.states.get(s))
                    .is_some_and(VolumeState::usable);
                state.exhausted && !state.halted && !standby_usable
            })
            .cloned()
            .collect();

        for volume in to_halt {
            let path = volume.stop_flag();
            let content = format!("retention exhausted at {}\n", Utc::now().to_rfc3339());
            match tokio::fs::write(&path, content).await {
                Ok(()) => {
                    warn!(volume = %volume.id, path = %path.display(), "Created stop flag");
                    if let Some(state) = self.states.get_mut(&volume.id) {
                        state.halted = true;
                    }
                }
                Err(e) => {
                    let e = fs::io_error("creating stop flag", &path, e);
                    error!(volume = %volume.id, error = %e, "Cannot persist recording halt");
                }
            }
        }
    }

    /// Handle `restart.flag`: restart sessions on the volume, clear faults
    /// and lift an operator or retention halt.
    async fn restart_volume(&mut self, volume_id: &str) {
        let mut handles = Vec::new();
        for binding in self.bindings.values_mut() {
            let current = binding.volume_id.as_deref() == Some(volume_id);
            if !current && binding.camera.volume != volume_id {
                continue;
            }
            if binding.faulted {
                info!(camera_id = %binding.camera.id, "Clearing camera fault");
                binding.faulted = false;
            }
            if current && let Some(handle) = binding.handle.take() {
                handles.push(handle);
            }
        }

        let restarted = handles.len();
        self.stop_sessions(handles).await;

        if let Some(volume) = self.volumes.iter().find(|v| v.id == volume_id) {
            match fs::remove_file_if_exists(&volume.stop_flag()).await {
                Ok(removed) => {
                    if removed {
                        info!(volume = %volume_id, "Stop flag cleared by restart");
                    }
                    if let Some(state) = self.states.get_mut(volume_id) {
                        state.halted = false;
                    }
                }
                Err(e) => warn!(volume = %volume_id, error = %e, "Cannot remove stop flag"),
            }
            if let Err(e) = fs::remove_file_if_exists(&volume.restart_flag()).await {
                warn!(volume = %volume_id, error = %e, "Cannot remove restart flag");
            }
        }
        info!(volume = %volume_id, sessions = restarted, "Restart requested by operator");
    }

    /// Start, stop or move sessions to match the current volume states.
    async fn place_cameras(&mut self) {
        // A session reports its fault before its task finishes.
        let finished: HashSet<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.handle.as_ref().is_some_and(SessionHandle::is_finished))
            .map(|(id, _)| id.clone())
            .collect();
        if !finished.is_empty() {
            self.process_pending_events();
        }

        let mut decisions = Vec::new();
        for (camera_id, binding) in &self.bindings {
            if binding.faulted {
                continue;
            }
            let target = choose_volume(
                &binding.camera,
                binding.standby.as_deref(),
                binding.volume_id.as_deref(),
                &self.states,
                self.settings.failback,
            );
            let recording = binding.handle.is_some() && !finished.contains(camera_id);
            if recording && binding.volume_id == target {
                continue;
            }
            if !recording && target.is_none() && binding.paused {
                continue;
            }
            decisions.push((camera_id.clone(), target));
        }
        if decisions.is_empty() {
            return;
        }

        let stopping: Vec<SessionHandle> = decisions
            .iter()
            .filter_map(|(id, _)| self.bindings.get_mut(id).and_then(|b| b.handle.take()))
            .collect();
        self.stop_sessions(stopping).await;

        let now = Utc::now();
        for (camera_id, target) in decisions {
            let Some(binding) = self.bindings.get_mut(&camera_id) else {
                continue;
            };
            if binding.faulted {
                continue;
            }
            let previous = binding.volume_id.take();
            let primary = binding.camera.volume.clone();

            let Some(to) = target else {
                binding.paused = true;
                self.alerts.publish(Alert::Paused {
                    camera_id,
                    volume_id: previous.unwrap_or(primary),
                    timestamp: now,
                });
                continue;
            };

            let Some(volume) = self.volumes.iter().find(|v| v.id == to) else {
                error!(camera_id = %camera_id, volume = %to, "Unknown target volume");
                continue;
            };

            let handle = CaptureSession::new(
                binding.camera.clone(),
                volume.clone(),
                self.launcher.clone(),
                self.store.clone(),
                self.settings.session.clone(),
                self.events_tx.clone(),
            )
            .start();
            info!(camera_id = %camera_id, volume = %to, "Capture session started");

            let moved_from = match previous {
                Some(prev) if prev != to => Some(prev),
                Some(_) => None,
                None if binding.paused || to != primary => Some(primary.clone()),
                None => None,
            };
            if let Some(from) = moved_from {
                let alert = if to == primary {
                    Alert::Resumed {
                        camera_id: camera_id.clone(),
                        volume_id: to.clone(),
                        timestamp: now,
                    }
                } else {
                    Alert::Rerouted {
                        camera_id: camera_id.clone(),
                        from,
                        to: to.clone(),
                        timestamp: now,
                    }
                };
                self.alerts.publish(alert);
            }

            binding.volume_id = Some(to);
            binding.handle = Some(handle);
            binding.paused = false;
        }
    }

    fn process_pending_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged {
                camera_id,
                volume_id,
                state,
            } => {
                debug!(camera_id = %camera_id, volume = %volume_id, state = %state, "Session state changed");
            }
            SessionEvent::SegmentRegistered { camera_id, segment } => {
                debug!(
                    camera_id = %camera_id,
                    segment_id = segment.id,
                    bytes = segment.size_bytes,
                    path = %segment.path.display(),
                    "Segment registered"
                );
            }
            SessionEvent::Faulted {
                camera_id,
                volume_id,
                crashes,
                reason,
            } => {
                let Some(binding) = self.bindings.get_mut(&camera_id) else {
                    return;
                };
                if binding.volume_id.as_deref() != Some(volume_id.as_str()) {
                    debug!(camera_id = %camera_id, volume = %volume_id, "Ignoring fault of a replaced session");
                    return;
                }
                binding.faulted = true;
                binding.handle = None;
                binding.volume_id = None;
                self.alerts.publish(Alert::CameraFaulted {
                    camera_id,
                    volume_id,
                    crashes,
                    reason,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Stop every session, each gracefully first, all at once.
    pub async fn shutdown(&mut self) {
        let handles: Vec<SessionHandle> = self
            .bindings
            .values_mut()
            .filter_map(|b| b.handle.take())
            .collect();
        info!(sessions = handles.len(), "Stopping capture sessions");
        self.stop_sessions(handles).await;
        info!("All capture sessions stopped");
    }

    /// Start, then tick until cancelled, then shut down.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut polls = self.monitor.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Ok(()) = polls.changed() => self.tick().await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }
}

fn status_of(binding: &Binding) -> CameraStatus {
    CameraStatus {
        camera_id: binding.camera.id.clone(),
        primary_volume: binding.camera.volume.clone(),
        volume_id: binding.volume_id.clone(),
        state: binding.handle.as_ref().map(SessionHandle::state),
        faulted: binding.faulted,
    }
}
