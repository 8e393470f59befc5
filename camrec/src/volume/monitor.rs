//! Periodic volume polling and point-in-time snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capacity::{Capacity, CapacityProbe};
use super::health::{HealthCheck, HealthReport};
use crate::domain::{Volume, VolumeHealth};

/// Polling behaviour of the [`VolumeMonitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Upper bound on each capacity or health query.
    pub query_timeout: Duration,
    /// Snapshots older than `stale_factor × poll_interval` count as unknown.
    pub stale_factor: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
            stale_factor: 2.0,
        }
    }
}

impl MonitorSettings {
    pub fn stale_after(&self) -> Duration {
        self.poll_interval.mul_f64(self.stale_factor.max(1.0))
    }
}

/// Last known capacity and health of one volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub volume_id: String,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub health: VolumeHealth,
    pub health_detail: Option<String>,
    /// When capacity was last measured successfully. `None` until then.
    pub measured_at: Option<DateTime<Utc>>,
    /// Error of the most recent poll, if it failed.
    pub last_error: Option<String>,
}

impl VolumeSnapshot {
    fn empty(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            free_bytes: 0,
            total_bytes: 0,
            health: VolumeHealth::Unknown,
            health_detail: Some("not polled yet".to_string()),
            measured_at: None,
            last_error: None,
        }
    }

    /// Time since the last successful measurement.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.measured_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Health after applying the staleness policy.
    pub fn effective_health(&self, now: DateTime<Utc>, stale_after: Duration) -> VolumeHealth {
        match self.age(now) {
            Some(age) if age <= stale_after => self.health,
            _ => VolumeHealth::Unknown,
        }
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            free_bytes: self.free_bytes,
            total_bytes: self.total_bytes,
        }
    }
}

/// Polls capacity and health of every configured volume.
///
/// Readers never wait on a poll: [`snapshot`](Self::snapshot) returns the
/// cached value, which carries its own age.
pub struct VolumeMonitor {
    volumes: Vec<Volume>,
    capacity: Arc<dyn CapacityProbe>,
    health: Arc<dyn HealthCheck>,
    settings: MonitorSettings,
    snapshots: RwLock<HashMap<String, VolumeSnapshot>>,
    generation: watch::Sender<u64>,
}

impl VolumeMonitor {
    pub fn new(
        volumes: Vec<Volume>,
        capacity: Arc<dyn CapacityProbe>,
        health: Arc<dyn HealthCheck>,
        settings: MonitorSettings,
    ) -> Self {
        let snapshots = volumes
            .iter()
            .map(|v| (v.id.clone(), VolumeSnapshot::empty(&v.id)))
            .collect();
        let (generation, _) = watch::channel(0);
        Self {
            volumes,
            capacity,
            health,
            settings,
            snapshots: RwLock::new(snapshots),
            generation,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn snapshot(&self, volume_id: &str) -> Option<VolumeSnapshot> {
        self.snapshots.read().get(volume_id).cloned()
    }

    pub fn snapshots(&self) -> HashMap<String, VolumeSnapshot> {
        self.snapshots.read().clone()
    }

    /// Bumped after every completed poll round.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Poll every volume once, concurrently.
    pub async fn poll_once(&self) {
        let polls = self.volumes.iter().map(|volume| self.poll_volume(volume));
        let results = futures::future::join_all(polls).await;

        {
            let mut snapshots = self.snapshots.write();
            for snapshot in results {
                if let Some(previous) = snapshots.get(&snapshot.volume_id)
                    && previous.health != snapshot.health
                {
                    log_health_change(previous, &snapshot);
                }
                snapshots.insert(snapshot.volume_id.clone(), snapshot);
            }
        }
        self.generation.send_modify(|g| *g += 1);
    }

    async fn poll_volume(&self, volume: &Volume) -> VolumeSnapshot {
        let timeout = self.settings.query_timeout;
        let (capacity, health) = tokio::join!(
            tokio::time::timeout(timeout, self.capacity.capacity(&volume.root)),
            tokio::time::timeout(timeout, self.health.check(volume)),
        );

        let mut snapshot = self
            .snapshot(&volume.id)
            .unwrap_or_else(|| VolumeSnapshot::empty(&volume.id));
        let mut errors = Vec::new();

        let report = match health {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                errors.push(format!("health: {e}"));
                HealthReport::new(VolumeHealth::Unknown, e.to_string())
            }
            Err(_) => {
                errors.push("health: query timed out".to_string());
                HealthReport::new(VolumeHealth::Unknown, "health query timed out")
            }
        };
        snapshot.health = report.health;
        snapshot.health_detail = report.detail;

        match capacity {
            Ok(Ok(capacity)) => {
                snapshot.free_bytes = capacity.free_bytes;
                snapshot.total_bytes = capacity.total_bytes;
                snapshot.measured_at = Some(Utc::now());
            }
            Ok(Err(e)) => errors.push(format!("capacity: {e}")),
            Err(_) => errors.push("capacity: query timed out".to_string()),
        }

        snapshot.last_error = if errors.is_empty() {
            None
        } else {
            let message = errors.join("; ");
            warn!(volume = %volume.id, error = %message, "Volume poll failed");
            Some(message)
        };

        debug!(
            volume = %volume.id,
            free_bytes = snapshot.free_bytes,
            total_bytes = snapshot.total_bytes,
            health = %snapshot.health,
            "Volume polled"
        );
        snapshot
    }

    /// Poll on a fixed interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            volumes = self.volumes.len(),
            interval_secs = self.settings.poll_interval.as_secs(),
            "Volume monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.poll_once().await,
            }
        }
        info!("Volume monitor stopped");
    }
}

fn log_health_change(previous: &VolumeSnapshot, current: &VolumeSnapshot) {
    let detail = current.health_detail.as_deref().unwrap_or("");
    if current.health.allows_writes() {
        info!(
            volume = %current.volume_id,
            from = %previous.health,
            to = %current.health,
            "Volume health changed"
        );
    } else {
        warn!(
            volume = %current.volume_id,
            from = %previous.health,
            to = %current.health,
            detail,
            "Volume health changed"
        );
    }
}
