//! Operator alerts raised by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::Error;
use crate::domain::VolumeHealth;

/// Conditions that need an operator's attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    HealthDegraded {
        volume_id: String,
        health: VolumeHealth,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    HealthUnknown {
        volume_id: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    CapacityExhausted {
        volume_id: String,
        free_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// Reclaim could not reach its target; the rest is locked or too young.
    RetentionExhausted {
        volume_id: String,
        shortfall_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// Restarts were exhausted. The camera stays down until restarted.
    CameraFaulted {
        camera_id: String,
        volume_id: String,
        crashes: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Recording stopped with nowhere to go.
    Paused {
        camera_id: String,
        volume_id: String,
        timestamp: DateTime<Utc>,
    },
    Rerouted {
        camera_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    Resumed {
        camera_id: String,
        volume_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        match self {
            Alert::HealthDegraded { .. } => "health_degraded",
            Alert::HealthUnknown { .. } => "health_unknown",
            Alert::CapacityExhausted { .. } => "capacity_exhausted",
            Alert::RetentionExhausted { .. } => "retention_exhausted",
            Alert::CameraFaulted { .. } => "camera_faulted",
            Alert::Paused { .. } => "paused",
            Alert::Rerouted { .. } => "rerouted",
            Alert::Resumed { .. } => "resumed",
        }
    }

    /// The error this alert stands for, if it reports one.
    pub fn as_error(&self) -> Option<Error> {
        match self {
            Alert::HealthDegraded {
                volume_id, detail, ..
            } => Some(Error::HealthDegraded {
                volume: volume_id.clone(),
                detail: detail.clone(),
            }),
            Alert::HealthUnknown {
                volume_id, detail, ..
            } => Some(Error::HealthUnknown {
                volume: volume_id.clone(),
                detail: detail.clone(),
            }),
            Alert::CapacityExhausted {
                volume_id,
                free_bytes,
                ..
            } => Some(Error::CapacityExhausted {
                volume: volume_id.clone(),
                free_bytes: *free_bytes,
            }),
            Alert::CameraFaulted {
                camera_id, reason, ..
            } => Some(Error::ProcessCrash {
                camera_id: camera_id.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    fn log(&self) {
        match self {
            Alert::CameraFaulted { crashes, .. } => {
                if let Some(e) = self.as_error() {
                    error!(alert = self.kind(), crashes, error = %e, "Camera faulted");
                }
            }
            Alert::RetentionExhausted {
                volume_id,
                shortfall_bytes,
                ..
            } => {
                warn!(alert = self.kind(), volume = %volume_id, shortfall_bytes, "Retention exhausted");
            }
            Alert::Paused {
                camera_id,
                volume_id,
                ..
            } => {
                warn!(alert = self.kind(), camera_id = %camera_id, volume = %volume_id, "Recording paused");
            }
            Alert::Rerouted {
                camera_id, from, to, ..
            } => {
                warn!(alert = self.kind(), camera_id = %camera_id, from = %from, to = %to, "Camera rerouted");
            }
            Alert::Resumed {
                camera_id,
                volume_id,
                ..
            } => {
                info!(alert = self.kind(), camera_id = %camera_id, volume = %volume_id, "Recording resumed");
            }
            _ => {
                if let Some(e) = self.as_error() {
                    warn!(alert = self.kind(), error = %e, "Volume alert");
                }
            }
        }
    }
}

/// Fan-out of [`Alert`]s. Every published alert is also logged.
#[derive(Clone)]
pub struct AlertBroadcaster {
    sender: broadcast::Sender<Alert>,
}

impl AlertBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Log and send. Having no subscribers is fine.
    pub fn publish(&self, alert: Alert) {
        alert.log();
        let _ = self.sender.send(alert);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AlertBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
