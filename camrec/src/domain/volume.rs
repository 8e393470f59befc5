//! Storage volumes and their health.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::RetentionPolicy;
use crate::utils::filename::sanitize_filename;

/// Name of the directory (under a volume root) that holds quarantined files.
pub const QUARANTINE_DIR: &str = ".quarantine";

/// Operator flag: stop all recording on this volume while present.
pub const STOP_FLAG: &str = "stop.flag";

/// Operator flag: restart every session on this volume, then delete the flag.
pub const RESTART_FLAG: &str = "restart.flag";

/// Operator flag: move the directory it names into this volume's root.
pub const MOVE_FLAG: &str = "mv.flag";

/// Operator flag: delete the directory it names.
pub const REMOVE_FLAG: &str = "rm.flag";

/// Health of a storage volume.
///
/// Variants are declared from best to worst so that `Ord` ranks severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VolumeHealth {
    /// All devices and arrays behind the volume report healthy.
    Healthy,
    /// Health could not be determined (query failed, timed out or is stale).
    #[default]
    Unknown,
    /// The volume still works but redundancy or a device is compromised.
    Degraded,
    /// The volume or one of its devices has failed.
    Failed,
}

impl VolumeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unknown => "unknown",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }

    /// Combine two health readings, keeping the worse one.
    pub fn worst(self, other: VolumeHealth) -> VolumeHealth {
        self.max(other)
    }

    /// Whether new segments may be written. `Unknown` is treated like `Degraded`.
    pub fn allows_writes(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for VolumeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A storage mount point that receives recordings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    /// Recording root. Each camera records into a sub-directory of it.
    pub root: PathBuf,
    /// Block device queried for SMART health (e.g. `/dev/sda`).
    pub device: Option<String>,
    /// Software RAID array backing the volume (e.g. `md0`).
    pub array: Option<String>,
    /// Bytes kept free on top of the retention target.
    pub reserved_headroom_bytes: u64,
    /// Volume used when this one is unhealthy or full.
    pub standby: Option<String>,
    pub retention: RetentionPolicy,
}

impl Volume {
    /// Directory a camera writes its segments into.
    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.root.join(sanitize_filename(camera_id))
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    pub fn stop_flag(&self) -> PathBuf {
        self.root.join(STOP_FLAG)
    }

    pub fn restart_flag(&self) -> PathBuf {
        self.root.join(RESTART_FLAG)
    }

    pub fn move_flag(&self) -> PathBuf {
        self.root.join(MOVE_FLAG)
    }

    pub fn remove_flag(&self) -> PathBuf {
        self.root.join(REMOVE_FLAG)
    }

    /// Whether `path` lives under this volume's recording root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}
