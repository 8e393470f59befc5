//! Volume placement rules.
//!
//! Pure decisions over the per-volume state the orchestrator derives each
//! tick: where a camera should record and how many bytes a volume must free.

use std::collections::HashMap;

use crate::domain::{Camera, Volume, VolumeHealth};
use crate::volume::VolumeSnapshot;

/// What the orchestrator knows about a volume after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeState {
    /// Health after the staleness policy.
    pub health: VolumeHealth,
    /// Last health that raised an alert, so each change alerts once.
    pub alerted_health: Option<VolumeHealth>,
    /// The last reclaim could not reach its target.
    pub exhausted: bool,
    /// The last tick found a capacity deficit.
    pub under_pressure: bool,
    /// `stop.flag` is present.
    pub halted: bool,
    /// The root passed its write probe.
    pub writable: bool,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            health: VolumeHealth::Unknown,
            alerted_health: None,
            exhausted: false,
            under_pressure: false,
            halted: false,
            writable: true,
        }
    }
}

impl VolumeState {
    /// Whether new segments may be written here.
    pub fn usable(&self) -> bool {
        self.writable && !self.halted && !self.exhausted && self.health.allows_writes()
    }

    /// Usable and not short of space.
    pub fn comfortable(&self) -> bool {
        self.usable() && !self.under_pressure
    }
}

/// Bytes a volume should free now.
///
/// The larger of the shortfall against `min_free_bytes + headroom` and the
/// amount by which tracked segments exceed `total - headroom`. Zero until
/// capacity has been measured.
pub fn capacity_deficit(volume: &Volume, snapshot: &VolumeSnapshot, tracked_bytes: u64) -> u64 {
    if snapshot.measured_at.is_none() {
        return 0;
    }
    let headroom = volume.reserved_headroom_bytes;
    let free_target = volume.retention.min_free_bytes.saturating_add(headroom);
    let by_free = free_target.saturating_sub(snapshot.free_bytes);
    let budget = snapshot.total_bytes.saturating_sub(headroom);
    let by_tracked = tracked_bytes.saturating_sub(budget);
    by_free.max(by_tracked)
}

/// Volume a camera should record to, or `None` to pause it.
///
/// The primary wins when usable, except that with `failback` off a camera
/// already on its standby stays there, and with `failback` on it only moves
/// back once the primary is also out of capacity pressure.
pub fn choose_volume(
    camera: &Camera,
    standby: Option<&str>,
    current: Option<&str>,
    states: &HashMap<String, VolumeState>,
    failback: bool,
) -> Option<String> {
    let usable = |id: &str| states.get(id).is_some_and(VolumeState::usable);
    let primary = camera.volume.as_str();

    if let Some(standby) = standby
        && current == Some(standby)
        && usable(standby)
    {
        let primary_ready = states.get(primary).is_some_and(VolumeState::comfortable);
        if !failback || !primary_ready {
            return Some(standby.to_string());
        }
    }

    if usable(primary) {
        return Some(primary.to_string());
    }
    match standby {
        Some(standby) if usable(standby) => Some(standby.to_string()),
        _ => None,
    }
}
