//! Volume monitor: capacity and health snapshots per storage volume.

pub mod capacity;
pub mod health;
pub mod monitor;

pub use capacity::{Capacity, CapacityProbe, DiskCapacityProbe};
pub use health::{HealthCheck, HealthReport, SystemHealthCheck, parse_mdstat, parse_smart_health};
pub use monitor::{MonitorSettings, VolumeMonitor, VolumeSnapshot};
