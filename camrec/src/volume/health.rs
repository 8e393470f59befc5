//! Device and array health checks.
//!
//! Device health comes from `smartctl -H`, software RAID state from
//! `/proc/mdstat`. A volume's health is the worst of the two.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use process_utils::tokio_command;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Volume, VolumeHealth};
use crate::{Error, Result};

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub health: VolumeHealth,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            health: VolumeHealth::Healthy,
            detail: None,
        }
    }

    pub fn new(health: VolumeHealth, detail: impl Into<String>) -> Self {
        Self {
            health,
            detail: Some(detail.into()),
        }
    }

    /// Keep the worse report, joining details.
    pub fn combine(self, other: HealthReport) -> HealthReport {
        let health = self.health.worst(other.health);
        let detail = match (self.detail, other.detail) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        HealthReport { health, detail }
    }
}

/// Queries the health of the devices behind a volume.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, volume: &Volume) -> Result<HealthReport>;
}

/// Health check using `smartctl` and `/proc/mdstat`.
///
/// A volume with neither a device nor an array configured has nothing to
/// check and reports healthy.
#[derive(Debug, Clone)]
pub struct SystemHealthCheck {
    smartctl: PathBuf,
    mdstat: PathBuf,
}

impl Default for SystemHealthCheck {
    fn default() -> Self {
        Self {
            smartctl: PathBuf::from("smartctl"),
            mdstat: PathBuf::from("/proc/mdstat"),
        }
    }
}

impl SystemHealthCheck {
    pub fn new(smartctl: impl Into<PathBuf>, mdstat: impl Into<PathBuf>) -> Self {
        Self {
            smartctl: smartctl.into(),
            mdstat: mdstat.into(),
        }
    }

    async fn smart(&self, device: &str) -> Result<HealthReport> {
        let output = tokio_command(&self.smartctl)
            .arg("-H")
            .arg(device)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::io_path("running", &self.smartctl, e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = parse_smart_health(&stdout);
        debug!(device, health = %report.health, "SMART health read");
        Ok(report.with_prefix(device))
    }

    async fn array(&self, array: &str) -> Result<HealthReport> {
        let content = tokio::fs::read_to_string(&self.mdstat)
            .await
            .map_err(|e| Error::io_path("reading", &self.mdstat, e))?;
        Ok(parse_mdstat(&content, array).with_prefix(array))
    }
}

#[async_trait]
impl HealthCheck for SystemHealthCheck {
    async fn check(&self, volume: &Volume) -> Result<HealthReport> {
        let mut report = HealthReport::healthy();
        if let Some(device) = &volume.device {
            report = report.combine(self.smart(device).await?);
        }
        if let Some(array) = &volume.array {
            report = report.combine(self.array(array).await?);
        }
        Ok(report)
    }
}

impl HealthReport {
    fn with_prefix(mut self, source: &str) -> Self {
        self.detail = self.detail.map(|d| format!("{source}: {d}"));
        self
    }
}

/// Interpret `smartctl -H` output.
pub fn parse_smart_health(output: &str) -> HealthReport {
    for line in output.lines() {
        let line = line.trim();
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.to_ascii_lowercase();
        if !(label.contains("overall-health") || label.contains("health status")) {
            continue;
        }
        let value = value.trim();
        let upper = value.to_ascii_uppercase();
        if upper.starts_with("PASSED") || upper.starts_with("OK") {
            return HealthReport::healthy();
        }
        if upper.contains("FAIL") {
            return HealthReport::new(VolumeHealth::Failed, format!("SMART reports {value}"));
        }
        return HealthReport::new(VolumeHealth::Unknown, format!("SMART reports {value}"));
    }
    HealthReport::new(VolumeHealth::Unknown, "no SMART health verdict")
}

/// Interpret the `/proc/mdstat` block for one array.
pub fn parse_mdstat(content: &str, array: &str) -> HealthReport {
    let array = array.trim_start_matches("/dev/");
    let mut lines = content.lines();
    let header = lines.by_ref().find(|line| {
        line.split_once(':')
            .is_some_and(|(name, _)| name.trim() == array)
    });
    let Some(header) = header else {
        return HealthReport::new(VolumeHealth::Unknown, "array not listed in mdstat");
    };

    let mut block = vec![header];
    for line in lines {
        if line.trim().is_empty() || !line.starts_with(char::is_whitespace) {
            break;
        }
        block.push(line);
    }

    let (_, description) = header.split_once(':').unwrap_or((header, ""));
    let mut tokens = description.split_whitespace();
    if tokens.next() == Some("inactive") {
        return HealthReport::new(VolumeHealth::Failed, "array inactive");
    }
    if description.contains("(F)") {
        return HealthReport::new(VolumeHealth::Degraded, "array has a faulty member");
    }

    for line in &block[1..] {
        if let Some((expected, active)) = member_counts(line) {
            if active == 0 {
                return HealthReport::new(VolumeHealth::Failed, "array has no active member");
            }
            if active < expected {
                return HealthReport::new(
                    VolumeHealth::Degraded,
                    format!("{active}/{expected} members active"),
                );
            }
        }
        if member_map(line).is_some_and(|map| map.contains('_')) {
            return HealthReport::new(VolumeHealth::Degraded, "array member missing");
        }
        let lower = line.to_ascii_lowercase();
        for activity in ["recovery", "resync", "reshape", "rebuild"] {
            if lower.contains(activity) {
                return HealthReport::new(
                    VolumeHealth::Degraded,
                    format!("array {activity} in progress"),
                );
            }
        }
    }

    HealthReport::healthy()
}

/// `[2/1]` → `(2, 1)`.
fn member_counts(line: &str) -> Option<(u32, u32)> {
    line.split_whitespace().find_map(|token| {
        let inner = token.strip_prefix('[')?.strip_suffix(']')?;
        let (expected, active) = inner.split_once('/')?;
        Some((expected.parse().ok()?, active.parse().ok()?))
    })
}

/// `[U_]` → `"U_"`.
fn member_map(line: &str) -> Option<&str> {
    line.split_whitespace().find_map(|token| {
        let inner = token.strip_prefix('[')?.strip_suffix(']')?;
        (!inner.is_empty() && inner.chars().all(|c| c == 'U' || c == '_')).then_some(inner)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MDSTAT: &str = "\
Personalities : [raid1]
md0 : active raid1 sdb1[1] sda1[0]
      976630464 blocks super 1.2 [2/2] [UU]
      bitmap: 0/8 pages [0KB], 65536KB chunk

md1 : active raid1 sdd1[1] sdc1[0](F)
      976630464 blocks super 1.2 [2/1] [_U]

md2 : active raid1 sdf1[1] sde1[0]
      976630464 blocks super 1.2 [2/1] [U_]
      [=>...................]  recovery = 12.6% (123/976) finish=80.1min speed=150000K/sec

md3 : inactive sdg1[0](S)
      976630464 blocks super 1.2

unused devices: <none>
";

    #[rstest]
    #[case("md0", VolumeHealth::Healthy)]
    #[case("/dev/md0", VolumeHealth::Healthy)]
    #[case("md1", VolumeHealth::Degraded)]
    #[case("md2", VolumeHealth::Degraded)]
    #[case("md3", VolumeHealth::Failed)]
    #[case("md9", VolumeHealth::Unknown)]
    fn test_parse_mdstat(#[case] array: &str, #[case] expected: VolumeHealth) {
        assert_eq!(parse_mdstat(MDSTAT, array).health, expected);
    }

    #[rstest]
    #[case(
        "SMART overall-health self-assessment test result: PASSED",
        VolumeHealth::Healthy
    )]
    #[case("SMART Health Status: OK", VolumeHealth::Healthy)]
    #[case(
        "SMART overall-health self-assessment test result: FAILED!",
        VolumeHealth::Failed
    )]
    #[case("Smartctl open device: /dev/sdz failed: No such device", VolumeHealth::Unknown)]
    fn test_parse_smart_health(#[case] output: &str, #[case] expected: VolumeHealth) {
        assert_eq!(parse_smart_health(output).health, expected);
    }

    #[test]
    fn test_combine_keeps_worst() {
        let combined = HealthReport::healthy()
            .combine(HealthReport::new(VolumeHealth::Degraded, "md0: resync"))
            .combine(HealthReport::new(VolumeHealth::Unknown, "sda: no verdict"));
        assert_eq!(combined.health, VolumeHealth::Degraded);
        assert_eq!(
            combined.detail.as_deref(),
            Some("md0: resync; sda: no verdict")
        );
    }

    #[tokio::test]
    async fn test_system_check_without_sources_is_healthy() {
        let volume = Volume {
            id: "primary".into(),
            root: PathBuf::from("/srv/rec"),
            device: None,
            array: None,
            reserved_headroom_bytes: 0,
            standby: None,
            retention: Default::default(),
        };
        let report = SystemHealthCheck::default().check(&volume).await.unwrap();
        assert_eq!(report.health, VolumeHealth::Healthy);
    }

    #[tokio::test]
    async fn test_system_check_reads_mdstat_file() {
        let dir = tempfile::tempdir().unwrap();
        let mdstat = dir.path().join("mdstat");
        tokio::fs::write(&mdstat, MDSTAT).await.unwrap();

        let volume = Volume {
            id: "primary".into(),
            root: PathBuf::from("/srv/rec"),
            device: None,
            array: Some("md2".into()),
            reserved_headroom_bytes: 0,
            standby: None,
            retention: Default::default(),
        };
        let check = SystemHealthCheck::new("smartctl", &mdstat);
        let report = check.check(&volume).await.unwrap();
        assert_eq!(report.health, VolumeHealth::Degraded);
        assert!(report.detail.unwrap().starts_with("md2: "));
    }
}
