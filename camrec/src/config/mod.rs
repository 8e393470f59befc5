//! Configuration file.
//!
//! A single TOML document read once at startup. Every section has defaults
//! except `[[volumes]]` and `[[cameras]]`. Validation failures are the only
//! fatal errors of the service.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::ffmpeg::loglevel_reports_segments;
use crate::capture::{FfmpegSettings, RestartSettings, SessionSettings};
use crate::domain::{Camera, RetentionPolicy, Volume};
use crate::storage::{OrphanPolicy, ReconcileOptions};
use crate::utils::filename::sanitize_filename;
use crate::volume::MonitorSettings;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Log filter directive. Re-read on SIGHUP.
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Days of rotated `camrec.log.*` files to keep.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    /// Orchestrator capacity/health tick.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Handling of segment files without metadata found at startup.
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,

    /// Store a SHA-256 with every segment.
    #[serde(default)]
    pub checksum_segments: bool,

    /// Move rerouted cameras back once their primary volume recovers.
    #[serde(default = "default_true")]
    pub failback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_stale_factor")]
    pub stale_factor: f64,

    #[serde(default = "default_smartctl")]
    pub smartctl_path: PathBuf,

    #[serde(default = "default_mdstat")]
    pub mdstat_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Container of the segment files, also their extension.
    #[serde(default = "default_segment_format")]
    pub segment_format: String,

    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Transport for `rtsp://` sources. Empty leaves ffmpeg's default.
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default = "default_heartbeat_factor")]
    pub heartbeat_factor: u32,

    #[serde(default)]
    pub input_args: Vec<String>,

    #[serde(default)]
    pub output_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    #[serde(default = "default_stable_after")]
    pub stable_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub id: String,
    /// Recording root.
    pub path: PathBuf,
    /// Block device for SMART queries.
    pub device: Option<String>,
    /// md array name, e.g. `md0`.
    pub array: Option<String>,
    #[serde(default)]
    pub reserved_headroom_bytes: u64,
    /// Id of the standby volume.
    pub standby: Option<String>,
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    #[serde(default = "default_min_retention")]
    pub min_retention_secs: u64,
    pub max_retention_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub source: String,
    pub volume: String,
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u64,
    pub segment_size_bytes: Option<u64>,
}

fn default_database_url() -> String {
    "sqlite:camrec.db?mode=rwc".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_retention_days() -> u32 {
    7
}
fn default_tick_interval() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    30
}
fn default_query_timeout() -> u64 {
    10
}
fn default_stale_factor() -> f64 {
    2.0
}
fn default_smartctl() -> PathBuf {
    PathBuf::from("smartctl")
}
fn default_mdstat() -> PathBuf {
    PathBuf::from("/proc/mdstat")
}
fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_segment_format() -> String {
    "mkv".to_string()
}
fn default_loglevel() -> String {
    "info".to_string()
}
fn default_rtsp_transport() -> String {
    "tcp".to_string()
}
fn default_ready_timeout() -> u64 {
    15
}
fn default_stop_grace() -> u64 {
    5
}
fn default_heartbeat_factor() -> u32 {
    2
}
fn default_base_backoff() -> u64 {
    1
}
fn default_max_backoff() -> u64 {
    60
}
fn default_failure_window() -> u64 {
    60
}
fn default_max_restarts() -> usize {
    3
}
fn default_stable_after() -> u64 {
    300
}
fn default_min_free_bytes() -> u64 {
    RetentionPolicy::default().min_free_bytes
}
fn default_min_retention() -> u64 {
    RetentionPolicy::default().min_retention.as_secs()
}
fn default_segment_duration() -> u64 {
    3600
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            log_filter: None,
            log_retention_days: default_log_retention_days(),
            tick_interval_secs: default_tick_interval(),
            orphan_policy: OrphanPolicy::default(),
            checksum_segments: false,
            failback: true,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            query_timeout_secs: default_query_timeout(),
            stale_factor: default_stale_factor(),
            smartctl_path: default_smartctl(),
            mdstat_path: default_mdstat(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            segment_format: default_segment_format(),
            loglevel: default_loglevel(),
            rtsp_transport: default_rtsp_transport(),
            ready_timeout_secs: default_ready_timeout(),
            stop_grace_secs: default_stop_grace(),
            heartbeat_factor: default_heartbeat_factor(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            failure_window_secs: default_failure_window(),
            max_restarts: default_max_restarts(),
            stable_after_secs: default_stable_after(),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.volumes.is_empty() {
            return Err(Error::config("at least one [[volumes]] entry is required"));
        }
        if let Some(filter) = &self.general.log_filter
            && let Err(e) = tracing_subscriber::EnvFilter::try_new(filter)
        {
            return Err(Error::config(format!("invalid log_filter '{filter}': {e}")));
        }

        let mut volume_ids = HashSet::new();
        for volume in &self.volumes {
            if volume.id.trim().is_empty() {
                return Err(Error::config("volume id must not be empty"));
            }
            if !volume_ids.insert(volume.id.as_str()) {
                return Err(Error::config(format!("duplicate volume id '{}'", volume.id)));
            }
            if let Some(max) = volume.max_retention_secs
                && max < volume.min_retention_secs
            {
                return Err(Error::config(format!(
                    "volume '{}': max_retention_secs ({}) is below min_retention_secs ({})",
                    volume.id, max, volume.min_retention_secs
                )));
            }
        }

        for (i, a) in self.volumes.iter().enumerate() {
            for b in &self.volumes[i + 1..] {
                if a.path.starts_with(&b.path) || b.path.starts_with(&a.path) {
                    return Err(Error::config(format!(
                        "volumes '{}' and '{}' have nested paths",
                        a.id, b.id
                    )));
                }
            }
            if let Some(standby) = &a.standby {
                if standby == &a.id {
                    return Err(Error::config(format!(
                        "volume '{}' cannot be its own standby",
                        a.id
                    )));
                }
                if !volume_ids.contains(standby.as_str()) {
                    return Err(Error::config(format!(
                        "volume '{}' names unknown standby '{}'",
                        a.id, standby
                    )));
                }
            }
        }

        let mut camera_ids = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(Error::config("camera id must not be empty"));
            }
            if sanitize_filename(&camera.id) != camera.id {
                return Err(Error::config(format!(
                    "camera id '{}' is not a valid directory name (try '{}')",
                    camera.id,
                    sanitize_filename(&camera.id)
                )));
            }
            if camera.id.starts_with('.') {
                return Err(Error::config(format!(
                    "camera id '{}' must not start with '.'",
                    camera.id
                )));
            }
            if !camera_ids.insert(camera.id.as_str()) {
                return Err(Error::config(format!("duplicate camera id '{}'", camera.id)));
            }
            if !volume_ids.contains(camera.volume.as_str()) {
                return Err(Error::config(format!(
                    "camera '{}' references unknown volume '{}'",
                    camera.id, camera.volume
                )));
            }
            if camera.segment_duration_secs == 0 {
                return Err(Error::config(format!(
                    "camera '{}': segment_duration_secs must be positive",
                    camera.id
                )));
            }
            if camera.source.trim().is_empty() {
                return Err(Error::config(format!("camera '{}' has no source", camera.id)));
            }
        }

        let format = &self.capture.segment_format;
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::config(format!(
                "segment_format '{format}' must be a plain file extension"
            )));
        }
        if self.general.tick_interval_secs == 0 || self.monitor.poll_interval_secs == 0 {
            return Err(Error::config("tick and poll intervals must be positive"));
        }
        if self.monitor.query_timeout_secs == 0 {
            return Err(Error::config("query_timeout_secs must be positive"));
        }
        if self.monitor.stale_factor.is_nan() || self.monitor.stale_factor < 1.0 {
            return Err(Error::config("stale_factor must be at least 1.0"));
        }
        if !loglevel_reports_segments(&self.capture.loglevel) {
            return Err(Error::config(format!(
                "capture loglevel '{}' hides segment boundaries; use info, verbose, debug or trace",
                self.capture.loglevel
            )));
        }
        if self.capture.heartbeat_factor == 0 {
            return Err(Error::config("heartbeat_factor must be positive"));
        }
        if self.restart.base_backoff_secs > self.restart.max_backoff_secs {
            return Err(Error::config(
                "base_backoff_secs must not exceed max_backoff_secs",
            ));
        }

        Ok(())
    }

    pub fn volume_list(&self) -> Vec<Volume> {
        self.volumes
            .iter()
            .map(|v| Volume {
                id: v.id.clone(),
                root: v.path.clone(),
                device: v.device.clone(),
                array: v.array.clone(),
                reserved_headroom_bytes: v.reserved_headroom_bytes,
                standby: v.standby.clone(),
                retention: RetentionPolicy {
                    min_free_bytes: v.min_free_bytes,
                    min_retention: Duration::from_secs(v.min_retention_secs),
                    max_retention: v.max_retention_secs.map(Duration::from_secs),
                },
            })
            .collect()
    }

    pub fn camera_list(&self) -> Vec<Camera> {
        self.cameras
            .iter()
            .map(|c| Camera {
                id: c.id.clone(),
                source: c.source.clone(),
                volume: c.volume.clone(),
                segment_duration: Duration::from_secs(c.segment_duration_secs),
                segment_size_bytes: c.segment_size_bytes,
            })
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.general.tick_interval_secs)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(self.monitor.poll_interval_secs),
            query_timeout: Duration::from_secs(self.monitor.query_timeout_secs),
            stale_factor: self.monitor.stale_factor,
        }
    }

    pub fn restart_settings(&self) -> RestartSettings {
        RestartSettings {
            base_backoff: Duration::from_secs(self.restart.base_backoff_secs),
            max_backoff: Duration::from_secs(self.restart.max_backoff_secs),
            failure_window: Duration::from_secs(self.restart.failure_window_secs),
            max_restarts: self.restart.max_restarts,
            stable_after: Duration::from_secs(self.restart.stable_after_secs),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ready_timeout: Duration::from_secs(self.capture.ready_timeout_secs),
            stop_grace: Duration::from_secs(self.capture.stop_grace_secs),
            heartbeat_factor: self.capture.heartbeat_factor,
            restart: self.restart_settings(),
            extension: self.capture.segment_format.clone(),
            partial_policy: self.general.orphan_policy,
        }
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        let transport = self.capture.rtsp_transport.trim();
        FfmpegSettings {
            binary_path: self.capture.ffmpeg_path.clone(),
            loglevel: self.capture.loglevel.clone(),
            rtsp_transport: (!transport.is_empty()).then(|| transport.to_string()),
            input_args: self.capture.input_args.clone(),
            output_args: self.capture.output_args.clone(),
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            orphan_policy: self.general.orphan_policy,
            extension: self.capture.segment_format.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINIMAL: &str = r#"
[[volumes]]
id = "primary"
path = "/srv/rec"

[[cameras]]
id = "gate"
source = "rtsp://admin:pw@10.0.0.5/stream1"
volume = "primary"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.general.database_url, "sqlite:camrec.db?mode=rwc");
        assert_eq!(config.general.orphan_policy, OrphanPolicy::Quarantine);
        assert!(config.general.failback);
        assert_eq!(config.monitor.poll_interval_secs, 30);
        assert_eq!(config.capture.segment_format, "mkv");
        assert_eq!(config.restart.max_restarts, 3);

        let cameras = config.camera_list();
        assert_eq!(cameras[0].segment_duration, Duration::from_secs(3600));
        let volumes = config.volume_list();
        assert_eq!(volumes[0].retention, RetentionPolicy::default());
        assert_eq!(
            config.monitor_settings().stale_after(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
[general]
orphan_policy = "import"
checksum_segments = true
failback = false

[capture]
segment_format = "mp4"
rtsp_transport = ""

[[volumes]]
id = "primary"
path = "/srv/rec"
device = "/dev/sda"
array = "md0"
standby = "spare"
min_free_bytes = 1000
min_retention_secs = 60
max_retention_secs = 3600

[[volumes]]
id = "spare"
path = "/mnt/spare"

[[cameras]]
id = "gate"
source = "rtsp://10.0.0.5/stream1"
volume = "primary"
segment_duration_secs = 600
"#,
        )
        .unwrap();

        assert_eq!(config.reconcile_options().orphan_policy, OrphanPolicy::Import);
        assert_eq!(config.reconcile_options().extension, "mp4");
        assert_eq!(config.ffmpeg_settings().rtsp_transport, None);
        let primary = &config.volume_list()[0];
        assert_eq!(primary.standby.as_deref(), Some("spare"));
        assert_eq!(
            primary.retention.max_retention,
            Some(Duration::from_secs(3600))
        );
    }

    #[rstest]
    #[case::unknown_volume(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
[[cameras]]
id = "gate"
source = "rtsp://cam"
volume = "nope"
"#,
        "unknown volume"
    )]
    #[case::duplicate_camera(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
[[cameras]]
id = "gate"
source = "rtsp://cam"
volume = "primary"
[[cameras]]
id = "gate"
source = "rtsp://cam2"
volume = "primary"
"#,
        "duplicate camera"
    )]
    #[case::self_standby(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
standby = "primary"
"#,
        "own standby"
    )]
    #[case::retention_order(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
min_retention_secs = 100
max_retention_secs = 10
"#,
        "max_retention_secs"
    )]
    #[case::nested(
        r#"
[[volumes]]
id = "a"
path = "/srv/rec"
[[volumes]]
id = "b"
path = "/srv/rec/b"
"#,
        "nested"
    )]
    #[case::bad_camera_id(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
[[cameras]]
id = "front/door"
source = "rtsp://cam"
volume = "primary"
"#,
        "not a valid directory name"
    )]
    #[case::zero_duration(
        r#"
[[volumes]]
id = "primary"
path = "/srv/rec"
[[cameras]]
id = "gate"
source = "rtsp://cam"
volume = "primary"
segment_duration_secs = 0
"#,
        "segment_duration_secs"
    )]
    #[case::quiet_loglevel(
        r#"
[capture]
loglevel = "warning"
[[volumes]]
id = "primary"
path = "/srv/rec"
"#,
        "hides segment boundaries"
    )]
    #[case::bad_log_filter(
        r#"
[general]
log_filter = "camrec=loud"
[[volumes]]
id = "primary"
path = "/srv/rec"
"#,
        "invalid log_filter"
    )]
    #[case::no_volumes("", "at least one")]
    fn test_invalid_configs(#[case] toml: &str, #[case] needle: &str) {
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
