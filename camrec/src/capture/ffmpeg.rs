//! FFmpeg capture launcher.
//!
//! Runs ffmpeg's segment muxer with stream copy. Segment boundaries are read
//! from the `Opening '<path>' for writing` lines on stderr; every stderr line
//! is mirrored to the camera's `ffmpeg.log`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{Termination, terminate_gracefully, tokio_command};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::process::{CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, StopOutcome};
use crate::domain::camera::redact_source;
use crate::utils::filename::segment_output_template;
use crate::utils::fs;
use crate::{Error, Result};

/// FFmpeg invocation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegSettings {
    pub binary_path: PathBuf,
    pub loglevel: String,
    /// Applied to `rtsp://` sources only.
    pub rtsp_transport: Option<String>,
    /// Extra arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Extra arguments placed after `-c copy`.
    pub output_args: Vec<String>,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("ffmpeg"),
            loglevel: "info".to_string(),
            rtsp_transport: Some("tcp".to_string()),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegLauncher {
    settings: FfmpegSettings,
}

impl FfmpegLauncher {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    /// Build ffmpeg command arguments.
    pub fn build_args(&self, spec: &CaptureSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            self.settings.loglevel.clone(),
            "-nostats".into(),
        ];

        if spec.source.starts_with("rtsp://")
            && let Some(transport) = &self.settings.rtsp_transport
        {
            args.extend(["-rtsp_transport".into(), transport.clone()]);
        }
        args.extend(self.settings.input_args.iter().cloned());
        args.extend(["-i".into(), spec.source.clone()]);

        args.extend(["-c".into(), "copy".into()]);
        args.extend(self.settings.output_args.iter().cloned());

        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            spec.segment_duration.as_secs().max(1).to_string(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
        ]);

        let template = segment_output_template(&spec.output_dir, &spec.extension);
        args.push(template.to_string_lossy().into_owned());
        args.push("-y".into());
        args
    }
}

#[async_trait]
impl CaptureLauncher for FfmpegLauncher {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>> {
        fs::ensure_dir_all(&spec.output_dir).await?;
        if spec.segment_size_bytes.is_some() {
            warn!(
                camera_id = %spec.camera_id,
                "ffmpeg's segment muxer splits by time only; segment size limit ignored"
            );
        }

        let args = self.build_args(spec);
        let printable: Vec<String> = args.iter().map(|a| redact_source(a)).collect();
        info!(camera_id = %spec.camera_id, args = ?printable, "Starting ffmpeg");

        let log = tokio::fs::File::create(&spec.log_path)
            .await
            .map_err(|e| Error::io_path("creating", &spec.log_path, e))?;

        let mut child = tokio_command(&self.settings.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io_path("spawning", &self.settings.binary_path, e))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("Failed to capture ffmpeg stderr".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_stderr(stderr, log, tx, spec.camera_id.clone()));

        Ok(Box::new(FfmpegProcess {
            child,
            events: rx,
            exited: false,
        }))
    }
}

async fn read_stderr(
    stderr: ChildStderr,
    mut log: tokio::fs::File,
    tx: mpsc::Sender<PathBuf>,
    camera_id: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if log.write_all(line.as_bytes()).await.is_err()
                    || log.write_all(b"\n").await.is_err()
                {
                    debug!(camera_id = %camera_id, "ffmpeg.log write failed");
                }
                if let Some(path) = parse_opening(&line)
                    && tx.send(path).await.is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "Error reading ffmpeg output");
                break;
            }
        }
    }
    let _ = log.flush().await;
}

/// Extract the path from `[segment @ 0x..] Opening '<path>' for writing`.
pub fn parse_opening(line: &str) -> Option<PathBuf> {
    let start = line.find("Opening '")? + "Opening '".len();
    let rest = &line[start..];
    let end = rest.rfind("' for writing")?;
    Some(PathBuf::from(&rest[..end]))
}

/// Whether ffmpeg at `-loglevel <level>` still prints the segment muxer's
/// `Opening` lines, which are logged at `info`.
///
/// Accepts names, numeric levels and flag prefixes such as `repeat+level+info`.
pub fn loglevel_reports_segments(level: &str) -> bool {
    let level = level.rsplit('+').next().unwrap_or(level).trim();
    match level {
        "info" | "verbose" | "debug" | "trace" => true,
        "quiet" | "panic" | "fatal" | "error" | "warning" => false,
        other => other.parse::<i32>().is_ok_and(|n| n >= 32),
    }
}

struct FfmpegProcess {
    child: Child,
    events: mpsc::Receiver<PathBuf>,
    exited: bool,
}

#[async_trait]
impl CaptureProcess for FfmpegProcess {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        if self.exited {
            return None;
        }
        // stderr closes when the process exits; drain it before reaping.
        if let Some(path) = self.events.recv().await {
            return Some(CaptureEvent::SegmentOpened(path));
        }
        self.exited = true;
        match self.child.wait().await {
            Ok(status) => Some(CaptureEvent::Exited {
                success: status.success(),
                code: status.code(),
            }),
            Err(e) => {
                warn!(error = %e, "Failed to reap ffmpeg");
                Some(CaptureEvent::Exited {
                    success: false,
                    code: None,
                })
            }
        }
    }

    async fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        let termination = terminate_gracefully(&mut self.child, b"q", grace).await?;
        self.exited = true;
        Ok(match termination {
            Termination::Forced => StopOutcome::Forced,
            Termination::Graceful(Some(0)) | Termination::AlreadyExited(Some(0)) => {
                StopOutcome::Graceful
            }
            // Exited on its own terms but not cleanly: the open segment is suspect.
            Termination::Graceful(_) | Termination::AlreadyExited(_) => StopOutcome::Forced,
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.exited = true;
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
