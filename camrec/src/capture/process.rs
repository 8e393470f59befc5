//! Capture process abstraction.
//!
//! A [`CaptureLauncher`] starts one external process per camera; the session
//! drives it through [`CaptureProcess`]. Tests substitute scripted fakes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Everything a launcher needs to start capturing one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub camera_id: String,
    /// Stream URL or device path. May contain credentials.
    pub source: String,
    /// Directory receiving the segment files.
    pub output_dir: PathBuf,
    /// Segment file extension, without the dot.
    pub extension: String,
    pub segment_duration: Duration,
    pub segment_size_bytes: Option<u64>,
    /// File that receives the process's diagnostic output.
    pub log_path: PathBuf,
}

/// Observable progress of a capture process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A new segment file was opened. The previously open one, if any, is
    /// now closed.
    SegmentOpened(PathBuf),
    /// The process exited. No events follow.
    Exited { success: bool, code: Option<i32> },
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process finished its current segment and exited.
    Graceful,
    /// The grace period ran out and the process was killed.
    Forced,
}

#[async_trait]
pub trait CaptureProcess: Send {
    /// Wait for the next event. Returns `None` once `Exited` has been seen.
    async fn next_event(&mut self) -> Option<CaptureEvent>;

    /// Ask the process to finish the current segment and exit, killing it
    /// if it is still alive after `grace`.
    async fn stop(&mut self, grace: Duration) -> Result<StopOutcome>;

    /// Terminate immediately.
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait CaptureLauncher: Send + Sync {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>>;
}
