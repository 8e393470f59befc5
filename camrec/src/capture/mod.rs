//! Capture sessions: supervise one external capture process per camera.

pub mod ffmpeg;
pub mod process;
pub mod restart;
pub mod session;

pub use ffmpeg::{FfmpegLauncher, FfmpegSettings};
pub use process::{CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, StopOutcome};
pub use restart::{RestartDecision, RestartSettings, RestartTracker};
pub use session::{
    CAPTURE_LOG_FILE, CaptureSession, SessionEvent, SessionExit, SessionHandle, SessionSettings,
};
