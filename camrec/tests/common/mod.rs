//! Shared fixtures for camrec integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use camrec::Result;
use camrec::capture::{CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, StopOutcome};
use camrec::database::{DbPool, init_pool, run_migrations};
use camrec::domain::{Camera, NewSegment, RetentionPolicy, Segment, Volume, VolumeHealth};
use camrec::storage::SegmentStore;
use camrec::utils::filename::segment_file_name;
use camrec::volume::{Capacity, CapacityProbe, HealthCheck, HealthReport};

/// File-backed database with the schema applied.
pub async fn setup_pool(dir: &Path) -> DbPool {
    let url = format!("sqlite:{}?mode=rwc", dir.join("camrec.db").display());
    let pool = init_pool(&url).await.expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

pub async fn setup_store(dir: &Path) -> SegmentStore {
    SegmentStore::new(setup_pool(dir).await)
}

pub fn volume(id: &str, root: PathBuf) -> Volume {
    Volume {
        id: id.into(),
        root,
        device: None,
        array: None,
        reserved_headroom_bytes: 0,
        standby: None,
        retention: RetentionPolicy {
            min_free_bytes: 0,
            min_retention: Duration::ZERO,
            max_retention: None,
        },
    }
}

pub fn camera(id: &str, volume: &str) -> Camera {
    Camera {
        id: id.into(),
        source: format!("rtsp://user:secret@{id}.local/stream"),
        volume: volume.into(),
        segment_duration: Duration::from_secs(60),
        segment_size_bytes: None,
    }
}

/// Write a segment file of `bytes` bytes for `camera` starting at `start`.
pub async fn write_segment_file(
    volume: &Volume,
    camera_id: &str,
    start: DateTime<Utc>,
    bytes: usize,
) -> PathBuf {
    let dir = volume.camera_dir(camera_id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join(segment_file_name(start, "mkv"));
    tokio::fs::write(&path, vec![0u8; bytes]).await.unwrap();
    path
}

/// Write and register a segment.
pub async fn record_segment(
    store: &SegmentStore,
    volume: &Volume,
    camera_id: &str,
    start: DateTime<Utc>,
    bytes: usize,
) -> Segment {
    let path = write_segment_file(volume, camera_id, start, bytes).await;
    store
        .register(NewSegment::new(
            camera_id,
            &volume.id,
            start,
            Duration::from_secs(60),
            path,
        ))
        .await
        .unwrap()
}

/// Start times on whole seconds, far enough apart to never collide.
pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    let now = Utc::now().timestamp();
    DateTime::from_timestamp(now - hours * 3600, 0).unwrap()
}

pub struct TestVolumes {
    pub dir: TempDir,
}

impl TestVolumes {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self, id: &str) -> PathBuf {
        self.dir.path().join(id)
    }
}

/// One step of a scripted capture process.
#[derive(Debug, Clone)]
pub enum Step {
    /// Create a segment file of the given size and report it opened.
    Open(usize),
    /// Pause before the next step.
    Wait(Duration),
    /// Exit with the given success.
    Exit(bool),
}

#[derive(Default)]
struct LauncherState {
    scripts: HashMap<String, VecDeque<Vec<Step>>>,
    launches: Vec<(CaptureSpec, Instant)>,
    stops: usize,
}

/// Launcher whose processes follow scripts instead of running ffmpeg.
///
/// Each launch takes the next queued script for its camera, or the
/// camera's default script. A process that runs out of steps idles until
/// it is stopped, then exits gracefully.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    defaults: Arc<Mutex<HashMap<String, Vec<Step>>>>,
    clock: Arc<AtomicI64>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        let launcher = Self::default();
        launcher
            .clock
            .store(Utc::now().timestamp() - 24 * 3600, Ordering::SeqCst);
        launcher
    }

    /// Script used for every launch of `camera_id` without a queued script.
    pub fn with_default(self, camera_id: &str, steps: Vec<Step>) -> Self {
        self.defaults.lock().insert(camera_id.to_string(), steps);
        self
    }

    pub fn queue(&self, camera_id: &str, steps: Vec<Step>) {
        self.state
            .lock()
            .scripts
            .entry(camera_id.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn launches(&self, camera_id: &str) -> Vec<(CaptureSpec, Instant)> {
        self.state
            .lock()
            .launches
            .iter()
            .filter(|(spec, _)| spec.camera_id == camera_id)
            .cloned()
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    fn next_start(&self) -> DateTime<Utc> {
        let secs = self.clock.fetch_add(1, Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).unwrap()
    }
}

#[async_trait]
impl CaptureLauncher for FakeLauncher {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>> {
        let steps = {
            let mut state = self.state.lock();
            state.launches.push((spec.clone(), Instant::now()));
            state
                .scripts
                .get_mut(&spec.camera_id)
                .and_then(VecDeque::pop_front)
        };
        let steps = steps
            .or_else(|| self.defaults.lock().get(&spec.camera_id).cloned())
            .unwrap_or_default();

        Ok(Box::new(FakeProcess {
            spec: spec.clone(),
            steps: steps.into(),
            launcher: self.clone(),
            exited: false,
        }))
    }
}

struct FakeProcess {
    spec: CaptureSpec,
    steps: VecDeque<Step>,
    launcher: FakeLauncher,
    exited: bool,
}

#[async_trait]
impl CaptureProcess for FakeProcess {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        if self.exited {
            return None;
        }
        loop {
            match self.steps.pop_front() {
                Some(Step::Open(bytes)) => {
                    let name = segment_file_name(self.launcher.next_start(), &self.spec.extension);
                    let path = self.spec.output_dir.join(name);
                    tokio::fs::write(&path, vec![1u8; bytes]).await.unwrap();
                    return Some(CaptureEvent::SegmentOpened(path));
                }
                Some(Step::Wait(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Exit(success)) => {
                    self.exited = true;
                    return Some(CaptureEvent::Exited {
                        success,
                        code: Some(if success { 0 } else { 1 }),
                    });
                }
                None => futures::future::pending::<()>().await,
            }
        }
    }

    async fn stop(&mut self, _grace: Duration) -> Result<StopOutcome> {
        self.exited = true;
        self.launcher.state.lock().stops += 1;
        Ok(StopOutcome::Graceful)
    }

    async fn kill(&mut self) -> Result<()> {
        self.exited = true;
        Ok(())
    }
}

/// Capacity probe returning configurable values per volume root.
#[derive(Default)]
pub struct FakeCapacity {
    values: Mutex<HashMap<PathBuf, Capacity>>,
    fallback: Mutex<Option<Capacity>>,
}

impl FakeCapacity {
    pub fn uniform(free_bytes: u64, total_bytes: u64) -> Self {
        let probe = Self::default();
        *probe.fallback.lock() = Some(Capacity {
            free_bytes,
            total_bytes,
        });
        probe
    }

    /// Change the answer for every volume without an explicit value.
    pub fn set_uniform(&self, free_bytes: u64, total_bytes: u64) {
        *self.fallback.lock() = Some(Capacity {
            free_bytes,
            total_bytes,
        });
    }

    pub fn set(&self, root: &Path, free_bytes: u64, total_bytes: u64) {
        self.values.lock().insert(
            root.to_path_buf(),
            Capacity {
                free_bytes,
                total_bytes,
            },
        );
    }
}

#[async_trait]
impl CapacityProbe for FakeCapacity {
    async fn capacity(&self, path: &Path) -> Result<Capacity> {
        if let Some(capacity) = self.values.lock().get(path) {
            return Ok(*capacity);
        }
        (*self.fallback.lock()).ok_or_else(|| camrec::Error::not_found("volume", path.display().to_string()))
    }
}

/// Health check answering from a per-volume table (default healthy).
#[derive(Default)]
pub struct FakeHealth {
    health: Mutex<HashMap<String, VolumeHealth>>,
}

impl FakeHealth {
    pub fn set(&self, volume_id: &str, health: VolumeHealth) {
        self.health.lock().insert(volume_id.to_string(), health);
    }
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn check(&self, volume: &Volume) -> Result<HealthReport> {
        let health = self
            .health
            .lock()
            .get(&volume.id)
            .copied()
            .unwrap_or(VolumeHealth::Healthy);
        Ok(HealthReport::new(health, format!("fake {health}")))
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
