//! Capture session behaviour against a scripted capture process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use camrec::capture::{
    CaptureSession, RestartSettings, SessionEvent, SessionExit, SessionHandle, SessionSettings,
};
use camrec::domain::{Camera, SessionState, Volume};
use camrec::storage::{OrphanPolicy, SegmentStore};

use common::{FakeLauncher, Step, camera, eventually, setup_store, volume};

fn settings(max_restarts: usize) -> SessionSettings {
    SessionSettings {
        ready_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(1),
        heartbeat_factor: 2,
        restart: RestartSettings {
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            failure_window: Duration::from_secs(30),
            max_restarts,
            stable_after: Duration::from_secs(300),
        },
        extension: "mkv".to_string(),
        partial_policy: OrphanPolicy::Quarantine,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    volume: Volume,
    store: SegmentStore,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(dir.path()).await;
    let volume = volume("primary", dir.path().join("rec"));
    Fixture {
        _dir: dir,
        volume,
        store,
    }
}

fn start(
    fx: &Fixture,
    launcher: &FakeLauncher,
    settings: SessionSettings,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    start_camera(fx, camera("gate", "primary"), launcher, settings)
}

fn start_camera(
    fx: &Fixture,
    camera: Camera,
    launcher: &FakeLauncher,
    settings: SessionSettings,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = CaptureSession::new(
        camera,
        fx.volume.clone(),
        Arc::new(launcher.clone()),
        fx.store.clone(),
        settings,
        tx,
    )
    .start();
    (handle, rx)
}

fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_repeated_crashes_fault_exactly_once() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new().with_default("gate", vec![Step::Exit(false)]);
    let (handle, mut rx) = start(&fx, &launcher, settings(3));

    let exit = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("session should give up");
    assert_eq!(exit, SessionExit::Faulted);

    // Three restarts, then the fourth crash is the fault.
    let launches = launcher.launches("gate");
    assert_eq!(launches.len(), 4);
    let gaps: Vec<Duration> = launches.windows(2).map(|w| w[1].1 - w[0].1).collect();
    assert!(gaps[0] >= Duration::from_millis(20), "{gaps:?}");
    assert!(gaps[1] >= Duration::from_millis(40), "{gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(80), "{gaps:?}");

    let events = drain(&mut rx);
    let faults: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Faulted { .. }))
        .collect();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        faults[0],
        SessionEvent::Faulted { crashes: 4, .. }
    ));
    assert!(events.contains(&SessionEvent::StateChanged {
        camera_id: "gate".into(),
        volume_id: "primary".into(),
        state: SessionState::Stopped,
    }));
}

#[tokio::test]
async fn test_graceful_stop_registers_open_segment() {
    let fx = fixture().await;
    let launcher =
        FakeLauncher::new().with_default("gate", vec![Step::Open(100), Step::Open(200)]);
    let (handle, mut rx) = start(&fx, &launcher, settings(3));

    let store = fx.store.clone();
    let mut registered = 0;
    let ok = eventually(Duration::from_secs(5), || {
        registered += drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, SessionEvent::SegmentRegistered { .. }))
            .count();
        registered >= 1
    })
    .await;
    assert!(ok, "first segment should be registered when the second opens");
    assert_eq!(handle.state(), SessionState::Running);

    assert_eq!(handle.stop().await, SessionExit::Stopped);
    assert_eq!(launcher.stops(), 1);

    let segments = store.list_all(Default::default()).collect().await.unwrap();
    let sizes: Vec<u64> = segments.iter().map(|s| s.size_bytes).collect();
    assert_eq!(sizes, vec![100, 200]);
    assert!(segments.iter().all(|s| s.volume_id == "primary"));
    assert_eq!(launcher.launches("gate").len(), 1);
}

#[tokio::test]
async fn test_crash_partial_is_quarantined() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new().with_default(
        "gate",
        vec![Step::Open(100), Step::Open(50), Step::Exit(false)],
    );
    let (handle, mut rx) = start(&fx, &launcher, settings(0));

    let exit = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert_eq!(exit, SessionExit::Faulted);

    let segments = fx
        .store
        .list_all(Default::default())
        .collect()
        .await
        .unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].size_bytes, 100);

    let quarantined: Vec<_> = std::fs::read_dir(fx.volume.quarantine_dir().join("gate"))
        .unwrap()
        .collect();
    assert_eq!(quarantined.len(), 1);

    let faults = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Faulted { .. }))
        .count();
    assert_eq!(faults, 1);
}

#[tokio::test]
async fn test_clean_exit_keeps_last_segment_and_restarts() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new();
    launcher.queue("gate", vec![Step::Open(10), Step::Open(20), Step::Exit(true)]);
    launcher.queue("gate", vec![Step::Open(30)]);
    let (handle, mut rx) = start(&fx, &launcher, settings(3));

    let store = fx.store.clone();
    let mut running = 0;
    let ok = eventually(Duration::from_secs(5), || {
        running += drain(&mut rx)
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::StateChanged {
                        state: SessionState::Running,
                        ..
                    }
                )
            })
            .count();
        running >= 2
    })
    .await;
    assert!(ok, "session should restart after the process exits");
    assert_eq!(launcher.launches("gate").len(), 2);

    handle.stop().await;
    let sizes: Vec<u64> = store
        .list_all(Default::default())
        .collect()
        .await
        .unwrap()
        .iter()
        .map(|s| s.size_bytes)
        .collect();
    assert_eq!(sizes, vec![10, 20, 30]);
}

#[tokio::test]
async fn test_ready_timeout_counts_as_crash() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new();
    let mut settings = settings(0);
    settings.ready_timeout = Duration::from_millis(50);
    let (handle, mut rx) = start(&fx, &launcher, settings);

    let exit = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert_eq!(exit, SessionExit::Faulted);

    let reason = drain(&mut rx).into_iter().find_map(|e| match e {
        SessionEvent::Faulted { reason, .. } => Some(reason),
        _ => None,
    });
    assert!(reason.unwrap().contains("no segment opened"));
}

#[tokio::test]
async fn test_stop_during_backoff() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new().with_default("gate", vec![Step::Exit(false)]);
    let mut settings = settings(10);
    settings.restart.base_backoff = Duration::from_secs(30);
    settings.restart.max_backoff = Duration::from_secs(30);
    let (handle, _rx) = start(&fx, &launcher, settings);

    let ok = eventually(Duration::from_secs(5), || {
        handle.state() == SessionState::Crashed
    })
    .await;
    assert!(ok);

    let exit = tokio::time::timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("stop must not wait for the backoff");
    assert_eq!(exit, SessionExit::Stopped);
    assert_eq!(launcher.launches("gate").len(), 1);
}

#[tokio::test]
async fn test_silent_process_is_killed_after_heartbeat() {
    let fx = fixture().await;
    let mut gate = camera("gate", "primary");
    gate.segment_duration = Duration::from_millis(50);
    // Opens one segment, then never rotates.
    let launcher = FakeLauncher::new().with_default("gate", vec![Step::Open(10)]);
    let (handle, mut rx) = start_camera(&fx, gate, &launcher, settings(1));

    let exit = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("a silent process should be treated as hung");
    assert_eq!(exit, SessionExit::Faulted);

    let launches = launcher.launches("gate");
    assert_eq!(launches.len(), 2);
    assert!(launches[1].1 - launches[0].1 >= Duration::from_millis(100));
    // Killed rather than asked to stop.
    assert_eq!(launcher.stops(), 0);

    let events = drain(&mut rx);
    let running = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: SessionState::Running,
                    ..
                }
            )
        })
        .count();
    assert_eq!(running, 2);
    let reason = events.into_iter().find_map(|e| match e {
        SessionEvent::Faulted { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(reason.as_deref(), Some("no new segment within 100ms"));

    let quarantined = std::fs::read_dir(fx.volume.quarantine_dir().join("gate"))
        .unwrap()
        .count();
    assert_eq!(quarantined, 2);
    assert!(fx.store.list_all(Default::default()).collect().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sustained_run_resets_crash_history() {
    let fx = fixture().await;
    let launcher = FakeLauncher::new().with_default("gate", vec![Step::Open(10)]);
    for _ in 0..3 {
        launcher.queue(
            "gate",
            vec![
                Step::Open(10),
                Step::Wait(Duration::from_millis(150)),
                Step::Exit(false),
            ],
        );
    }
    let mut settings = settings(1);
    settings.restart.stable_after = Duration::from_millis(50);
    let (handle, mut rx) = start(&fx, &launcher, settings);

    // Three crashes against a limit of one restart, each after a stable run.
    let ok = eventually(Duration::from_secs(5), || {
        launcher.launches("gate").len() == 4 && handle.state() == SessionState::Running
    })
    .await;
    assert!(ok, "session should keep restarting after stable runs");

    let faults = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Faulted { .. }))
        .count();
    assert_eq!(faults, 0);

    assert_eq!(handle.stop().await, SessionExit::Stopped);
}
