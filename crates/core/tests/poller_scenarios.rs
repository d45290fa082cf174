//! 仮想時間で回すジョブ監視のシナリオテスト。
//!
//! 実行: cargo test --test poller_scenarios

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;

use tf_core::domain::error::ErrorCode;
use tf_core::domain::job::{JobKind, JobRecord, JobStatus};
use tf_core::domain::settings::MonitorSettings;
use tf_core::domain::severity::Severity;
use tf_core::domain::status_view::StatusTone;
use tf_core::domain::watch::WatchState;
use tf_core::infra::clock::{Clock, TokioClock};
use tf_core::infra::events::JobEvent;
use tf_core::infra::store::{JobStore, MemoryJobStore, SqliteJobStore, StoreError};
use tf_core::usecase::job_monitor::JobMonitor;

/// 読み取り時刻（監視開始からの秒数）を記録するストア
struct RecordingStore {
    inner: MemoryJobStore,
    origin: Instant,
    reads: Mutex<Vec<u64>>,
    write_delay: Duration,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryJobStore::new(),
            origin: Instant::now(),
            reads: Mutex::new(Vec::new()),
            write_delay: Duration::ZERO,
        }
    }

    /// 書き込みに時間がかかるストア
    fn with_write_delay(write_delay: Duration) -> Self {
        Self {
            write_delay,
            ..Self::new()
        }
    }

    fn read_offsets(&self) -> Vec<u64> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn read_job(&self, id: &str) -> Result<JobRecord, StoreError> {
        self.reads
            .lock()
            .unwrap()
            .push(self.origin.elapsed().as_secs());
        self.inner.read_job(id).await
    }

    async fn write_job_reset(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.inner.write_job_reset(id, at).await
    }
}

fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn running_job(store: &MemoryJobStore, id: &str, clock: &TokioClock) {
    store
        .insert(JobRecord::new(id.to_string(), JobStatus::InProgress, clock.now()))
        .await;
}

#[tokio::test(start_paused = true)]
async fn poll_cadence_switches_and_stops_at_ceiling() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(RecordingStore::new());
    running_job(&store.inner, "X", &clock).await;

    let settings = MonitorSettings {
        auto_reset_enabled: false,
        ..Default::default()
    };
    let monitor = JobMonitor::new(store.clone(), clock.clone(), settings).unwrap();
    let mut events = monitor.subscribe();
    let state = monitor
        .watch_job("X", JobKind::Video, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2000)).await;

    let mut expected: Vec<u64> = (0..=300).step_by(30).collect();
    expected.extend((360..900).step_by(60));
    assert_eq!(store.read_offsets(), expected);
    assert!(store.read_offsets().iter().all(|&t| t < 900));

    assert_eq!(state.borrow().as_str(), "expired");
    let events = drain(&mut events);
    assert!(events.contains(&JobEvent::WatchExpired {
        job_id: "X".to_string()
    }));
    assert_eq!(monitor.metrics().watches_expired, 1);
}

#[tokio::test(start_paused = true)]
async fn unwatch_stops_all_reads() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(RecordingStore::new());
    running_job(&store.inner, "X", &clock).await;

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let state = monitor
        .watch_job("X", JobKind::Voice, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(store.read_offsets(), vec![0, 30, 60, 90]);

    assert!(monitor.unwatch("X").await);
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(store.read_offsets().len(), 4);
    assert_eq!(
        *state.borrow(),
        WatchState::Cancelled {
            job_id: "X".to_string()
        }
    );
    assert_eq!(store.inner.reset_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unwatch_during_manual_reset_stops_all_reads() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(RecordingStore::with_write_delay(Duration::from_secs(10)));
    running_job(&store.inner, "X", &clock).await;

    let monitor = Arc::new(
        JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap(),
    );
    let state = monitor
        .watch_job("X", JobKind::Voice, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(305)).await;
    assert_eq!(state.borrow().severity(), Some(Severity::Stuck));

    let reset = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.reset_job("X").await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(state.borrow().as_str(), "resetting");

    assert!(monitor.unwatch("X").await);
    let reads_at_teardown = store.read_offsets().len();
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(store.read_offsets().len(), reads_at_teardown);
    assert_eq!(state.borrow().as_str(), "cancelled");
    let err = reset.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
    // 中断された書き込みはストアに届いていない
    assert_eq!(store.inner.reset_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_source_shows_working_until_ceiling() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryJobStore::new());
    running_job(&store, "X", &clock).await;
    store.fail_next_reads(1000);

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let mut events = monitor.subscribe();
    let state = monitor
        .watch_job("X", JobKind::Voice, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    let view = monitor.view("X").await.unwrap();
    assert_eq!(view.tone, StatusTone::Working);
    assert_eq!(view.title, "Generating narration");
    assert!(view.error.is_none());

    tokio::time::sleep(Duration::from_secs(1000)).await;
    assert_eq!(
        *state.borrow(),
        WatchState::Expired {
            job_id: "X".to_string(),
            last: None,
        }
    );
    assert_eq!(monitor.view("X").await.unwrap().tone, StatusTone::Expired);
    assert!(drain(&mut events).contains(&JobEvent::WatchExpired {
        job_id: "X".to_string()
    }));
    assert_eq!(monitor.metrics().read_failures, 20);
}

#[tokio::test(start_paused = true)]
async fn dropping_monitor_stops_polling() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(RecordingStore::new());
    running_job(&store.inner, "X", &clock).await;

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    monitor
        .watch_job("X", JobKind::Image, JobStatus::InProgress)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(35)).await;
    drop(monitor);
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(store.read_offsets(), vec![0, 30]);
}

#[tokio::test(start_paused = true)]
async fn server_progress_returns_severity_to_normal() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryJobStore::new());
    running_job(&store, "X", &clock).await;

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let mut events = monitor.subscribe();
    let state = monitor
        .watch_job("X", JobKind::Voice, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(state.borrow().severity(), Some(Severity::Warning));

    // ランナーが進捗を報告
    store.touch("X", clock.now()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    {
        let current = state.borrow();
        let snap = current.snapshot().unwrap();
        assert_eq!(snap.severity, Severity::Normal);
        assert_eq!(snap.elapsed_seconds, 25);
        assert_eq!(snap.watched_seconds, 210);
    }

    let events = drain(&mut events);
    assert!(events.contains(&JobEvent::SeverityChanged {
        job_id: "X".to_string(),
        from: Severity::Warning,
        to: Severity::Normal,
    }));

    // 進捗後の経過時間で再び閾値に達する（t=185 + 600 付近まで自動リセットしない）
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(store.reset_count(), 0);
    assert_eq!(state.borrow().severity(), Some(Severity::Stuck));
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stuck_job_is_reset_automatically() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryJobStore::new());
    running_job(&store, "X", &clock).await;

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let mut events = monitor.subscribe();
    let state = monitor
        .watch_job("X", JobKind::Voice, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(185)).await;
    assert_eq!(state.borrow().severity(), Some(Severity::Warning));
    assert!(!monitor.view("X").await.unwrap().can_reset);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(state.borrow().severity(), Some(Severity::Stuck));
    assert!(monitor.view("X").await.unwrap().can_reset);
    assert_eq!(store.reset_count(), 0);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(store.reset_count(), 1);
    assert_eq!(
        *state.borrow(),
        WatchState::Reset {
            job_id: "X".to_string(),
            confirmed: true,
        }
    );

    let record = store.read_job("X").await.unwrap();
    assert_eq!(record.status, JobStatus::NotStarted);
    assert!(record.output.is_none());

    let events = drain(&mut events);
    assert!(events.contains(&JobEvent::ReloadRequested {
        job_id: "X".to_string(),
        confirmed: true,
    }));

    // リセット後はポーリングもリセットも増えない
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(store.reset_count(), 1);
    assert_eq!(monitor.metrics().resets.automatic, 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_reset_leaves_job_for_manual_retry() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryJobStore::new());
    running_job(&store, "X", &clock).await;
    store.reject_writes(true);

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let mut events = monitor.subscribe();
    monitor
        .watch_job("X", JobKind::Image, JobStatus::InProgress)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(605)).await;
    let view = monitor.view("X").await.unwrap();
    assert!(view.can_reset);
    assert!(view.error.is_some());
    assert!(events_contain_reset_failure(&drain(&mut events)));

    store.reject_writes(false);
    let outcome = monitor.reset_job("X").await.unwrap();
    assert!(outcome.confirmed);
    assert!(store.get("X").await.unwrap().is_reset());
    assert_eq!(monitor.metrics().resets.manual, 1);
    assert_eq!(monitor.metrics().resets.failed, 1);
}

fn events_contain_reset_failure(events: &[JobEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, JobEvent::ResetFailed { job_id, .. } if job_id == "X"))
}

#[tokio::test(start_paused = true)]
async fn two_monitors_racing_reset_end_in_same_state() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryJobStore::new());
    running_job(&store, "X", &clock).await;

    let tab_a = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let tab_b = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    tab_a
        .watch_job("X", JobKind::Video, JobStatus::InProgress)
        .await
        .unwrap();
    tab_b
        .watch_job("X", JobKind::Video, JobStatus::InProgress)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(700)).await;

    assert!(store.reset_count() >= 1);
    assert!(store.get("X").await.unwrap().is_reset());
}

#[tokio::test(start_paused = true)]
async fn completion_on_sqlite_store() {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    let record = store.create_job(JobStatus::InProgress, clock.now()).unwrap();

    let monitor = JobMonitor::new(store.clone(), clock.clone(), MonitorSettings::default()).unwrap();
    let mut events = monitor.subscribe();
    let state = monitor
        .watch_job(&record.id, JobKind::Image, JobStatus::InProgress)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(40)).await;
    store
        .update_job(
            &record.id,
            JobStatus::Completed,
            Some("https://cdn.example/scene-3.png"),
            clock.now(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        *state.borrow(),
        WatchState::Completed {
            job_id: record.id.clone(),
            output: Some("https://cdn.example/scene-3.png".to_string()),
        }
    );
    let view = monitor.view(&record.id).await.unwrap();
    assert_eq!(view.progress_percent, Some(100));
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.name() == tf_core::infra::events::JOB_COMPLETED));
    assert_eq!(monitor.cleanup_finished().await, 1);
}
