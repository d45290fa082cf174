use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::error::AppError;
use crate::domain::job::JobStatus;
use crate::domain::severity::Severity;

/// イベント名定数
pub const JOB_PROGRESS: &str = "job_progress";
pub const JOB_SEVERITY_CHANGED: &str = "job_severity_changed";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const JOB_RESET_FAILED: &str = "job_reset_failed";
pub const JOB_RELOAD_REQUESTED: &str = "job_reload_requested";
pub const JOB_WATCH_EXPIRED: &str = "job_watch_expired";
pub const JOB_WATCH_CANCELLED: &str = "job_watch_cancelled";

const DEFAULT_CAPACITY: usize = 256;

/// ジョブ監視イベント（ホスト側の購読者へ配信する）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// 読み取り成功ごとに送る
    Progress {
        job_id: String,
        elapsed_seconds: u64,
        watched_seconds: u64,
        severity: Severity,
        status: JobStatus,
    },
    SeverityChanged {
        job_id: String,
        from: Severity,
        to: Severity,
    },
    Completed {
        job_id: String,
        output: Option<String>,
    },
    Failed {
        job_id: String,
    },
    /// トースト表示用（再試行可能）
    ResetFailed {
        job_id: String,
        error: AppError,
    },
    /// リセット後にホストへ再読み込みを促す
    ReloadRequested {
        job_id: String,
        confirmed: bool,
    },
    WatchExpired {
        job_id: String,
    },
    WatchCancelled {
        job_id: String,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => JOB_PROGRESS,
            Self::SeverityChanged { .. } => JOB_SEVERITY_CHANGED,
            Self::Completed { .. } => JOB_COMPLETED,
            Self::Failed { .. } => JOB_FAILED,
            Self::ResetFailed { .. } => JOB_RESET_FAILED,
            Self::ReloadRequested { .. } => JOB_RELOAD_REQUESTED,
            Self::WatchExpired { .. } => JOB_WATCH_EXPIRED,
            Self::WatchCancelled { .. } => JOB_WATCH_CANCELLED,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Progress { job_id, .. }
            | Self::SeverityChanged { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id }
            | Self::ResetFailed { job_id, .. }
            | Self::ReloadRequested { job_id, .. }
            | Self::WatchExpired { job_id }
            | Self::WatchCancelled { job_id } => job_id,
        }
    }
}

/// アプリ内スコープのイベントバス（購読者ごとに全イベントが届く）
#[derive(Clone)]
pub struct JobEventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// 統一イベント送信関数
    pub fn emit(&self, event: JobEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            log::debug!("購読者なし、イベント破棄 [{name}]");
        }
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
