//! クライアント側から見た1ジョブの監視状態。
//!
//! フラグの組み合わせではなく単一の列挙型で表し、遷移は `WatchState::reduce`
//! だけが行う。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::AppError;
use super::job::{JobRecord, JobStatus};
use super::severity::{Severity, SeverityThresholds};

/// in_progress 中のジョブについて保持する一時状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchSnapshot {
    pub job_id: String,
    /// サーバーの updated_at からの経過秒数（深刻度の入力）
    pub elapsed_seconds: u64,
    /// 監視開始からの経過秒数（ポーリング間隔と上限にのみ使う）
    pub watched_seconds: u64,
    pub severity: Severity,
    pub last_updated_at: DateTime<Utc>,
    pub auto_reset_attempted: bool,
    pub reset_error: Option<AppError>,
}

impl WatchSnapshot {
    fn fresh(
        record: &JobRecord,
        now: DateTime<Utc>,
        watched: Duration,
        thresholds: &SeverityThresholds,
    ) -> Self {
        let elapsed_seconds = record.staleness_secs(now);
        Self {
            job_id: record.id.clone(),
            elapsed_seconds,
            watched_seconds: watched.as_secs(),
            severity: thresholds.classify(elapsed_seconds),
            last_updated_at: record.updated_at,
            auto_reset_attempted: false,
            reset_error: None,
        }
    }

    fn observe(
        mut self,
        record: &JobRecord,
        now: DateTime<Utc>,
        watched: Duration,
        thresholds: &SeverityThresholds,
    ) -> Self {
        if record.updated_at > self.last_updated_at {
            // サーバー側で進捗があったので最初から数え直す
            return Self::fresh(record, now, watched, thresholds);
        }
        self.elapsed_seconds = record.staleness_secs(now);
        self.watched_seconds = watched.as_secs();
        self.severity = self.severity.max(thresholds.classify(self.elapsed_seconds));
        self
    }
}

/// 監視状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchState {
    /// 監視開始直後でまだ読み取りに成功していない。稼働中として扱う
    Awaiting { job_id: String },
    /// in_progress ではない（not_started / pending）
    Idle { job_id: String, status: JobStatus },
    Watching(WatchSnapshot),
    Resetting(WatchSnapshot),
    Reset { job_id: String, confirmed: bool },
    Completed { job_id: String, output: Option<String> },
    Failed { job_id: String },
    /// 監視上限に達しポーリングを止めた。一度も読めなかった場合 last は None
    Expired {
        job_id: String,
        last: Option<WatchSnapshot>,
    },
    /// ホスト側のアンマウント
    Cancelled { job_id: String },
}

/// 状態遷移イベント
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Observed {
        record: JobRecord,
        now: DateTime<Utc>,
        watched: Duration,
    },
    ResetStarted { automatic: bool },
    ResetFinished { confirmed: bool },
    ResetFailed(AppError),
    CeilingReached,
    Cancelled,
}

impl WatchState {
    /// 監視開始前の初期状態。in_progress のヒントなら読み取り待ち
    pub fn initial(job_id: impl Into<String>, status: JobStatus) -> Self {
        let job_id = job_id.into();
        match status {
            JobStatus::InProgress => Self::Awaiting { job_id },
            status => Self::Idle { job_id, status },
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Awaiting { job_id }
            | Self::Idle { job_id, .. }
            | Self::Reset { job_id, .. }
            | Self::Expired { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id }
            | Self::Cancelled { job_id } => job_id,
            Self::Watching(s) | Self::Resetting(s) => &s.job_id,
        }
    }

    pub fn snapshot(&self) -> Option<&WatchSnapshot> {
        match self {
            Self::Watching(s) | Self::Resetting(s) => Some(s),
            Self::Expired { last, .. } => last.as_ref(),
            _ => None,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        self.snapshot().map(|s| s.severity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awaiting { .. } => "awaiting",
            Self::Idle { .. } => "idle",
            Self::Watching(_) => "watching",
            Self::Resetting(_) => "resetting",
            Self::Reset { .. } => "reset",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Expired { .. } => "expired",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// ポーリングを続けるべき状態か
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Awaiting { .. } | Self::Watching(_) | Self::Resetting(_)
        )
    }

    fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Reset { .. }
                | Self::Completed { .. }
                | Self::Failed { .. }
                | Self::Expired { .. }
                | Self::Cancelled { .. }
        )
    }

    /// 唯一の状態遷移関数
    pub fn reduce(self, event: WatchEvent, thresholds: &SeverityThresholds) -> Self {
        match event {
            WatchEvent::Observed {
                record,
                now,
                watched,
            } => self.observe(record, now, watched, thresholds),
            WatchEvent::ResetStarted { automatic } => match self {
                Self::Watching(mut s) => {
                    s.auto_reset_attempted |= automatic;
                    s.reset_error = None;
                    Self::Resetting(s)
                }
                other => other,
            },
            WatchEvent::ResetFinished { confirmed } => match self {
                Self::Resetting(s) => Self::Reset {
                    job_id: s.job_id,
                    confirmed,
                },
                other => other,
            },
            WatchEvent::ResetFailed(error) => match self {
                Self::Resetting(mut s) => {
                    s.reset_error = Some(error);
                    Self::Watching(s)
                }
                other => other,
            },
            WatchEvent::CeilingReached => match self {
                Self::Watching(s) => Self::Expired {
                    job_id: s.job_id.clone(),
                    last: Some(s),
                },
                Self::Awaiting { job_id } => Self::Expired { job_id, last: None },
                other => other,
            },
            WatchEvent::Cancelled => {
                if self.is_settled() {
                    self
                } else {
                    Self::Cancelled {
                        job_id: self.job_id().to_string(),
                    }
                }
            }
        }
    }

    fn observe(
        self,
        record: JobRecord,
        now: DateTime<Utc>,
        watched: Duration,
        thresholds: &SeverityThresholds,
    ) -> Self {
        let same_job = self.job_id() == record.id;

        // 同じ試行の終端状態とリセット処理中は読み取り結果で上書きしない
        if same_job && (self.is_settled() || matches!(self, Self::Resetting(_))) {
            return self;
        }

        match record.status {
            JobStatus::InProgress => {
                let snapshot = match self {
                    Self::Watching(prev) if same_job => {
                        prev.observe(&record, now, watched, thresholds)
                    }
                    _ => WatchSnapshot::fresh(&record, now, watched, thresholds),
                };
                Self::Watching(snapshot)
            }
            JobStatus::Completed => Self::Completed {
                job_id: record.id,
                output: record.output,
            },
            JobStatus::Failed => Self::Failed { job_id: record.id },
            status @ (JobStatus::NotStarted | JobStatus::Pending) => Self::Idle {
                job_id: record.id,
                status,
            },
        }
    }
}
