use serde::Serialize;

use super::error::AppError;
use super::job::{JobKind, JobStatus};
use super::severity::Severity;
use super::watch::{WatchSnapshot, WatchState};

/// 進捗バーの上限（完了前に100%を見せない）
const RUNNING_PROGRESS_CAP: u8 = 95;

/// 表示トーン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTone {
    Idle,
    Working,
    Warning,
    Stuck,
    Resetting,
    Success,
    Error,
    Expired,
}

impl StatusTone {
    /// フロントエンドのアイコン名
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Idle => "circle",
            Self::Working => "loader",
            Self::Warning => "clock",
            Self::Stuck => "alert-triangle",
            Self::Resetting => "refresh-cw",
            Self::Success => "check-circle",
            Self::Error => "x-circle",
            Self::Expired => "timer-off",
        }
    }
}

/// ステータス表示モデル（描画側はこれをそのまま使う）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub tone: StatusTone,
    pub icon: &'static str,
    pub title: String,
    pub message: String,
    pub elapsed_label: Option<String>,
    pub progress_percent: Option<u8>,
    pub can_reset: bool,
    pub is_resetting: bool,
    pub error: Option<AppError>,
}

impl StatusView {
    fn new(tone: StatusTone, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tone,
            icon: tone.icon(),
            title: title.into(),
            message: message.into(),
            elapsed_label: None,
            progress_percent: None,
            can_reset: false,
            is_resetting: false,
            error: None,
        }
    }

    /// 監視状態から表示モデルを組み立てる
    pub fn project(kind: JobKind, state: &WatchState) -> Self {
        let label = kind.label();
        match state {
            // 読み取りが失敗し続けても「生成中」のまま見せる
            WatchState::Awaiting { .. }
            | WatchState::Idle {
                status: JobStatus::InProgress,
                ..
            } => Self::new(
                StatusTone::Working,
                format!("Generating {label}"),
                "Checking the latest status...",
            ),
            WatchState::Idle { status, .. } => match status {
                JobStatus::Pending => {
                    Self::new(StatusTone::Idle, "Queued", format!("Your {label} is queued."))
                }
                _ => Self::new(
                    StatusTone::Idle,
                    "Not started",
                    format!("Start generation to create your {label}."),
                ),
            },
            WatchState::Watching(s) => Self::watching(kind, s),
            WatchState::Resetting(s) => {
                let mut view = Self::new(
                    StatusTone::Resetting,
                    "Resetting",
                    format!("Clearing the stalled {label} job..."),
                );
                view.elapsed_label = Some(format_elapsed(s.elapsed_seconds));
                view.is_resetting = true;
                view
            }
            WatchState::Reset { confirmed, .. } => {
                let message = if *confirmed {
                    format!("The {label} job was reset. You can try again.")
                } else {
                    "Reset sent. Refreshing to confirm the latest status.".to_string()
                };
                Self::new(StatusTone::Idle, "Ready to retry", message)
            }
            WatchState::Completed { .. } => {
                let mut view = Self::new(
                    StatusTone::Success,
                    format!("{} ready", capitalize(label)),
                    format!("Your {label} has been generated."),
                );
                view.progress_percent = Some(100);
                view
            }
            WatchState::Failed { .. } => Self::new(
                StatusTone::Error,
                "Generation failed",
                format!("The {label} could not be generated. Please try again."),
            ),
            WatchState::Expired { last: None, .. } => Self::new(
                StatusTone::Expired,
                "Stopped checking",
                "We could not reach the job status. Refresh to see the latest status.",
            ),
            WatchState::Expired { last: Some(s), .. } => {
                let mut view = Self::new(
                    StatusTone::Expired,
                    "Stopped checking",
                    format!(
                        "We stopped checking after {}. Refresh to see the latest status.",
                        format_elapsed(s.watched_seconds)
                    ),
                );
                view.elapsed_label = Some(format_elapsed(s.elapsed_seconds));
                view.can_reset = s.severity.allows_manual_reset();
                view
            }
            WatchState::Cancelled { .. } => Self::new(StatusTone::Idle, "Not watching", ""),
        }
    }

    fn watching(kind: JobKind, s: &WatchSnapshot) -> Self {
        let label = kind.label();
        let elapsed = format_elapsed(s.elapsed_seconds);
        let mut view = match s.severity {
            Severity::Normal => Self::new(
                StatusTone::Working,
                format!("Generating {label}"),
                format!(
                    "This usually takes about {}.",
                    format_elapsed(typical_duration_secs(kind))
                ),
            ),
            Severity::Warning => Self::new(
                StatusTone::Warning,
                "Still working",
                "This is taking longer than usual.",
            ),
            Severity::Stuck => Self::new(
                StatusTone::Stuck,
                "Generation appears stuck",
                format!("No progress for {elapsed}. You can reset and try again."),
            ),
            Severity::AutoReset if s.reset_error.is_some() => Self::new(
                StatusTone::Stuck,
                "Generation stalled",
                "Automatic reset failed. Try resetting manually.",
            ),
            Severity::AutoReset => Self::new(
                StatusTone::Stuck,
                "Generation stalled",
                "Resetting automatically so you can try again.",
            ),
        };
        view.elapsed_label = Some(elapsed);
        view.progress_percent = Some(estimate_progress(kind, s.watched_seconds));
        view.can_reset = s.severity.allows_manual_reset();
        view.error = s.reset_error.clone();
        view
    }
}

fn typical_duration_secs(kind: JobKind) -> u64 {
    match kind {
        JobKind::Voice => 90,
        JobKind::Image => 45,
        JobKind::Video => 240,
    }
}

fn estimate_progress(kind: JobKind, watched_secs: u64) -> u8 {
    let pct = watched_secs.saturating_mul(100) / typical_duration_secs(kind);
    pct.min(RUNNING_PROGRESS_CAP as u64) as u8
}

/// 経過秒数を "3m 05s" 形式に整形
pub fn format_elapsed(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
