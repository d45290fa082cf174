use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ジョブ状態（外部ランナーが更新する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// この試行における終端状態か
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ジョブ種別（表示文言の切り替えにのみ使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Voice,
    Image,
    Video,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Voice => "narration",
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// リモートストア上のジョブレコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    /// 唯一の生存シグナル（ハートビートは存在しない）
    pub updated_at: DateTime<Utc>,
    pub output: Option<String>,
}

impl JobRecord {
    pub fn new(id: String, status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            updated_at: now,
            output: None,
        }
    }

    /// 最終更新からの経過秒数。時計のずれで負になる場合は 0
    pub fn staleness_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.updated_at).num_seconds().max(0) as u64
    }

    /// リセット済み（not_started かつ出力なし）か
    pub fn is_reset(&self) -> bool {
        self.status == JobStatus::NotStarted && self.output.is_none()
    }
}
